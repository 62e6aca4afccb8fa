//! Filename parser for release-style media names
//!
//! Pulls a display title, year and season/episode markers out of names like:
//! - "The.Wandering.Earth.2019.1080p.BluRay.x264.mkv"
//! - "[Group] Chicago Fire S14E08 1080p WEB h264-ETHEL.mkv"
//! - "Corner Gas 6x12 Super Sensitive.avi"

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static BRACKET_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[\[【(（][^\]】)）]*[\]】)）]\s*").unwrap());

static SXXEXX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bS(\d{1,2})\s*E(\d{1,3})\b").unwrap());

static NXNN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").unwrap());

static SEASON_ONLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:S(\d{1,2})|Season\s*(\d{1,2}))\b").unwrap());

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());

static QUALITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(2160p|1080p|1080i|720p|480p|4k|uhd|bluray|blu-ray|bdrip|brrip|web-?dl|webrip|hdtv|dvdrip|remux|x264|x265|h\.?264|h\.?265|hevc|hdr10?|dts|aac|atmos|proper|repack)\b",
    )
    .unwrap()
});

static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// What we could learn from a filename
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTitle {
    /// Human-readable title, e.g. "The Wandering Earth"
    pub title: String,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl ParsedTitle {
    /// Key used to decide that two files belong together
    pub fn group_key(&self) -> String {
        normalize_title(&self.title)
    }

    /// Folder-friendly group name: "Title (Year)"
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) if self.season.is_none() => format!("{} ({year})", self.title),
            _ => self.title.clone(),
        }
    }

    pub fn is_episode(&self) -> bool {
        self.season.is_some()
    }
}

/// Parse a filename (with or without extension) into a title and markers
pub fn parse_title(filename: &str) -> ParsedTitle {
    let stem = match filename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.len() <= 4 && !ext.contains(' ') => stem,
        _ => filename,
    };

    let mut cleaned = stem.to_string();
    while let Some(m) = BRACKET_TAG_RE.find(&cleaned) {
        if m.end() >= cleaned.len() {
            break;
        }
        cleaned = cleaned[m.end()..].to_string();
    }
    let cleaned = cleaned.replace(['.', '_'], " ");

    let mut result = ParsedTitle::default();
    let mut cut = cleaned.len();

    if let Some(caps) = SXXEXX_RE.captures(&cleaned).or_else(|| NXNN_RE.captures(&cleaned)) {
        result.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
        result.episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        if let Some(m) = caps.get(0) {
            cut = cut.min(m.start());
        }
    } else if let Some(caps) = SEASON_ONLY_RE.captures(&cleaned) {
        result.season = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok());
        if let Some(m) = caps.get(0) {
            cut = cut.min(m.start());
        }
    }

    // A year at the very start is usually part of the title ("2012", "1917")
    if let Some(m) = YEAR_RE.find_iter(&cleaned).find(|m| m.start() > 0) {
        result.year = m.as_str().parse().ok();
        cut = cut.min(m.start());
    }
    if let Some(m) = QUALITY_RE.find(&cleaned) {
        cut = cut.min(m.start());
    }

    let title = cleaned[..cut]
        .trim_matches(|c: char| c.is_whitespace() || c == '-' || c == '(' || c == '[');
    let title = SPACE_RE.replace_all(title, " ").trim().to_string();
    result.title = if title.is_empty() {
        SPACE_RE.replace_all(cleaned.trim(), " ").to_string()
    } else {
        title
    };

    result
}

/// Lowercase, drop a leading article and punctuation, squeeze spaces
pub fn normalize_title(name: &str) -> String {
    let mut normalized = name.to_lowercase();

    for article in ["the ", "a ", "an "] {
        if let Some(rest) = normalized.strip_prefix(article) {
            normalized = rest.to_string();
            break;
        }
    }

    let normalized: String = normalized
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    SPACE_RE.replace_all(&normalized, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_movie_with_year_and_quality() {
        let parsed = parse_title("The.Wandering.Earth.2019.1080p.BluRay.x264.mkv");
        assert_eq!(parsed.title, "The Wandering Earth");
        assert_eq!(parsed.year, Some(2019));
        assert_eq!(parsed.display_name(), "The Wandering Earth (2019)");
        assert!(!parsed.is_episode());
    }

    #[test]
    fn test_episode_with_group_tag() {
        let parsed = parse_title("[Group] Chicago Fire S14E08 1080p WEB h264-ETHEL.mkv");
        assert_eq!(parsed.title, "Chicago Fire");
        assert_eq!(parsed.season, Some(14));
        assert_eq!(parsed.episode, Some(8));
        assert_eq!(parsed.display_name(), "Chicago Fire");
    }

    #[test]
    fn test_nxnn_episode() {
        let parsed = parse_title("Corner Gas 6x12 Super Sensitive.avi");
        assert_eq!(parsed.title, "Corner Gas");
        assert_eq!((parsed.season, parsed.episode), (Some(6), Some(12)));
    }

    #[test]
    fn test_leading_year_is_title() {
        let parsed = parse_title("1917.2019.2160p.mkv");
        assert_eq!(parsed.title, "1917");
        assert_eq!(parsed.year, Some(2019));
    }

    #[test]
    fn test_cjk_title() {
        let parsed = parse_title("流浪地球.2019.1080p.mkv");
        assert_eq!(parsed.title, "流浪地球");
        assert_eq!(parsed.group_key(), "流浪地球");
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("The Office (US)"), "office us");
        assert_eq!(normalize_title("  Lost!!  "), "lost");
    }
}
