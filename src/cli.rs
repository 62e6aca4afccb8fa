//! Minimal CLI parsing for the organizer binary.

use std::env;

use drive_organizer::services::logging::LogFormat;

pub const USAGE: &str = "\
Usage: drive-organizer [OPTIONS]

Options:
  --folder <id>        Folder to analyze (default: ROOT_FOLDER_ID)
  --name <name>        Display name for the task
  --json               Print the finished task as JSON
  --apply              Move files into the suggested group folders
  --log-format <fmt>   pretty (default) or json
  -h, --help           Show this help";

#[derive(Debug, Default)]
pub struct CliOptions {
    pub folder: Option<String>,
    pub name: Option<String>,
    pub json: bool,
    pub apply: bool,
    pub log_format: LogFormat,
    pub help: bool,
}

impl CliOptions {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = CliOptions::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => options.json = true,
                "--apply" => options.apply = true,
                "-h" | "--help" => options.help = true,
                "--folder" => options.folder = args.next(),
                "--name" => options.name = args.next(),
                "--log-format" => {
                    if let Some(value) = args.next() {
                        options.log_format = value.parse().unwrap_or_default();
                    }
                }
                _ if arg.starts_with("--folder=") => {
                    options.folder = arg.split_once('=').map(|(_, v)| v.to_string());
                }
                _ if arg.starts_with("--name=") => {
                    options.name = arg.split_once('=').map(|(_, v)| v.to_string());
                }
                _ if arg.starts_with("--log-format=") => {
                    if let Some(value) = arg.split_once('=').map(|(_, v)| v) {
                        options.log_format = value.parse().unwrap_or_default();
                    }
                }
                _ => {}
            }
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliOptions {
        CliOptions::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_flags() {
        let options = parse(&["--folder", "Movies", "--name=My Movies", "--json", "--apply"]);
        assert_eq!(options.folder.as_deref(), Some("Movies"));
        assert_eq!(options.name.as_deref(), Some("My Movies"));
        assert!(options.json);
        assert!(options.apply);
        assert_eq!(options.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_unknown_flags_are_ignored() {
        let options = parse(&["--bogus", "--log-format=json"]);
        assert!(options.folder.is_none());
        assert_eq!(options.log_format, LogFormat::Json);
    }
}
