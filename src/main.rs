//! Drive Organizer - analyze a folder and optionally organize it
//!
//! Submits one folder analysis job, polls it until it finishes and prints
//! the grouping. Ctrl-C cancels the running job.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use drive_organizer::services::logging::init_tracing;
use drive_organizer::services::storage::LocalStorage;
use drive_organizer::services::task_queue::{Task, TaskStatus};
use drive_organizer::{App, Config};
use uuid::Uuid;

use crate::cli::{CliOptions, USAGE};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let options = CliOptions::from_args();
    if options.help {
        println!("{USAGE}");
        return Ok(());
    }

    init_tracing(options.log_format)?;
    let config = Config::from_env()?;
    tracing::info!(storage_root = %config.storage_root, "Configuration loaded");

    tokio::fs::create_dir_all(&config.storage_root)
        .await
        .with_context(|| format!("Failed to create storage root {}", config.storage_root))?;
    let storage = Arc::new(LocalStorage::new(&config.storage_root, &config.root_folder_id));

    let folder_id = options
        .folder
        .clone()
        .unwrap_or_else(|| config.root_folder_id.clone());
    let folder_name = options.name.clone().unwrap_or_else(|| folder_id.clone());

    let app = App::builder(config).without_maintenance().start(storage);
    let task_id = app.submit(&folder_id, &folder_name)?;

    let task = tokio::select! {
        task = wait_for_task(&app, task_id) => task,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(task_id = %task_id, "Interrupted, cancelling task");
            app.cancel(task_id);
            wait_for_task(&app, task_id).await
        }
    };
    let task = match task {
        Ok(task) => task,
        Err(e) => {
            app.shutdown().await;
            return Err(e);
        }
    };

    print_task(&task, options.json)?;

    if options.apply && task.status == TaskStatus::Completed {
        if let Some(result) = &task.result {
            let report = app.organize(&folder_id, result).await;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Organized: {} moved, {} renamed, {} failed groups",
                    report.moved, report.renamed, report.failed
                );
            }
        }
    }

    app.shutdown().await;

    if task.status != TaskStatus::Completed {
        bail!(
            "Task {} ended as {}: {}",
            task.task_id,
            task.status,
            task.error.as_deref().unwrap_or("no details")
        );
    }
    Ok(())
}

/// Poll until the task reaches a terminal state
async fn wait_for_task(app: &App, task_id: Uuid) -> Result<Task> {
    let mut last_progress = -1.0_f32;
    loop {
        let task = app
            .status(task_id)
            .with_context(|| format!("Task {task_id} disappeared"))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if task.progress > last_progress {
            last_progress = task.progress;
            tracing::info!(
                task_id = %task_id,
                status = %task.status,
                progress = task.progress,
                "Task progress"
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_task(task: &Task, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
        return Ok(());
    }

    println!("Task {} [{}] {}", task.task_id, task.status, task.folder_name);
    if let Some(secs) = task.duration_secs() {
        println!("Duration: {secs:.1}s");
    }
    if let Some(error) = &task.error {
        println!("Error: {error}");
    }
    if let Some(result) = &task.result {
        println!("{} media files, {}", result.count, result.size);
        if result.skipped_folders > 0 {
            println!("Warning: {} folders could not be listed", result.skipped_folders);
        }
        for group in &result.groups {
            println!("  {} ({} files)", group.name, group.file_ids.len());
        }
    }
    Ok(())
}
