//! Project initialization, feature submission and status commands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use conductor::store::FeatureSpec;

use super::open_project;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use conductor::config::init_project;

    let result = init_project(project_dir)?;
    if result.created {
        println!(
            "Initialized conductor project at {}",
            result.conductor_dir.display()
        );
        println!();
        println!("Created:");
        println!("  .conductor/");
        println!("  ├── conductor.toml  # Configuration (see `conductor config show`)");
        println!("  ├── conductor.db    # Task store");
        println!("  └── .gitignore");
        println!();
        println!("Next steps:");
        println!("  1. Run `conductor submit <feature.json>` to add a task graph");
        println!("  2. Run `conductor run` to start launching ready tasks");
    } else {
        println!(
            "Conductor project already initialized at {}",
            result.conductor_dir.display()
        );
        println!("Configuration and database verified.");
    }
    Ok(())
}

/// Parse a feature file: TOML when the extension says so, JSON otherwise.
pub fn load_feature_spec(path: &Path) -> Result<FeatureSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feature file: {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML feature file: {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON feature file: {}", path.display()))
    }
}

pub async fn cmd_submit(project_dir: &Path, file: &Path) -> Result<()> {
    let (_config, db) = open_project(project_dir, None)?;
    let spec = load_feature_spec(file)?;
    let feature_id = spec.feature_id.clone();
    let tasks = db.call(move |db| db.submit_feature(&spec)).await?;

    println!("Submitted feature '{}' with {} tasks", feature_id, tasks.len());
    println!();
    println!("{:<5} {:<10} {:<8} Title", "Seq", "Kind", "Depends");
    println!("{:<5} {:<10} {:<8} -----", "---", "----", "-------");
    for task in &tasks {
        println!(
            "{:<5} {:<10} {:<8} {}",
            task.sequence_number,
            task.kind,
            format_deps(&task.depends_on),
            task.title
        );
    }
    println!();
    println!("Run `conductor run` to start launching ready tasks.");
    Ok(())
}

pub async fn cmd_status(project_dir: &Path, feature_id: Option<&str>) -> Result<()> {
    let (_config, db) = open_project(project_dir, None)?;

    let Some(feature_id) = feature_id else {
        let overview = db
            .call(|db| {
                let mut rows = Vec::new();
                for feature in db.list_features()? {
                    let progress = db.feature_progress(&feature.feature_id)?;
                    rows.push((feature, progress));
                }
                Ok(rows)
            })
            .await?;

        if overview.is_empty() {
            println!("No features submitted. Run `conductor submit <file>` to add one.");
            return Ok(());
        }
        println!("{:<24} {:<12} {:>5}  Tasks", "Feature", "Status", "Total");
        println!("{:<24} {:<12} {:>5}  -----", "-------", "------", "-----");
        for (feature, progress) in overview {
            let counts: Vec<String> = progress
                .counts
                .iter()
                .map(|(status, n)| format!("{} {}", n, status))
                .collect();
            println!(
                "{:<24} {:<12} {:>5}  {}",
                feature.feature_id,
                feature.status.as_str(),
                progress.total,
                counts.join(", ")
            );
        }
        return Ok(());
    };

    let id = feature_id.to_string();
    let (feature, tasks, messages) = db
        .call(move |db| {
            let feature = db.get_feature(&id)?;
            let tasks = db.get_tasks_for_feature(&id)?;
            let messages = db.recent_status_messages(&id, 5)?;
            Ok((feature, tasks, messages))
        })
        .await?;
    let Some(feature) = feature else {
        bail!("Feature '{}' not found", feature_id);
    };

    println!("Feature: {} ({})", feature.feature_id, feature.status.as_str());
    if !feature.title.is_empty() {
        println!("Title: {}", feature.title);
    }
    println!();
    println!(
        "{:<5} {:<10} {:<10} {:<8} {:<4} Title",
        "Seq", "Kind", "Status", "Depends", "Pri"
    );
    println!(
        "{:<5} {:<10} {:<10} {:<8} {:<4} -----",
        "---", "----", "------", "-------", "---"
    );
    for task in &tasks {
        println!(
            "{:<5} {:<10} {:<10} {:<8} {:<4} {}",
            task.sequence_number,
            task.kind,
            task.status,
            format_deps(&task.depends_on),
            task.priority,
            task.title
        );
    }

    if !messages.is_empty() {
        println!();
        println!("Recent messages (newest first):");
        for message in &messages {
            println!("  {}", message);
        }
    }
    Ok(())
}

pub async fn cmd_ready(project_dir: &Path) -> Result<()> {
    let (_config, db) = open_project(project_dir, None)?;
    let tasks = db.call(|db| db.ready_tasks(None)).await?;

    if tasks.is_empty() {
        println!("No ready tasks.");
        return Ok(());
    }
    println!("{:<24} {:<5} {:<4} {:<10} Title", "Feature", "Seq", "Pri", "Kind");
    println!("{:<24} {:<5} {:<4} {:<10} -----", "-------", "---", "---", "----");
    for task in &tasks {
        println!(
            "{:<24} {:<5} {:<4} {:<10} {}",
            task.feature_id, task.sequence_number, task.priority, task.kind, task.title
        );
    }
    Ok(())
}

fn format_deps(deps: &[i64]) -> String {
    if deps.is_empty() {
        "-".to_string()
    } else {
        deps.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
    }
}
