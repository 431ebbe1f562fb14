//! Workspace maintenance: `conductor workspace`.

use std::path::Path;

use anyhow::{Result, bail};
use conductor::workspace::WorkspaceManager;

use super::super::WorkspaceCommands;
use super::open_project;

pub async fn cmd_workspace(project_dir: &Path, command: WorkspaceCommands) -> Result<()> {
    let (config, db) = open_project(project_dir, None)?;
    let manager = WorkspaceManager::new(
        db.clone(),
        &config.project_dir,
        &config.workspace_root(),
        config.toml.workspace.clone(),
    )?;

    let execution_id = match &command {
        WorkspaceCommands::Validate { execution_id } | WorkspaceCommands::Remove { execution_id } => {
            execution_id.clone()
        }
    };
    let id = execution_id.clone();
    if db.call(move |db| db.get_execution(&id)).await?.is_none() {
        bail!("Execution '{}' not found", execution_id);
    }

    match command {
        WorkspaceCommands::Validate { .. } => {
            let outcome = manager.validate(&execution_id).await?;
            if !outcome.is_usable() {
                bail!("Workspace for {} is {}", execution_id, outcome);
            }
            println!("Workspace for {} is {}", execution_id, outcome);
        }
        WorkspaceCommands::Remove { .. } => {
            manager.remove(&execution_id).await;
            println!("Removed workspace for {}", execution_id);
        }
    }
    Ok(())
}
