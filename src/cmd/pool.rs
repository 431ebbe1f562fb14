//! Port pool inspection: `conductor pool`.

use std::path::Path;

use anyhow::Result;
use conductor::pool::{PortPool, ports_for_slot};

use super::super::PoolCommands;
use super::open_project;

pub async fn cmd_pool(project_dir: &Path, command: PoolCommands) -> Result<()> {
    let (config, db) = open_project(project_dir, None)?;
    let pool = PortPool::new(db, config.toml.ports).await?;

    match command {
        PoolCommands::List => {
            let slots = pool.slots().await?;
            let reserved: Vec<_> = slots.iter().filter(|s| s.reserved_by.is_some()).collect();
            println!(
                "Port pool: {}/{} slots reserved",
                reserved.len(),
                pool.capacity()
            );
            if reserved.is_empty() {
                return Ok(());
            }
            println!();
            println!(
                "{:<6} {:<8} {:<9} {:<38} Since",
                "Slot", "Backend", "Frontend", "Execution"
            );
            for slot in reserved {
                let ports = ports_for_slot(&config.toml.ports, slot.slot_index)?;
                println!(
                    "{:<6} {:<8} {:<9} {:<38} {}",
                    slot.slot_index,
                    ports.backend,
                    ports.frontend,
                    slot.reserved_by.as_deref().unwrap_or("-"),
                    slot.reserved_at.as_deref().unwrap_or("-")
                );
            }
        }
        PoolCommands::Release { execution_id } => {
            if pool.release(&execution_id).await? {
                println!("Released port slot held by {}", execution_id);
            } else {
                println!("Execution {} holds no port slot", execution_id);
            }
        }
    }
    Ok(())
}
