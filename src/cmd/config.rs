//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use conductor::config::{CONDUCTOR_DIR, CONFIG_FILE, ConductorConfig, ConductorToml};

    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let config_path = conductor_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = ConductorConfig::new(project_dir.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  concurrency_limit = {}", config.concurrency_limit());
            println!("  worker_cmd = \"{}\"", config.worker_cmd());
            println!("  workspace_root = \"{}\"", config.workspace_root().display());
            println!("  database = \"{}\"", config.db_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&conductor_dir)?;
            ConductorToml::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [coordinator] concurrency_limit, max_attempts, cooldown_secs");
            println!("  - [ports] capacity and base ports");
            println!("  - [workspace] base_branch, remote, fetch");
            println!("  - [worker] cmd, args");
            println!();
        }
    }

    Ok(())
}
