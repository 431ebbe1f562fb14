//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                       |
//! |-------------|----------------------------------------|
//! | `project`   | `Init`, `Submit`, `Status`, `Ready`    |
//! | `run`       | `Run`                                  |
//! | `pool`      | `Pool`                                 |
//! | `workspace` | `Workspace`                            |
//! | `config`    | `Config`                               |

pub mod config;
pub mod pool;
pub mod project;
pub mod run;
pub mod workspace;

use std::path::Path;

use anyhow::{Result, bail};
use conductor::config::{CONDUCTOR_DIR, ConductorConfig};
use conductor::store::DbHandle;

pub use config::cmd_config;
pub use pool::cmd_pool;
pub use project::{cmd_init, cmd_ready, cmd_status, cmd_submit};
pub use run::cmd_run;
pub use workspace::cmd_workspace;

/// Resolved configuration and store of an initialized project.
fn open_project(project_dir: &Path, concurrency: Option<usize>) -> Result<(ConductorConfig, DbHandle)> {
    if !project_dir.join(CONDUCTOR_DIR).is_dir() {
        bail!(
            "No conductor project at {}. Run 'conductor init' first.",
            project_dir.display()
        );
    }
    let config = ConductorConfig::with_cli_args(project_dir.to_path_buf(), concurrency)?;
    let db = DbHandle::open(&config.db_path())?;
    Ok((config, db))
}
