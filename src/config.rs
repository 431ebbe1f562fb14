//! Configuration for the conductor, read from `.conductor/conductor.toml`.
//!
//! Values are layered file → environment → CLI:
//!
//! ```toml
//! [coordinator]
//! concurrency_limit = 3
//! max_attempts = 3
//! cooldown_secs = 1800
//! sweep_interval_secs = 30
//! persist_attempts = false
//!
//! [ports]
//! capacity = 100
//! base_backend = 8000
//! base_frontend = 9000
//!
//! [workspace]
//! root = ".conductor/workspaces"
//! base_branch = "main"
//! remote = "origin"
//! fetch = true
//!
//! [remediation]
//! max_iterations = 3
//! check_cmd = "cargo test"
//!
//! [circuit_breaker]
//! window = 20
//! threshold = 12
//! marker = "[retry]"
//!
//! [worker]
//! cmd = "claude"
//!
//! [tracker]
//! enabled = false
//! labels = ["conductor"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the project-local state directory.
pub const CONDUCTOR_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";
pub const DB_FILE: &str = "conductor.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorSection {
    /// Maximum tasks running at once across all features.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Launch attempts before a task is failed permanently.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minimum wait after a failure before the next launch.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Period of the readiness sweep over in-progress features.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Keep loop guard history in the database instead of memory.
    #[serde(default)]
    pub persist_attempts: bool,
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            persist_attempts: false,
        }
    }
}

impl CoordinatorSection {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PortsSection {
    #[serde(default = "default_port_capacity")]
    pub capacity: u32,
    #[serde(default = "default_base_backend")]
    pub base_backend: u16,
    #[serde(default = "default_base_frontend")]
    pub base_frontend: u16,
}

fn default_port_capacity() -> u32 {
    100
}

fn default_base_backend() -> u16 {
    8000
}

fn default_base_frontend() -> u16 {
    9000
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            capacity: default_port_capacity(),
            base_backend: default_base_backend(),
            base_frontend: default_base_frontend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSection {
    /// Directory holding per-execution worktrees, relative to the project.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Fetch the remote before creating a workspace.
    #[serde(default = "default_true")]
    pub fetch: bool,
}

fn default_workspace_root() -> String {
    format!("{}/workspaces", CONDUCTOR_DIR)
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            base_branch: default_base_branch(),
            remote: default_remote(),
            fetch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Command whose output lists passing/failing items. Verify tasks run
    /// the remediation loop only when this is set.
    #[serde(default)]
    pub check_cmd: Option<String>,
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for RemediationSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            check_cmd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_marker")]
    pub marker: String,
}

fn default_window() -> usize {
    20
}

fn default_threshold() -> usize {
    12
}

fn default_marker() -> String {
    "[retry]".to_string()
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            threshold: default_threshold(),
            marker: default_marker(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Agent command (default: `$CONDUCTOR_WORKER_CMD`, `$CLAUDE_CMD`, "claude").
    #[serde(default)]
    pub cmd: Option<String>,
    /// Extra arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerSection {
    /// Create issues through the `gh` CLI.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

fn default_labels() -> Vec<String> {
    vec!["conductor".to_string()]
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            labels: default_labels(),
        }
    }
}

/// Contents of `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConductorToml {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub remediation: RemediationSection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub tracker: TrackerSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load from `<dir>/conductor.toml`, falling back to defaults.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.coordinator.concurrency_limit == 0 {
            warnings.push("coordinator.concurrency_limit is 0: no task will ever launch".to_string());
        }
        if self.coordinator.max_attempts == 0 {
            warnings.push("coordinator.max_attempts is 0: every task fails before launching".to_string());
        }
        if self.ports.capacity == 0 {
            warnings.push("ports.capacity is 0: every reservation will fail".to_string());
        }

        let span = 2 * u64::from(self.ports.capacity);
        let backend_end = u64::from(self.ports.base_backend) + span;
        let frontend_end = u64::from(self.ports.base_frontend) + span;
        if backend_end > 65536 || frontend_end > 65536 {
            warnings.push(format!(
                "port ranges exceed 65535 with capacity {}",
                self.ports.capacity
            ));
        }
        if u64::from(self.ports.base_backend) < frontend_end
            && u64::from(self.ports.base_frontend) < backend_end
        {
            warnings.push(format!(
                "backend ports {}.. and frontend ports {}.. overlap",
                self.ports.base_backend, self.ports.base_frontend
            ));
        }

        if self.circuit_breaker.threshold > self.circuit_breaker.window {
            warnings.push(format!(
                "circuit_breaker.threshold ({}) exceeds window ({}): the breaker can never trip",
                self.circuit_breaker.threshold, self.circuit_breaker.window
            ));
        }
        if self.circuit_breaker.marker.trim().is_empty() {
            warnings.push("circuit_breaker.marker is empty".to_string());
        }

        warnings
    }
}

/// Resolved configuration: `conductor.toml` plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub toml: ConductorToml,
    /// CLI override for `coordinator.concurrency_limit`.
    pub cli_concurrency: Option<usize>,
}

impl ConductorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;
        Ok(Self {
            project_dir,
            conductor_dir,
            toml,
            cli_concurrency: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, concurrency: Option<usize>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_concurrency = concurrency;
        Ok(config)
    }

    /// Concurrency limit (CLI → env → file).
    pub fn concurrency_limit(&self) -> usize {
        self.cli_concurrency
            .or_else(|| {
                std::env::var("CONDUCTOR_CONCURRENCY")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(self.toml.coordinator.concurrency_limit)
    }

    /// Worker command (file → env → default).
    pub fn worker_cmd(&self) -> String {
        self.toml
            .worker
            .cmd
            .clone()
            .or_else(|| std::env::var("CONDUCTOR_WORKER_CMD").ok())
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn config_file(&self) -> PathBuf {
        self.conductor_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.conductor_dir.join(DB_FILE)
    }

    pub fn workspace_root(&self) -> PathBuf {
        let root = Path::new(&self.toml.workspace.root);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            self.project_dir.join(root)
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.conductor_dir.join("artifacts")
    }

    pub fn analytics_file(&self) -> PathBuf {
        self.conductor_dir.join("analytics.jsonl")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Result of [`init_project`].
#[derive(Debug)]
pub struct InitResult {
    pub conductor_dir: PathBuf,
    /// False when `.conductor/` already existed.
    pub created: bool,
}

const GITIGNORE: &str = "conductor.db*\nworkspaces/\nartifacts/\nanalytics.jsonl\n";

/// Create `.conductor/` with a default `conductor.toml`, a `.gitignore` and
/// a migrated database. Existing files are left alone.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let conductor_dir = project_dir.join(CONDUCTOR_DIR);
    let created = !conductor_dir.exists();
    std::fs::create_dir_all(&conductor_dir)
        .with_context(|| format!("Failed to create {}", conductor_dir.display()))?;

    let config_path = conductor_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        ConductorToml::default().save(&config_path)?;
    }
    let gitignore = conductor_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }
    crate::store::StoreDb::new(&conductor_dir.join(DB_FILE))?;

    Ok(InitResult {
        conductor_dir,
        created,
    })
}
