use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - resolved at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Working copy the engine maintains.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default)]
    pub deploy: DeployConfig,
}

pub(super) fn mindloop_dir() -> PathBuf {
    UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
        .join(".mindloop")
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("/data/source")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: mindloop_dir().join("config.toml"),
            repo_dir: default_repo_dir(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            tool: ToolConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

// ── Database ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection attempts before startup gives up.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_db_path() -> PathBuf {
    mindloop_dir().join("mind.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_retries() -> u32 {
    30
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The engine only runs when explicitly enabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_actor_name")]
    pub actor_name: String,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_assess_interval_secs")]
    pub assess_interval_secs: u64,
    #[serde(default = "default_stale_after_mins")]
    pub stale_after_mins: u64,
    #[serde(default = "default_retry_base_mins")]
    pub retry_base_mins: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_review_rounds")]
    pub review_rounds: u32,
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: PathBuf,
    #[serde(default = "default_required_binaries")]
    pub required_binaries: Vec<String>,
}

fn default_actor_name() -> String {
    "mind".into()
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_assess_interval_secs() -> u64 {
    300
}

fn default_stale_after_mins() -> u64 {
    30
}

fn default_retry_base_mins() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_review_rounds() -> u32 {
    2
}

fn default_heartbeat_path() -> PathBuf {
    PathBuf::from("/tmp/mind-heartbeat")
}

fn default_required_binaries() -> Vec<String> {
    vec!["claude".into(), "git".into(), "cargo".into()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            actor_name: default_actor_name(),
            tick_interval_secs: default_tick_interval_secs(),
            assess_interval_secs: default_assess_interval_secs(),
            stale_after_mins: default_stale_after_mins(),
            retry_base_mins: default_retry_base_mins(),
            max_retries: default_max_retries(),
            review_rounds: default_review_rounds(),
            heartbeat_path: default_heartbeat_path(),
            required_binaries: default_required_binaries(),
        }
    }
}

// ── Coding tool ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_binary")]
    pub binary: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Variables removed from the child environment.
    #[serde(default = "default_strip_env")]
    pub strip_env: Vec<String>,
    /// Appended to PATH so the tool can run the build toolchain.
    #[serde(default = "default_toolchain_bin")]
    pub toolchain_bin: PathBuf,
}

fn default_tool_binary() -> String {
    "claude".into()
}

fn default_allowed_tools() -> String {
    "Edit Write Read Glob Grep Bash".into()
}

fn default_tool_timeout_secs() -> u64 {
    600
}

fn default_strip_env() -> Vec<String> {
    vec!["CLAUDECODE".into(), "ANTHROPIC_API_KEY".into()]
}

fn default_toolchain_bin() -> PathBuf {
    PathBuf::from("/usr/local/cargo/bin")
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            allowed_tools: default_allowed_tools(),
            timeout_secs: default_tool_timeout_secs(),
            strip_env: default_strip_env(),
            toolchain_bin: default_toolchain_bin(),
        }
    }
}

// ── Deploy / repository ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_cargo")]
    pub cargo: String,
    /// `cargo` arguments for the verification build.
    #[serde(default = "default_check_args")]
    pub check_args: Vec<String>,
    #[serde(default = "default_test_args")]
    pub test_args: Vec<String>,
    /// `cargo` arguments that produce the deployable binaries.
    #[serde(default = "default_release_args")]
    pub release_args: Vec<String>,
    #[serde(default = "default_targets")]
    pub targets: Vec<DeployTarget>,
    /// Binary image the engine re-executes on restart.
    #[serde(default = "default_engine_binary")]
    pub engine_binary: PathBuf,
    /// Verification command quoted in prompts.
    #[serde(default = "default_verify_hint")]
    pub verify_hint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployTarget {
    /// Binary name under `target/release`.
    pub name: String,
    pub path: PathBuf,
}

fn default_remote() -> String {
    "origin".into()
}

fn default_branch() -> String {
    "main".into()
}

fn default_cargo() -> String {
    "cargo".into()
}

fn default_check_args() -> Vec<String> {
    vec!["build".into(), "--workspace".into(), "--all-targets".into()]
}

fn default_test_args() -> Vec<String> {
    vec!["test".into(), "--workspace".into()]
}

fn default_release_args() -> Vec<String> {
    vec!["build".into(), "--release".into(), "--bins".into()]
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/mindloop")
}

fn default_targets() -> Vec<DeployTarget> {
    vec![DeployTarget {
        name: "mindloop".into(),
        path: default_engine_binary(),
    }]
}

fn default_verify_hint() -> String {
    "cargo build --workspace && cargo test --workspace".into()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_branch(),
            cargo: default_cargo(),
            check_args: default_check_args(),
            test_args: default_test_args(),
            release_args: default_release_args(),
            targets: default_targets(),
            engine_binary: default_engine_binary(),
            verify_hint: default_verify_hint(),
        }
    }
}
