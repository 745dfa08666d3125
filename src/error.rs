use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `mindloop`.
///
/// Each subsystem defines its own error enum. The engine matches on these to
/// decide between recovery, blocking and a `mind.error` event; binary glue
/// code continues to use `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum MindError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Storage (events, tasks, authority, actors) ──────────────────────
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    // ── Coding tool subprocess ──────────────────────────────────────────
    #[error("tool: {0}")]
    Tool(#[from] ToolError),

    // ── Repository driver ───────────────────────────────────────────────
    #[error("repo: {0}")]
    Repo(#[from] RepoError),

    // ── Planner / reviewer / assessor ───────────────────────────────────
    #[error("phase: {0}")]
    Phase(#[from] PhaseError),

    // ── Engine tick ─────────────────────────────────────────────────────
    #[error("tick: {0}")]
    Tick(#[from] TickError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Storage errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("authority request {0} already resolved")]
    AlreadyResolved(String),

    #[error("no policy matches action {0:?}")]
    NoPolicy(String),

    #[error("invalid event content: {0}")]
    InvalidContent(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("chain broken at position {position} (event {event_id}): {detail}")]
    ChainBroken {
        position: usize,
        event_id: String,
        detail: String,
    },
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// ─── Tool errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output from {binary}: {source}")]
    Wait {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

// ─── Repository errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{program} {args} failed ({status}):\n{output}")]
    Command {
        program: String,
        args: String,
        status: String,
        output: String,
    },

    #[error("failed to commit {} orphaned files: {source}", files.len())]
    Orphans {
        files: Vec<String>,
        #[source]
        source: Box<RepoError>,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    /// Paths left dirty when orphan cleanup failed.
    pub fn orphaned_files(&self) -> &[String] {
        match self {
            Self::Orphans { files, .. } => files,
            _ => &[],
        }
    }
}

// ─── Phase errors (plan / review / assess) ───────────────────────────────────

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase} invocation: {source}")]
    Invocation {
        phase: &'static str,
        #[source]
        source: ToolError,
    },

    #[error("{phase} failed (exit {code}): {output}")]
    ToolExit {
        phase: &'static str,
        code: i32,
        output: String,
    },

    #[error("{phase} produced no usable tags from response: {output}")]
    Unparseable { phase: &'static str, output: String },

    #[error("{phase}: {source}")]
    Repo {
        phase: &'static str,
        #[source]
        source: RepoError,
    },
}

// ─── Engine errors ───────────────────────────────────────────────────────────

/// A store failure that ends the current tick.
#[derive(Debug, Error)]
#[error("{operation}: {source}")]
pub struct TickError {
    pub operation: &'static str,
    #[source]
    pub source: StorageError,
}

/// Tags a store result with the engine operation it belongs to.
pub trait TickContext<T> {
    fn during(self, operation: &'static str) -> std::result::Result<T, TickError>;
}

impl<T> TickContext<T> for std::result::Result<T, StorageError> {
    fn during(self, operation: &'static str) -> std::result::Result<T, TickError> {
        self.map_err(|source| TickError { operation, source })
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = MindError> = std::result::Result<T, E>;
