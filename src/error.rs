use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Invalid task id '{0}': expected PREFIX-NNN")]
    InvalidTaskId(String),

    #[error("Circular dependency: {}", cycle.join(" -> "))]
    CircularDependency {
        /// Task ids along the cycle, in order, with the first id repeated last.
        cycle: Vec<String>,
    },

    #[error("Ownership conflict on '{path}': claimed by {first} and {second}")]
    OwnershipConflict {
        path: String,
        first: String,
        second: String,
    },

    #[error("Illegal worker transition from {from} to {to}")]
    ProtocolViolation { from: String, to: String },

    #[error("Merge conflict merging worker {worker_id}: {}", paths.join(", "))]
    MergeConflict {
        worker_id: String,
        paths: Vec<String>,
    },

    #[error("State corruption: {0}")]
    StateCorruption(String),

    #[error("No worker capacity (max: {max})")]
    NoCapacity { max: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Launcher error: {0}")]
    Launcher(String),
}

pub type Result<T> = std::result::Result<T, Error>;
