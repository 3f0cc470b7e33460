#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list workflow directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("workflow `{workflow}` validation failed: {reason}")]
    Workflow { workflow: String, reason: String },
    #[error("workflow `{workflow}` step {index} references unknown unit `{unit}`")]
    UnknownUnit {
        workflow: String,
        index: usize,
        unit: String,
    },
    #[error("workflow `{workflow}` is defined more than once")]
    DuplicateWorkflow { workflow: String },
}
