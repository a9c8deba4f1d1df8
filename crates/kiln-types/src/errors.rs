use thiserror::Error;

/// Main error type for the Kiln system
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Hyperopt error: {0}")]
    Hyperopt(#[from] HyperoptError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl KilnError {
    /// True for every error that is raised while interpreting user
    /// configuration, before any trial has been launched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            KilnError::Config(_)
                | KilnError::Validation(_)
                | KilnError::Hyperopt(HyperoptError::Configuration(_))
                | KilnError::Hyperopt(HyperoptError::InvalidParameter { .. })
                | KilnError::Hyperopt(HyperoptError::UnsupportedParameter { .. })
        )
    }

    pub fn is_resource_unavailable(&self) -> bool {
        matches!(
            self,
            KilnError::Hyperopt(HyperoptError::ResourceUnavailable { .. })
        )
    }
}

/// Data-related errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data source not found: {0}")]
    SourceNotFound(String),

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Unsupported data format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },

    #[error("Data processing failed: {message}")]
    ProcessingFailed { message: String },

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Storage operation failed on {target}: {message}")]
    Storage { target: String, message: String },
}

/// Hyperparameter search errors
#[derive(Error, Debug)]
pub enum HyperoptError {
    #[error("invalid hyperopt configuration: {0}")]
    Configuration(String),

    #[error("invalid parameter {path}: {message}")]
    InvalidParameter { path: String, message: String },

    #[error("sampler {strategy} does not support {kind} parameter {path}")]
    UnsupportedParameter {
        strategy: String,
        path: String,
        kind: String,
    },

    #[error("resources unavailable: requested {requested}, available {available}")]
    ResourceUnavailable { requested: String, available: String },

    #[error("trial {trial_id} failed: {message}")]
    TrialRuntime { trial_id: String, message: String },

    #[error("checkpoint sync failed for {path}: {message}")]
    Sync { path: String, message: String },

    #[error("trial {trial_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trial_id: String,
        from: String,
        to: String,
    },

    #[error("backend error: {message}")]
    Backend { message: String },
}

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Helper trait for converting string errors
pub trait IntoKilnError {
    fn into_kiln_error(self) -> KilnError;
}

impl IntoKilnError for String {
    fn into_kiln_error(self) -> KilnError {
        KilnError::Internal(self)
    }
}

impl IntoKilnError for &str {
    fn into_kiln_error(self) -> KilnError {
        KilnError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Internal(format!($($arg)*))
    };
}

/// Macro for creating hyperopt configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::KilnError::Hyperopt($crate::HyperoptError::Configuration(format!($($arg)*)))
    };
}
