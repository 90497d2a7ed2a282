pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Calibration error: {0}")]
    CalibrationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by observers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing collaborator, bad schema on load, invalid settings.
    Configuration,
    /// Size mismatches and empty buffers; only the current cycle is affected.
    Data,
    /// Failures raised inside a pluggable algorithm.
    Algorithm,
    /// Device probing and thread pool problems.
    Resource,
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn algorithm(msg: impl Into<String>) -> Self {
        Self::AlgorithmError(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::DimensionMismatch(_) => ErrorKind::Data,
            Error::InvalidParameters(_)
            | Error::CalibrationError(_)
            | Error::ConfigError(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Configuration,
            Error::AlgorithmError(_) => ErrorKind::Algorithm,
            Error::NotSupported(_) | Error::RuntimeError(_) => ErrorKind::Resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_configuration_errors() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn size_mismatch_is_a_data_error() {
        let err = Error::dimension_mismatch("left 4x4, right 5x4");
        assert_eq!(err.kind(), ErrorKind::Data);
        assert_eq!(err.to_string(), "Dimension mismatch: left 4x4, right 5x4");
    }
}
