use core::error::Error;

pub mod cli;
pub mod documents;
pub mod serve;

pub use cli::*;
pub use documents::*;
pub use serve::*;

/// Configuration errors
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse {path}")]
    ParseFailed { path: String },
    #[display("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn config_error_display_formatting() {
        let read = ConfigError::ReadFailed {
            path: "/etc/webhook/config/sidecarconfig.yaml".to_string(),
        };
        assert_eq!(
            read.to_string(),
            "Failed to read /etc/webhook/config/sidecarconfig.yaml"
        );

        let invalid = ConfigError::InvalidValue {
            name: "total-gpu-memory".to_string(),
            reason: "must be positive".to_string(),
        };
        assert_eq!(
            invalid.to_string(),
            "Invalid value for total-gpu-memory: must be positive"
        );
    }
}
