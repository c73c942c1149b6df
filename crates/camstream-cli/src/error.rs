// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments or stream combination
    InvalidArgs(String),
    /// Capture device missing or not initialised
    DeviceUnavailable(String),
    /// Buffer or backing pool allocation failed
    ResourceExhausted(String),
    /// A running stream failed
    StreamFailed(String),
    /// Operation timed out
    Timeout(String),
    /// General error from the camstream library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            CliError::ResourceExhausted(msg) => write!(f, "Out of memory: {}", msg),
            CliError::StreamFailed(msg) => write!(f, "Stream failed: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InvalidArgs(_) => ExitCode::from(2),
            CliError::DeviceUnavailable(_) => ExitCode::from(3),
            CliError::ResourceExhausted(_) => ExitCode::from(4),
            CliError::StreamFailed(_) => ExitCode::from(5),
            CliError::Timeout(_) => ExitCode::from(6),
            CliError::General(_) => ExitCode::from(1),
        }
    }
}

/// Map camstream::Error to CliError with appropriate exit codes
impl From<camstream::Error> for CliError {
    fn from(err: camstream::Error) -> Self {
        use camstream::Error;

        match err {
            // Requests the manager refuses
            Error::UnsupportedFormat(_) | Error::AlreadyExists(_) | Error::InvalidState(_) => {
                CliError::InvalidArgs(err.to_string())
            }

            Error::NoMemory(_) => CliError::ResourceExhausted(err.to_string()),
            Error::NotInitialized(_) => CliError::DeviceUnavailable(err.to_string()),

            // Device ioctl failures, missing nodes are reported as unavailable
            Error::Hardware { ref source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    CliError::DeviceUnavailable(err.to_string())
                }
                std::io::ErrorKind::TimedOut => CliError::Timeout(err.to_string()),
                _ => CliError::StreamFailed(err.to_string()),
            },

            Error::ConsumerStarved(_) | Error::Consumer(_) => {
                CliError::StreamFailed(err.to_string())
            }

            Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut => {
                    CliError::Timeout(format!("Operation timed out: {}", io_err))
                }
                _ => CliError::General(format!("I/O error: {}", io_err)),
            },
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camstream::{role::StreamRole, Error};
    use std::io;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CliError::InvalidArgs("test".into()).exit_code(),
            ExitCode::from(2)
        );
        assert_eq!(
            CliError::DeviceUnavailable("test".into()).exit_code(),
            ExitCode::from(3)
        );
        assert_eq!(
            CliError::ResourceExhausted("test".into()).exit_code(),
            ExitCode::from(4)
        );
        assert_eq!(
            CliError::StreamFailed("test".into()).exit_code(),
            ExitCode::from(5)
        );
        assert_eq!(
            CliError::Timeout("test".into()).exit_code(),
            ExitCode::from(6)
        );
        assert_eq!(
            CliError::General("test".into()).exit_code(),
            ExitCode::from(1)
        );
    }

    #[test]
    fn test_library_error_mapping() {
        assert!(matches!(
            CliError::from(Error::UnsupportedFormat(1)),
            CliError::InvalidArgs(_)
        ));
        assert!(matches!(
            CliError::from(Error::AlreadyExists(StreamRole::Preview)),
            CliError::InvalidArgs(_)
        ));
        assert!(matches!(
            CliError::from(Error::NoMemory("pool".into())),
            CliError::ResourceExhausted(_)
        ));
        assert!(matches!(
            CliError::from(Error::NotInitialized("queue".into())),
            CliError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            CliError::from(Error::hardware(
                "set_crop",
                io::Error::new(io::ErrorKind::NotFound, "gone")
            )),
            CliError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            CliError::from(Error::hardware("stop_streaming", io::Error::other("busy"))),
            CliError::StreamFailed(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = CliError::DeviceUnavailable("/dev/video0".to_string());
        assert_eq!(format!("{}", err), "Device unavailable: /dev/video0");
    }
}
