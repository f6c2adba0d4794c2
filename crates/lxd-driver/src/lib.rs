use lxd_common::CollaboratorError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the bin)
pub use lxd_common as common;

pub mod attach;
pub mod config;
pub mod configdrive;
pub mod device;
pub mod driver;
pub mod image;
pub mod lock;
pub mod migrate;
pub mod operation;
pub mod paths;
pub mod profile;
pub mod rescue;
pub mod session;
pub mod snapshot;
pub mod units;
pub mod vif;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{DriverConfig, PollConfig, RetryPolicy};
pub use device::{DeviceSpec, DiskDevice, NicDevice, NicType};
pub use driver::{Collaborators, LxdDriver};
pub use operation::{OperationOutcome, OperationTracker, WaitTimeout};
pub use profile::{Profile, ProfileBuilder};
pub use session::{rest::RestSession, RemoteError, Session};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{resource} not found (instance {name})")]
    NotFound { name: String, resource: String },
    #[error("Instance {name} already exists")]
    AlreadyExists { name: String },
    #[error("Remote operation failed for {name}: {message}")]
    RemoteOperation { name: String, message: String },
    #[error("Operation {operation} for {name} did not finish within {timeout}")]
    OperationTimeout {
        name: String,
        operation: String,
        timeout: WaitTimeout,
    },
    #[error("Unsupported feature for {name}: {feature}")]
    UnsupportedFeature { name: String, feature: String },
    #[error("Host is missing the {capability} extension required by {name}")]
    UnsupportedHostCapability { name: String, capability: String },
    #[error("Unsupported VIF type {vif_type} for {name}")]
    UnsupportedDevice { name: String, vif_type: String },
    #[error("Unsupported config drive format {format} for {name}")]
    ConfigDriveFormat { name: String, format: String },
    #[error("Device {key} defined twice in profile {name}")]
    DuplicateDevice { name: String, key: String },
    #[error("Invalid quota {key}={value} for {name}")]
    InvalidQuota {
        name: String,
        key: String,
        value: String,
    },
    #[error("Virtual interface creation failed for {name}")]
    VirtualInterfaceCreate { name: String },
    #[error("Collaborator failed for {name}: {source}")]
    Collaborator {
        name: String,
        #[source]
        source: CollaboratorError,
    },
    #[error("IO Error for {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration Error: {0}")]
    Config(String),
}

impl DriverError {
    /// Attach an instance name to a session-level failure.
    pub fn remote(name: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { resource } => DriverError::NotFound {
                name: name.to_string(),
                resource,
            },
            other => DriverError::RemoteOperation {
                name: name.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn io(name: &str, source: std::io::Error) -> Self {
        DriverError::Io {
            name: name.to_string(),
            source,
        }
    }

    pub fn collaborator(name: &str, source: CollaboratorError) -> Self {
        DriverError::Collaborator {
            name: name.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound { .. })
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_not_found_keeps_resource() {
        let err = DriverError::remote(
            "instance-1",
            RemoteError::NotFound {
                resource: "container instance-1".to_string(),
            },
        );
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "container instance-1 not found (instance instance-1)"
        );
    }

    #[test]
    fn test_remote_api_error_carries_name_and_text() {
        let err = DriverError::remote(
            "instance-1",
            RemoteError::Api {
                status: 500,
                message: "disk full".to_string(),
            },
        );
        assert!(!err.is_not_found());
        let text = err.to_string();
        assert!(text.contains("instance-1"));
        assert!(text.contains("disk full"));
    }
}
