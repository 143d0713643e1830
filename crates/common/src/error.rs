//! Error types for the multipassd daemon.

use std::io;
use thiserror::Error;
use tonic::{Code, Status};

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the daemon and its collaborator interfaces.
#[derive(Error, Debug)]
pub enum Error {
    /// Launch/create request carried invalid options; the payload is the
    /// serialized set of launch error codes.
    #[error("Invalid arguments supplied")]
    InvalidArguments { details: String },

    /// A memory or disk size string could not be parsed.
    #[error("{0} is not a valid memory size")]
    InvalidMemorySize(String),

    /// No image or blueprint matches the requested name.
    #[error("Unable to find an image matching \"{0}\"")]
    ImageNotFound(String),

    /// Image download or preparation failed during create/launch.
    #[error("{0}")]
    CreateImageFailure(String),

    /// The instance failed while being started during launch.
    #[error("{reason}")]
    StartFailure { name: String, reason: String },

    /// Mounts are globally disabled.
    #[error(
        "Mounts are disabled on this installation of Multipass.\n\n\
         See https://multipass.run/docs/set-command#local.privileged-mounts for information\n\
         on how to enable them."
    )]
    MountsDisabled,

    /// The guest is missing the SSHFS helper snap.
    #[error(
        "Error enabling mount support in '{0}'\n\n\
         Please install the 'multipass-sshfs' snap manually inside the instance."
    )]
    SshfsMissing(String),

    /// Requested networks require bridge authorization the client did not give.
    #[error("Missing bridges")]
    MissingBridges,

    /// Snapshot name already in use on the instance.
    #[error("Snapshot name taken: {name}")]
    SnapshotNameTaken { instance: String, name: String },

    /// No snapshot with that name on the instance.
    #[error("No such snapshot: {instance}.{name}")]
    NoSuchSnapshot { instance: String, name: String },

    /// Settings key is not known to the store.
    #[error("Unrecognized settings key: '{0}'")]
    UnrecognizedSetting(String),

    /// Settings value was rejected by the store.
    #[error("Invalid setting '{key}={value}': {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    /// SSH transport failure (session establishment or command execution).
    #[error("ssh: {0}")]
    Ssh(String),

    /// Hypervisor backend reported a failure.
    #[error("{0}")]
    Backend(String),

    /// The backend does not implement the requested feature.
    #[error("The {0} feature is not implemented on this backend.")]
    NotImplementedOnThisBackend(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML document error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Unclassified runtime failure; takes the calling handler's default code.
    #[error("{0}")]
    Runtime(String),

    /// Internal error (unexpected condition).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The gRPC status this error maps to, given the handler's fallback code
    /// for unclassified failures.
    pub fn status_with_default(&self, default: Code) -> Status {
        match self {
            Error::InvalidArguments { details } => Status::with_details(
                Code::InvalidArgument,
                self.to_string(),
                details.clone().into_bytes().into(),
            ),
            Error::InvalidMemorySize(_)
            | Error::SnapshotNameTaken { .. }
            | Error::NoSuchSnapshot { .. }
            | Error::UnrecognizedSetting(_)
            | Error::InvalidSetting { .. } => Status::invalid_argument(self.to_string()),
            Error::ImageNotFound(_)
            | Error::CreateImageFailure(_)
            | Error::MountsDisabled
            | Error::SshfsMissing(_)
            | Error::MissingBridges
            | Error::Ssh(_)
            | Error::Backend(_)
            | Error::NotImplementedOnThisBackend(_) => {
                Status::failed_precondition(self.to_string())
            }
            Error::StartFailure { .. } => Status::aborted(self.to_string()),
            Error::Io(_) | Error::Json(_) | Error::Yaml(_) | Error::Internal(_) => {
                Status::internal(self.to_string())
            }
            Error::Runtime(_) => Status::new(default, self.to_string()),
        }
    }

    /// Most handlers fall back to FAILED_PRECONDITION for unclassified errors.
    pub fn to_status(&self) -> Status {
        self.status_with_default(Code::FailedPrecondition)
    }
}
