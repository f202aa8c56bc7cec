//! Error handling for the RTP source orchestrator
//!
//! Configuration errors are returned from setters and leave the previous value
//! in place. Topology errors are returned from [`crate::RtpSource::start`] and
//! abort activation. Resolution misses and invariant violations never show up
//! here: they are logged and turned into "do not expose" at the callback
//! boundary.

use thiserror::Error;

use crate::elements::{StageError, StageKind};

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the RTP source orchestrator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The URI could not be parsed or does not describe an RTP endpoint
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A property value is out of range or malformed
    #[error("Invalid value '{value}' for property '{property}': {reason}")]
    InvalidValue {
        property: String,
        value: String,
        reason: String,
    },

    /// A URI query key that does not name a known property
    #[error("Unknown property: {name}")]
    UnknownProperty { name: String },

    /// The property can only be changed while the session is inactive
    #[error("Property '{property}' cannot be changed while the session is active")]
    InvalidState { property: String },

    /// Activation was requested without a URI
    #[error("No URI configured")]
    MissingUri,

    /// A required stage could not be instantiated
    #[error("Failed to create {stage} stage: {reason}")]
    StageCreation { stage: StageKind, reason: String },

    /// A required stage could not be brought to the active state
    #[error("Failed to activate {stage} stage: {reason}")]
    StageActivation { stage: StageKind, reason: String },

    /// Two stages could not be linked
    #[error("Failed to link {from} to {to}: {reason}")]
    Link {
        from: String,
        to: String,
        reason: String,
    },

    /// Activation happened outside a Tokio runtime
    #[error("No async runtime available to run the branch router")]
    NoRuntime,

    /// Logging or configuration-file problem
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid value error
    pub fn invalid_value(
        property: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            property: property.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a new unknown property error
    pub fn unknown_property(name: impl Into<String>) -> Self {
        Self::UnknownProperty { name: name.into() }
    }

    /// Create a new invalid state error
    pub fn invalid_state(property: impl Into<String>) -> Self {
        Self::InvalidState {
            property: property.into(),
        }
    }

    /// Wrap a collaborator failure that happened while creating a stage
    pub fn stage_creation(err: StageError) -> Self {
        Self::StageCreation {
            stage: err.stage,
            reason: err.reason,
        }
    }

    /// Wrap a collaborator failure that happened while activating a stage
    pub fn stage_activation(err: StageError) -> Self {
        Self::StageActivation {
            stage: err.stage,
            reason: err.reason,
        }
    }

    /// Create a new link error
    pub fn link(from: impl ToString, to: impl ToString, reason: impl Into<String>) -> Self {
        Self::Link {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error is fatal to session activation
    pub fn is_activation_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingUri
                | Self::StageCreation { .. }
                | Self::StageActivation { .. }
                | Self::Link { .. }
                | Self::NoRuntime
        )
    }

    /// Check if this error was raised by a rejected configuration change
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. }
                | Self::InvalidValue { .. }
                | Self::UnknownProperty { .. }
                | Self::InvalidState { .. }
        )
    }
}
