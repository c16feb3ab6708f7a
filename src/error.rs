//! Error types for the Compass Manager operator

use thiserror::Error;

/// Main error type for Compass Manager operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: &'static str,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Reading or writing cluster state failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The Compass Director rejected or failed a call
    #[error("error from director: {0}")]
    Director(String),

    /// Configuring the Compass Runtime Agent failed
    #[error("agent configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operator configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a storage error with the given message
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a director error with the given message
    pub fn director(msg: impl Into<String>) -> Self {
        Self::Director(msg.into())
    }

    /// Create an agent configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True if the error means the object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True if the error originates from the Compass Director
    pub fn is_director(&self) -> bool {
        matches!(self, Self::Director(_))
    }
}
