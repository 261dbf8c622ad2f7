//! Unified error handling for pingsd
//!
//! Every provider, the dispatch layer and the configuration loader report
//! failures through [`DiscoveryError`].

use pingora_error::{Error, ErrorType::InternalError};
use thiserror::Error as ThisError;

/// Error types for discovery operations
#[derive(Debug, ThisError)]
pub enum DiscoveryError {
    /// A required directive was not supplied
    #[error("{provider} provider: {field} is required{hint}")]
    MissingField {
        provider: &'static str,
        field: &'static str,
        hint: &'static str,
    },

    /// A directive appeared in a provider block that the provider does not know
    #[error("unrecognized {provider} subdirective '{directive}'")]
    UnknownDirective {
        provider: &'static str,
        directive: String,
    },

    /// A directive got too many or too few arguments
    #[error("wrong argument count or unexpected value for '{0}'")]
    ArgCount(String),

    /// A literal could not be parsed into the expected type
    #[error("invalid {kind} for {field}: '{value}'")]
    InvalidValue {
        field: String,
        kind: &'static str,
        value: String,
    },

    /// The factory was asked for a backend it does not know
    #[error("unknown service discovery provider: '{name}'. supported providers are: {supported}")]
    UnknownProvider { name: String, supported: String },

    /// The dispatch layer has no provider selected
    #[error("no service discovery provider is configured")]
    NoProvider,

    /// A lifecycle operation was invoked from the wrong state
    #[error("{provider} provider: cannot {operation} while {state}")]
    InvalidState {
        provider: &'static str,
        operation: &'static str,
        state: &'static str,
    },

    /// A dial target is not a valid `host:port`
    #[error("invalid dial target '{0}'")]
    InvalidEndpoint(String),

    /// The provider could not be started
    #[error("{context}: {source}")]
    Provision {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A single refresh failed; the previous snapshot stays in place
    #[error("{context}: {source}")]
    Refresh {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Releasing backend resources failed
    #[error("{context}: {source}")]
    Cleanup {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The current snapshot is empty
    #[error("no upstreams available for service: {0}")]
    NoUpstreams(String),
}

impl DiscoveryError {
    pub fn provision<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DiscoveryError::Provision {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn refresh<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DiscoveryError::Refresh {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn cleanup<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DiscoveryError::Cleanup {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        kind: &'static str,
        value: impl Into<String>,
    ) -> Self {
        DiscoveryError::InvalidValue {
            field: field.into(),
            kind,
            value: value.into(),
        }
    }

    /// Errors detected while loading configuration, always fatal to startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DiscoveryError::MissingField { .. }
                | DiscoveryError::UnknownDirective { .. }
                | DiscoveryError::ArgCount(_)
                | DiscoveryError::InvalidValue { .. }
                | DiscoveryError::UnknownProvider { .. }
                | DiscoveryError::InvalidState { .. }
                | DiscoveryError::InvalidEndpoint(_)
        )
    }
}

impl From<DiscoveryError> for Box<Error> {
    fn from(err: DiscoveryError) -> Self {
        Error::explain(InternalError, err.to_string())
    }
}

/// Result type alias for discovery operations
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;
