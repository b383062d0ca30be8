use std::fmt;

pub use anyhow::{anyhow, bail, ensure, Context, Error, Result};

/// The error taxonomy surfaced to callers of the gateway.
///
/// Most internal failures are plain `anyhow` errors with context attached.
/// Failures which callers are expected to distinguish are wrapped in one of
/// these variants and can be recovered with `Error::downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The supplied string is not a well-formed `mcp://` URI
    InvalidUri(String),
    /// A `mcp://` URI in the query could not be resolved to a local path
    UnresolvedUri(String),
    /// The server is known but exposes no resources to read
    NoResourcesForServer(String),
    /// The server alias could not be resolved to a provider endpoint
    CannotResolveServer(String),
    /// Fetching remote data for the server failed
    RemoteFetchFailed { server: String, cause: String },
    /// The remote payload is of a shape that cannot be materialized
    UnsupportedRemoteData(String),
    /// Opening a session to the url failed after all attempts
    ConnectFailed { url: String, cause: String },
    /// Opaque passthrough of an engine error message
    Engine(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUri(uri) => write!(f, "Invalid mcp:// URI: '{uri}'"),
            Self::UnresolvedUri(uri) => write!(f, "Could not resolve URI: '{uri}'"),
            Self::NoResourcesForServer(server) => {
                write!(f, "No resources available from server '{server}'")
            }
            Self::CannotResolveServer(server) => {
                write!(f, "Cannot resolve server '{server}' to a provider endpoint")
            }
            Self::RemoteFetchFailed { server, cause } => {
                write!(f, "Failed to fetch remote data from '{server}': {cause}")
            }
            Self::UnsupportedRemoteData(server) => {
                write!(f, "Remote data from '{server}' is of an unsupported shape")
            }
            Self::ConnectFailed { url, cause } => {
                write!(f, "Failed to connect to '{url}': {cause}")
            }
            Self::Engine(msg) => write!(f, "Engine error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Returns the taxonomy kind of the supplied error chain, if any
    pub fn of(err: &Error) -> Option<&GatewayError> {
        err.chain().find_map(|e| e.downcast_ref::<GatewayError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_downcast_through_context() {
        let err: Error = Error::from(GatewayError::InvalidUri("nope".into()))
            .context("while preprocessing query");

        let kind = GatewayError::of(&err).unwrap();
        assert_eq!(*kind, GatewayError::InvalidUri("nope".into()));
    }

    #[test]
    fn test_gateway_error_display_names_offender() {
        let err = GatewayError::RemoteFetchFailed {
            server: "api".into(),
            cause: "timed out".into(),
        };

        assert_eq!(
            err.to_string(),
            "Failed to fetch remote data from 'api': timed out"
        );
    }
}
