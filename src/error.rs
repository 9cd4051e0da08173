//! Error taxonomy for the front door.
//!
//! Setup-time failures (certificate loading, listener binds) are converted
//! to process-wide notifications at their origin; per-connection failures
//! are isolated to that connection and only logged.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Mutating server configuration while the listeners are bound, or an
    /// otherwise invalid setting. Fatal to the call only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A key or certificate file could not be read. The domain stays
    /// unresolvable until re-registered.
    #[error("failed to load certificate material for {domain}: {source}")]
    CertificateLoad {
        domain: String,
        #[source]
        source: io::Error,
    },

    /// Key or certificate bytes were readable but malformed.
    #[error("failed to build TLS context for {domain}: {reason}")]
    ContextConstruction { domain: String, reason: String },

    /// SNI lookup miss: the domain is unknown, unresolved, or an alias
    /// whose target has no usable context. Surfaces to the peer as a
    /// handshake failure.
    #[error("unsupported domain: {0}")]
    UnsupportedDomain(String),

    /// Public port or relay channel address could not be bound.
    #[error("failed to bind listener: {0}")]
    Listen(#[source] io::Error),

    /// A stale relay channel address was found but could not be removed.
    /// Startup proceeds regardless.
    #[error("failed to remove stale relay channel {path}: {source}")]
    RelayChannelStale {
        path: String,
        #[source]
        source: io::Error,
    },
}
