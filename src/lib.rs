//! Narthex - a name-based multi-tenant TLS+HTTP front door.
//!
//! One public endpoint serves many independent certificate domains. The
//! first byte of each new connection decides its fate: TLS handshakes are
//! byte-spliced into a process-private relay channel and terminated with a
//! per-domain certificate chosen by SNI, while plaintext HTTP is answered
//! with a permanent redirect to HTTPS (or a 400 for unknown domains).
//! Decoded requests are announced to per-domain and global subscribers,
//! with a default 500 written when nobody answers in time.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod http;
pub mod loader;
pub mod registry;
pub mod server;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatch::{CatchAllHandler, Dispatcher, EventChannel, RequestHandler, ResponseWriter};
pub use error::ServerError;
pub use events::{EventBus, ServerEvent};
pub use registry::{DomainContext, DomainRegistry, Registration};
pub use server::Server;
