//! Domain registry and SNI resolution.
//!
//! The registry owns one entry per certificate domain: the domain's TLS
//! context (or an alias to another domain's context, or a not-yet-loaded
//! placeholder) and its dispatch channel. Mutation is append/replace-only
//! and always publishes fully-formed values, so concurrent readers on the
//! handshake path never observe a half-built context.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::dispatch::EventChannel;
use crate::error::ServerError;
use crate::events::EventBus;
use crate::loader;

/// Certificate state of a registered domain.
#[derive(Clone)]
pub enum DomainContext {
    /// A usable certificate+key bundle
    Context(Arc<CertifiedKey>),
    /// Reuse the resolved context of another registered domain
    Alias(String),
    /// Registered, certificate not (yet) loaded
    Unresolved,
}

/// One registered domain: its context state and its dispatch channel.
struct DomainEntry {
    context: DomainContext,
    channel: EventChannel,
}

/// How a domain is being registered.
pub enum Registration {
    /// A pre-built context, stored directly
    Context(Arc<CertifiedKey>),
    /// Reuse another domain's resolved context
    Alias(String),
    /// Load key and certificate from disk asynchronously
    Files { key_path: String, cert_path: String },
}

/// Shared, single-writer/multi-reader domain registry.
///
/// Keys are unique and case-sensitive. Entries are never deleted;
/// re-registration overwrites the whole entry, allocating a fresh dispatch
/// channel (prior subscribers are intentionally dropped).
pub struct DomainRegistry {
    entries: RwLock<HashMap<String, DomainEntry>>,
    events: EventBus,
}

impl DomainRegistry {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Register (or overwrite) a domain.
    ///
    /// Synchronous: the entry and its fresh channel exist when this
    /// returns. The `Files` form leaves the entry `Unresolved` and
    /// delegates to the certificate loader, which publishes the context
    /// and emits a notification when done.
    pub fn register(self: &Arc<Self>, domain: &str, registration: Registration) {
        let context = match &registration {
            Registration::Context(key) => DomainContext::Context(key.clone()),
            Registration::Alias(target) => DomainContext::Alias(target.clone()),
            Registration::Files { .. } => DomainContext::Unresolved,
        };

        let entry = DomainEntry {
            context,
            channel: EventChannel::new(),
        };
        self.write().insert(domain.to_string(), entry);
        tracing::debug!(%domain, "Registered domain");

        if let Registration::Files {
            key_path,
            cert_path,
        } = registration
        {
            tokio::spawn(loader::load(
                self.clone(),
                self.events.clone(),
                domain.to_string(),
                key_path,
                cert_path,
            ));
        }
    }

    /// Membership test.
    pub fn has(&self, domain: &str) -> bool {
        self.read().contains_key(domain)
    }

    /// Read accessor for a domain's context state; `None` for unknown domains.
    pub fn context_of(&self, domain: &str) -> Option<DomainContext> {
        self.read().get(domain).map(|e| e.context.clone())
    }

    /// Read accessor for a domain's dispatch channel; `None` for unknown domains.
    pub fn channel_of(&self, domain: &str) -> Option<EventChannel> {
        self.read().get(domain).map(|e| e.channel.clone())
    }

    /// Replace a domain's context with a fully built one, keeping the
    /// entry's channel. Used by the certificate loader; a no-op if the
    /// domain was never registered.
    pub(crate) fn publish_context(&self, domain: &str, key: Arc<CertifiedKey>) {
        if let Some(entry) = self.write().get_mut(domain) {
            entry.context = DomainContext::Context(key);
        }
    }

    /// Resolve a domain to a usable TLS context.
    ///
    /// Unknown and `Unresolved` domains fail. Aliases are followed exactly
    /// one level; a successful follow memoizes the target's context into
    /// the alias entry, so later lookups do not re-traverse. The memoized
    /// context is not retroactively refreshed when the target is
    /// re-registered (documented staleness window).
    pub fn resolve(&self, domain: &str) -> Result<Arc<CertifiedKey>, ServerError> {
        let target = {
            let entries = self.read();
            match entries.get(domain).map(|e| &e.context) {
                None | Some(DomainContext::Unresolved) => {
                    return Err(ServerError::UnsupportedDomain(domain.to_string()))
                }
                Some(DomainContext::Context(key)) => return Ok(key.clone()),
                Some(DomainContext::Alias(target)) => target.clone(),
            }
        };

        // Follow the alias one step and memoize under the write lock. The
        // entry is re-checked against the target read above: a concurrent
        // re-registration between the two locks wins over the memoization.
        let mut entries = self.write();
        let key = match entries.get(&target).map(|e| &e.context) {
            Some(DomainContext::Context(key)) => key.clone(),
            // Alias-to-alias stays unresolved: chains deeper than one
            // level are a configuration error.
            _ => return Err(ServerError::UnsupportedDomain(domain.to_string())),
        };
        memoize_alias(&mut entries, domain, &target, key.clone());
        Ok(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DomainEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DomainEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Store a followed alias target's context into the alias entry, unless
/// the entry no longer points at that target.
fn memoize_alias(
    entries: &mut HashMap<String, DomainEntry>,
    domain: &str,
    target: &str,
    key: Arc<CertifiedKey>,
) {
    if let Some(entry) = entries.get_mut(domain) {
        if matches!(&entry.context, DomainContext::Alias(t) if t.as_str() == target) {
            entry.context = DomainContext::Context(key);
        }
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.read().len())
            .finish()
    }
}

/// rustls certificate resolver backed by the domain registry.
///
/// Called synchronously during each handshake with the client's announced
/// server name. Returning `None` aborts the handshake, which is how SNI
/// misses surface to the peer.
#[derive(Debug)]
pub struct SniResolver {
    registry: Arc<DomainRegistry>,
}

impl SniResolver {
    pub fn new(registry: Arc<DomainRegistry>) -> Self {
        Self { registry }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        match self.registry.resolve(name) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::debug!(domain = %name, error = %err, "SNI resolution failed");
                None
            }
        }
    }
}
