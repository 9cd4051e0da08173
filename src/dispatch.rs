//! Request dispatch: per-domain subscribers, global catch-all, and the
//! unanswered-request timeout.
//!
//! Every decoded HTTPS request is announced to the owning domain's
//! subscribers (keyed by path, invoked in registration order) and,
//! independently, to the global catch-all list. Exactly one of
//! {handler response, timeout default} completes an exchange: the
//! response writer's stream slot is taken on first write, and that first
//! write cancels the timer deterministically.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

use crate::config::DISPATCH_TIMEOUT_MS;
use crate::http::{Request, RESPONSE_500};
use crate::registry::DomainRegistry;

/// Write end of a terminated connection, type-erased so tests can stand in
/// for the TLS stream.
pub type ResponseStream = Box<dyn AsyncWrite + Send + Unpin>;

/// A per-domain request subscriber.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request, writer: ResponseWriter);
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, request: Request, writer: ResponseWriter) {
        (self)(request, writer).await;
    }
}

/// A global catch-all subscriber, notified for every dispatched request
/// regardless of domain.
#[async_trait]
pub trait CatchAllHandler: Send + Sync {
    async fn handle(&self, domain: String, request: Request, writer: ResponseWriter);
}

#[async_trait]
impl<F, Fut> CatchAllHandler for F
where
    F: Fn(String, Request, ResponseWriter) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, domain: String, request: Request, writer: ResponseWriter) {
        (self)(domain, request, writer).await;
    }
}

/// A domain's dispatch channel: an explicit map from path to an ordered
/// list of handlers (multiplicity 0..n, dispatched in registration order).
///
/// Cloneable; clones share the same subscriber map. Re-registering a domain
/// allocates a fresh channel, dropping prior subscribers.
#[derive(Clone)]
pub struct EventChannel {
    handlers: Arc<RwLock<HashMap<String, Vec<Arc<dyn RequestHandler>>>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe a handler to a path. Handlers fire in registration order.
    pub fn on<H: RequestHandler + 'static>(&self, path: &str, handler: H) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    fn handlers_for(&self, path: &str) -> Vec<Arc<dyn RequestHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether two values share the same underlying subscriber map.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handlers, &other.handlers)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventChannel").field("paths", &paths).finish()
    }
}

/// Handle for answering a dispatched request.
///
/// Cloneable; all clones share one write slot, so the exchange completes at
/// most once no matter how many subscribers hold a clone.
#[derive(Clone)]
pub struct ResponseWriter {
    shared: Arc<WriterShared>,
}

struct WriterShared {
    /// Taken by the first completing write; `None` afterwards.
    stream: Mutex<Option<ResponseStream>>,
    /// Fired by the first completing write to cancel the timeout task.
    answered_tx: StdMutex<Option<oneshot::Sender<()>>>,
    /// Consumed by the timeout task when it starts.
    answered_rx: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl ResponseWriter {
    pub fn new(stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            shared: Arc::new(WriterShared {
                stream: Mutex::new(Some(Box::new(stream))),
                answered_tx: StdMutex::new(Some(tx)),
                answered_rx: StdMutex::new(Some(rx)),
            }),
        }
    }

    /// Write a response head and body, then close the connection.
    ///
    /// Returns `Ok(true)` if this call completed the exchange, `Ok(false)`
    /// if a prior write (or the timeout default) already did.
    pub async fn respond(
        &self,
        status: u16,
        reason: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> io::Result<bool> {
        let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
        for (name, value) in headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(body);
        self.send_raw(&bytes).await
    }

    /// Write raw bytes as the complete response and close the connection.
    pub async fn send_raw(&self, bytes: &[u8]) -> io::Result<bool> {
        let Some(mut stream) = self.shared.stream.lock().await.take() else {
            return Ok(false);
        };
        // The exchange is committed from here on even if the write fails:
        // the peer connection is unusable either way.
        self.mark_answered();
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        Ok(true)
    }

    fn mark_answered(&self) {
        if let Some(tx) = self
            .shared
            .answered_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }

    /// Start the unanswered-exchange timer. Called once per dispatch; a
    /// second call is a no-op because the receiver is already consumed.
    fn spawn_timeout(&self) {
        let Some(answered) = self
            .shared
            .answered_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let writer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(DISPATCH_TIMEOUT_MS)) => {
                    match writer.send_raw(RESPONSE_500.as_bytes()).await {
                        Ok(true) => {
                            tracing::debug!("No handler answered; wrote default 500");
                        }
                        // Lost the race against a handler write; nothing to do.
                        Ok(false) => {}
                        Err(err) => {
                            tracing::debug!(error = %err, "Failed to write timeout response");
                        }
                    }
                }
                _ = answered => {}
            }
        });
    }
}

/// Fans decoded requests out to per-domain and global subscribers.
pub struct Dispatcher {
    registry: Arc<DomainRegistry>,
    global: RwLock<Vec<Arc<dyn CatchAllHandler>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DomainRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            global: RwLock::new(Vec::new()),
        })
    }

    /// Subscribe a catch-all handler notified for every dispatched request.
    pub fn on_request<H: CatchAllHandler + 'static>(&self, handler: H) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Announce a decoded request to its domain's path subscribers and the
    /// global catch-all list, and arm the unanswered-request timeout.
    ///
    /// The request's Host header value is the dispatch key; unknown domains
    /// still reach the catch-all list.
    pub async fn dispatch(&self, request: Request, writer: ResponseWriter) {
        let domain = request.host.clone();
        let path_handlers = self
            .registry
            .channel_of(&domain)
            .map(|channel| channel.handlers_for(&request.path))
            .unwrap_or_default();
        let global_handlers: Vec<_> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::debug!(
            %domain,
            path = %request.path,
            subscribers = path_handlers.len(),
            catch_all = global_handlers.len(),
            "Dispatching request"
        );

        writer.spawn_timeout();

        for handler in path_handlers {
            handler.handle(request.clone(), writer.clone()).await;
        }
        for handler in global_handlers {
            handler
                .handle(domain.clone(), request.clone(), writer.clone())
                .await;
        }
    }
}
