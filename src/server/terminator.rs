//! Internal TLS terminator.
//!
//! Listens only on the process-private relay channel; the front-end
//! multiplexer is the sole client. Each relayed connection runs a TLS
//! handshake whose certificate is chosen by the registry-backed SNI
//! resolver; resolution failure aborts the handshake and the peer sees a
//! TLS error, nothing more. After termination the request head is decoded
//! and handed to the dispatcher with a response writer.

use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ACCEPT_RETRY_DELAY_MS, MAX_BODY_BYTES, MAX_HEAD_BYTES};
use crate::dispatch::{Dispatcher, ResponseWriter};
use crate::events::{EventBus, ServerEvent};
use crate::http::{parse_request_head, Request};
use crate::registry::{DomainRegistry, SniResolver};

/// Build the shared TLS acceptor whose certificates come from the registry.
pub fn build_acceptor(registry: Arc<DomainRegistry>) -> TlsAcceptor {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(registry)));
    TlsAcceptor::from(Arc::new(config))
}

/// Accept loop for the relay listener. Runs until the task is aborted;
/// accept failures are reported on the bus and retried after a short delay.
pub async fn accept_loop(
    listener: UnixListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "Relay listener accept failed");
                events.emit(ServerEvent::Error(format!(
                    "relay listener accept failed: {err}"
                )));
                tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        let connection_id = Uuid::new_v4();
        tokio::spawn(
            async move {
                if let Err(err) = terminate(stream, acceptor, dispatcher).await {
                    tracing::debug!(error = %err, "Terminated connection ended with error");
                }
            }
            .instrument(tracing::debug_span!("terminator_connection", %connection_id)),
        );
    }
}

/// Handshake, decode, dispatch.
async fn terminate(
    stream: UnixStream,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    // An SNI miss makes the resolver return no certificate, which rustls
    // turns into a handshake failure here; the error never goes further
    // than this connection.
    let tls = acceptor.accept(stream).await?;

    let sni = tls
        .get_ref()
        .1
        .server_name()
        .map(|name| name.to_string())
        .unwrap_or_default();

    let Some((request, writer)) = decode_request(tls).await? else {
        return Ok(());
    };

    tracing::debug!(
        %sni,
        host = %request.host,
        method = %request.method,
        path = %request.path,
        "Decoded request"
    );

    dispatcher.dispatch(request, writer).await;
    Ok(())
}

/// Read and parse one request head (plus a capped body) from the
/// terminated stream, returning the decoded request and a response writer
/// wrapping the stream's write half.
async fn decode_request(
    mut tls: TlsStream<UnixStream>,
) -> std::io::Result<Option<(Request, ResponseWriter)>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Accumulate until the blank line ending the head, bounded.
    let head_end = loop {
        let n = tls.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Ok(None);
        }
    };

    let Some(mut request) = parse_request_head(&buffer[..head_end]) else {
        return Ok(None);
    };

    // Buffer a small announced body so handlers see complete requests.
    // Without a Content-Length the body is empty; bytes past the head
    // (pipelined requests, trailing noise) are never surfaced.
    let body_start = head_end + 4;
    let mut body: Vec<u8> = buffer[body_start.min(buffer.len())..].to_vec();
    let wanted = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_BODY_BYTES);
    while body.len() < wanted {
        let n = tls.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(wanted);
    request.body = body;

    let (read_half, write_half) = tokio::io::split(tls);
    // The read half is dropped: nothing past the decoded request is
    // consumed by the front door itself.
    drop(read_half);

    Ok(Some((request, ResponseWriter::new(write_half))))
}

/// Offset of the `\r\n\r\n` separating head from body, if present.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::os::fd::{FromRawFd, IntoRawFd};

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_does_not_end_loop() {
        // A connected socket masquerading as a listener: readable once its
        // peer closes, but accept() on it always fails.
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        drop(right);
        let std_listener =
            unsafe { std::os::unix::net::UnixListener::from_raw_fd(left.into_raw_fd()) };
        std_listener.set_nonblocking(true).unwrap();
        let listener = tokio::net::UnixListener::from_std(std_listener).unwrap();

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = DomainRegistry::new(events.clone());
        let dispatcher = Dispatcher::new(registry.clone());
        let acceptor = build_acceptor(registry);

        let task = tokio::spawn(accept_loop(listener, acceptor, dispatcher, events));

        // Two reports prove the loop retried past the first failure
        // instead of ending the listener.
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Error(_)));
        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::Error(_)));
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(
            find_head_end(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody"),
            Some(23)
        );
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
