//! Front-end multiplexer: the public listener.
//!
//! Classifies each inbound connection from the first byte of its first
//! chunk without consuming it. TLS handshake traffic (0x16) is byte-spliced
//! into the internal relay channel with no protocol awareness; anything
//! else is treated as plaintext HTTP/1.x and answered with a redirect to
//! HTTPS (known domain) or a 400 (unknown/unparsable), then closed.
//!
//! The first-byte-only classification is a documented simplification: a
//! handshake marker split across chunk boundaries is not reassembled.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ACCEPT_RETRY_DELAY_MS, FRONT_READ_BUFFER};
use crate::events::{EventBus, ServerEvent};
use crate::http::{parse_request_line, response_308, RESPONSE_400};
use crate::registry::DomainRegistry;

/// First byte of a TLS record carrying a handshake message.
const TLS_HANDSHAKE_MARKER: u8 = 0x16;

/// Accept loop for the public listener. Runs until the task is aborted;
/// accept failures are reported on the bus and retried after a short delay.
pub async fn accept_loop(
    listener: TcpListener,
    registry: Arc<DomainRegistry>,
    relay_path: Arc<str>,
    events: EventBus,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "Public listener accept failed");
                events.emit(ServerEvent::Error(format!(
                    "public listener accept failed: {err}"
                )));
                tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                continue;
            }
        };
        let registry = registry.clone();
        let relay_path = relay_path.clone();
        let connection_id = Uuid::new_v4();
        tokio::spawn(
            async move {
                if let Err(err) = handle_connection(stream, registry, &relay_path).await {
                    tracing::debug!(error = %err, "Connection ended with error");
                }
            }
            .instrument(tracing::debug_span!(
                "front_connection",
                %peer_addr,
                %connection_id
            )),
        );
    }
}

/// Classify one connection by its first byte and route it.
async fn handle_connection(
    mut stream: TcpStream,
    registry: Arc<DomainRegistry>,
    relay_path: &str,
) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        // Peer closed before sending anything.
        return Ok(());
    }

    if first[0] == TLS_HANDSHAKE_MARKER {
        tracing::debug!("TLS handshake marker; splicing into relay channel");
        relay(stream, relay_path).await
    } else {
        tracing::debug!("Plaintext first byte; answering redirect");
        redirect(&mut stream, &registry).await
    }
}

/// Byte-splice the connection into the relay channel.
///
/// Peeking left the already-seen bytes in the socket buffer, so the whole
/// client hello flows through untouched. The splice is a stateless pipe:
/// either side closing (or erroring) tears down both, and there are no
/// retries.
async fn relay(mut stream: TcpStream, relay_path: &str) -> std::io::Result<()> {
    let mut upstream = UnixStream::connect(relay_path).await?;
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((to_terminator, to_client)) => {
            tracing::debug!(to_terminator, to_client, "Relay closed");
            Ok(())
        }
        Err(err) => {
            // Both halves are dropped here, closing the paired connection.
            tracing::debug!(error = %err, "Relay tore down");
            Err(err)
        }
    }
}

/// Answer a plaintext request with a 308 to HTTPS or a 400, then close.
///
/// Only the request line and the assumed Host line are parsed; no bytes
/// beyond the first chunk are read, and nothing after the decision is
/// processed. The Host value is matched against the registry exactly: no
/// port-stripping, no case-folding.
async fn redirect(stream: &mut TcpStream, registry: &DomainRegistry) -> std::io::Result<()> {
    let mut chunk = vec![0u8; FRONT_READ_BUFFER];
    let n = stream.read(&mut chunk).await?;
    chunk.truncate(n);

    let response = match parse_request_line(&chunk) {
        Some(line) if registry.has(&line.host) => {
            tracing::debug!(host = %line.host, path = %line.path, "Redirecting to HTTPS");
            response_308(&line.host, &line.path)
        }
        Some(line) => {
            tracing::debug!(host = %line.host, "Unknown domain");
            RESPONSE_400.to_string()
        }
        None => {
            tracing::debug!("Unparsable plaintext request");
            RESPONSE_400.to_string()
        }
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
