//! Asynchronous certificate loading.
//!
//! Reads PEM key/certificate files off the handshake path, builds the
//! immutable TLS context, and publishes it into the domain registry.
//! Outcomes are reported on the event bus; a failed load leaves the domain
//! unresolvable with no automatic retry.

use std::sync::Arc;

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::ServerError;
use crate::events::{EventBus, ServerEvent};
use crate::registry::DomainRegistry;

/// Load a domain's key and certificate and publish the resulting context.
///
/// Spawned by [`DomainRegistry::register`]; has no caller-visible return
/// value. Success emits `Registered`, failure emits `CertificateError`.
pub async fn load(
    registry: Arc<DomainRegistry>,
    events: EventBus,
    domain: String,
    key_path: String,
    cert_path: String,
) {
    match read_and_build(&domain, &key_path, &cert_path).await {
        Ok(key) => {
            registry.publish_context(&domain, key);
            tracing::info!(%domain, cert = %cert_path, "Certificate loaded");
            // The channel exists from registration; it can only be absent
            // if the registry somehow lost the entry, which register()
            // precludes.
            if let Some(channel) = registry.channel_of(&domain) {
                events.emit(ServerEvent::Registered { domain, channel });
            }
        }
        Err(err) => {
            tracing::warn!(%domain, error = %err, "Certificate load failed");
            events.emit(ServerEvent::CertificateError {
                domain,
                reason: err.to_string(),
            });
        }
    }
}

/// Read both PEM files and construct the certificate context.
async fn read_and_build(
    domain: &str,
    key_path: &str,
    cert_path: &str,
) -> Result<Arc<CertifiedKey>, ServerError> {
    let key_bytes = tokio::fs::read(key_path)
        .await
        .map_err(|source| ServerError::CertificateLoad {
            domain: domain.to_string(),
            source,
        })?;
    let cert_bytes = tokio::fs::read(cert_path)
        .await
        .map_err(|source| ServerError::CertificateLoad {
            domain: domain.to_string(),
            source,
        })?;

    build_context(domain, &cert_bytes, &key_bytes)
}

/// Build an immutable TLS context from PEM bytes.
pub fn build_context(
    domain: &str,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<CertifiedKey>, ServerError> {
    let construction = |reason: String| ServerError::ContextConstruction {
        domain: domain.to_string(),
        reason,
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| construction(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(construction("no certificates in PEM".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| construction(format!("bad key PEM: {e}")))?
        .ok_or_else(|| construction("no private key in PEM".to_string()))?;

    let signing_key =
        any_supported_type(&key).map_err(|e| construction(format!("unusable key: {e}")))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DomainContext, Registration};
    use std::io::Write;

    fn write_pem_pair(dir: &tempfile::TempDir) -> (String, String) {
        let signed = rcgen::generate_simple_self_signed(vec!["a.example".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(signed.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(signed.key_pair.serialize_pem().as_bytes())
            .unwrap();
        (
            key_path.to_string_lossy().into_owned(),
            cert_path.to_string_lossy().into_owned(),
        )
    }

    #[tokio::test]
    async fn test_load_publishes_context_and_emits_registered() {
        let dir = tempfile::tempdir().unwrap();
        let (key_path, cert_path) = write_pem_pair(&dir);

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = DomainRegistry::new(events.clone());
        registry.register(
            "a.example",
            Registration::Files {
                key_path,
                cert_path,
            },
        );

        match rx.recv().await.unwrap() {
            ServerEvent::Registered { domain, .. } => assert_eq!(domain, "a.example"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            registry.context_of("a.example"),
            Some(DomainContext::Context(_))
        ));
        assert!(registry.resolve("a.example").is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_reports_certificate_error() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = DomainRegistry::new(events.clone());

        load(
            registry.clone(),
            events,
            "a.example".to_string(),
            "/nonexistent/key.pem".to_string(),
            "/nonexistent/cert.pem".to_string(),
        )
        .await;

        match rx.recv().await.unwrap() {
            ServerEvent::CertificateError { domain, .. } => assert_eq!(domain, "a.example"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_bytes_report_certificate_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, b"not a certificate").unwrap();
        std::fs::write(&key_path, b"not a key").unwrap();

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = DomainRegistry::new(events.clone());
        registry.register(
            "a.example",
            Registration::Files {
                key_path: key_path.to_string_lossy().into_owned(),
                cert_path: cert_path.to_string_lossy().into_owned(),
            },
        );

        match rx.recv().await.unwrap() {
            ServerEvent::CertificateError { domain, .. } => assert_eq!(domain, "a.example"),
            other => panic!("unexpected event: {:?}", other),
        }
        // The entry survives, unresolvable.
        assert!(registry.has("a.example"));
        assert!(registry.resolve("a.example").is_err());
    }

    #[test]
    fn test_build_context_rejects_empty_pem() {
        assert!(matches!(
            build_context("a.example", b"", b""),
            Err(ServerError::ContextConstruction { .. })
        ));
    }
}
