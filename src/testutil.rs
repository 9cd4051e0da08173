//! Shared helpers for unit tests.

use std::sync::Arc;

use rustls::sign::CertifiedKey;

/// Mint a self-signed certificate context for `domain`.
pub(crate) fn certified_key_for(domain: &str) -> Arc<CertifiedKey> {
    let signed = rcgen::generate_simple_self_signed(vec![domain.to_string()])
        .expect("self-signed certificate generation");
    crate::loader::build_context(
        domain,
        signed.cert.pem().as_bytes(),
        signed.key_pair.serialize_pem().as_bytes(),
    )
    .expect("context from freshly minted PEM")
}
