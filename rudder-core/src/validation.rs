// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pure per-resource validation. Given equal input bytes these functions
//! produce equal output; nothing here consults the store or the clock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use rudder_k8s::ObjectKey;

use crate::dag::{LbStrategy, UpstreamProtocol};

/// Kubernetes TLS secret type.
const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
const CA_CERT_KEY: &str = "ca.crt";

/// A timeout setting parsed from user input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Not configured; the proxy default applies.
    #[default]
    Unset,
    /// Explicitly disabled ("infinity").
    Disabled,
    /// A concrete duration, possibly zero.
    Duration(std::time::Duration),
}

impl Timeout {
    pub fn is_unset(&self) -> bool {
        matches!(self, Timeout::Unset)
    }
}

/// Parses a user supplied timeout. `None` means unset; "infinity" and
/// "infinite" disable the timeout; anything else must be a duration string
/// (e.g. "90s", "1m30s").
pub fn parse_timeout(value: Option<&str>) -> Result<Timeout, String> {
    match value.map(str::trim) {
        None | Some("") => Ok(Timeout::Unset),
        Some("infinity") | Some("infinite") => Ok(Timeout::Disabled),
        Some(s) => humantime::parse_duration(s)
            .map(Timeout::Duration)
            .map_err(|e| format!("invalid duration {s:?}: {e}")),
    }
}

/// The load balancing strategies this control plane understands. Unknown
/// strategies are rejected rather than silently defaulted.
pub fn parse_lb_strategy(value: Option<&str>) -> Result<LbStrategy, String> {
    match value {
        None | Some("") | Some("RoundRobin") => Ok(LbStrategy::RoundRobin),
        Some("WeightedLeastRequest") => Ok(LbStrategy::WeightedLeastRequest),
        Some("Random") => Ok(LbStrategy::Random),
        Some("RingHash") => Ok(LbStrategy::RingHash),
        Some("Maglev") => Ok(LbStrategy::Maglev),
        Some("Cookie") => Ok(LbStrategy::Cookie),
        Some("RequestHash") => Ok(LbStrategy::RequestHash),
        Some(other) => Err(format!("invalid load balancer strategy {other:?}")),
    }
}

/// Upstream protocol override: "h2", "h2c" or "tls".
pub fn parse_upstream_protocol(value: Option<&str>) -> Result<Option<UpstreamProtocol>, String> {
    match value {
        None | Some("") => Ok(None),
        Some("h2") => Ok(Some(UpstreamProtocol::H2)),
        Some("h2c") => Ok(Some(UpstreamProtocol::H2c)),
        Some("tls") => Ok(Some(UpstreamProtocol::Tls)),
        Some(other) => Err(format!("invalid upstream protocol {other:?}")),
    }
}

/// Validates a virtual host FQDN. A wildcard is only permitted as the entire
/// first label (`*.example.com`).
pub fn validate_fqdn(fqdn: &str) -> Result<(), String> {
    if fqdn.is_empty() {
        return Err("fqdn must not be empty".to_string());
    }
    if fqdn.contains("://") {
        return Err(format!("fqdn {fqdn:?} must not contain a scheme"));
    }
    if fqdn.ends_with('.') {
        return Err(format!("fqdn {fqdn:?} must not end with a dot"));
    }

    let mut labels = fqdn.split('.');
    let first = labels.next().unwrap_or_default();
    if first != "*" && !valid_dns_label(first) {
        return Err(format!("fqdn {fqdn:?} has an invalid label {first:?}"));
    }
    if first == "*" && fqdn == "*" {
        return Err("fqdn must not be a bare wildcard".to_string());
    }
    for label in labels {
        if label == "*" {
            return Err(format!(
                "fqdn {fqdn:?}: wildcard is only permitted as the first label"
            ));
        }
        if !valid_dns_label(label) {
            return Err(format!("fqdn {fqdn:?} has an invalid label {label:?}"));
        }
    }
    Ok(())
}

fn valid_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// True for the `*.suffix` form accepted by [`validate_fqdn`].
pub fn is_wildcard_fqdn(fqdn: &str) -> bool {
    fqdn.starts_with("*.")
}

/// A TLS serving certificate that passed validation. Raw PEM is carried
/// through to the proxy untouched; expiry is informational only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidTlsSecret {
    pub key: ObjectKey,
    pub cert_chain: Bytes,
    pub private_key: Bytes,
    /// Leaf certificate expiry. Never used for rejection, surfaced through
    /// resource status.
    pub not_after: Option<DateTime<Utc>>,
}

/// Whether the store should retain this secret at all: TLS serving secrets
/// and CA bundles pass, everything else is dropped at the boundary.
pub fn is_recognised_secret(secret: &Secret) -> bool {
    let data = match &secret.data {
        Some(data) => data,
        None => return false,
    };
    let is_tls = secret.type_.as_deref() == Some(SECRET_TYPE_TLS)
        && data.contains_key(TLS_CERT_KEY)
        && data.contains_key(TLS_PRIVATE_KEY_KEY);
    is_tls || data.contains_key(CA_CERT_KEY)
}

/// Validates a `kubernetes.io/tls` secret: the chain must be parseable PEM,
/// and the private key must cryptographically match the leaf certificate.
pub fn validate_tls_secret(secret: &Secret) -> Result<ValidTlsSecret, String> {
    if secret.type_.as_deref() != Some(SECRET_TYPE_TLS) {
        return Err(format!(
            "secret type {:?} is not {SECRET_TYPE_TLS}",
            secret.type_.as_deref().unwrap_or("")
        ));
    }
    let data = secret.data.as_ref().ok_or("secret has no data")?;
    let cert_pem = data
        .get(TLS_CERT_KEY)
        .map(|b| b.0.as_slice())
        .ok_or_else(|| format!("missing {TLS_CERT_KEY} key"))?;
    let key_pem = data
        .get(TLS_PRIVATE_KEY_KEY)
        .map(|b| b.0.as_slice())
        .ok_or_else(|| format!("missing {TLS_PRIVATE_KEY_KEY} key"))?;

    let not_after = validate_keypair(cert_pem, key_pem)?;

    Ok(ValidTlsSecret {
        key: ObjectKey::from_meta(&secret.metadata),
        cert_chain: Bytes::copy_from_slice(cert_pem),
        private_key: Bytes::copy_from_slice(key_pem),
        not_after,
    })
}

/// Extracts and validates the `ca.crt` bundle from a secret.
pub fn ca_bundle(secret: &Secret) -> Result<Bytes, String> {
    let data = secret.data.as_ref().ok_or("secret has no data")?;
    let bundle = data
        .get(CA_CERT_KEY)
        .map(|b| b.0.as_slice())
        .ok_or_else(|| format!("missing {CA_CERT_KEY} key"))?;
    if bundle.is_empty() {
        return Err(format!("{CA_CERT_KEY} is empty"));
    }

    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut &*bundle).collect();
    let certs = certs.map_err(|e| format!("{CA_CERT_KEY} is not valid PEM: {e}"))?;
    if certs.is_empty() {
        return Err(format!("{CA_CERT_KEY} contains no certificates"));
    }
    for der in &certs {
        x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| format!("{CA_CERT_KEY} contains an unparseable certificate: {e}"))?;
    }
    Ok(Bytes::copy_from_slice(bundle))
}

/// Checks the PEM pair: chain parses, leaf and key agree. Returns the leaf
/// expiry.
fn validate_keypair(cert_pem: &[u8], key_pem: &[u8]) -> Result<Option<DateTime<Utc>>, String> {
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut &*cert_pem).collect();
    let certs = certs.map_err(|e| format!("certificate chain is not valid PEM: {e}"))?;
    if certs.is_empty() {
        return Err("certificate chain contains no certificates".to_string());
    }

    let mut not_after = None;
    for (i, der) in certs.iter().enumerate() {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| format!("certificate {i} in chain is unparseable: {e}"))?;
        if i == 0 {
            not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0);
        }
    }

    let key = rustls_pemfile::private_key(&mut &*key_pem)
        .map_err(|e| format!("private key is not valid PEM: {e}"))?
        .ok_or("no private key found")?;
    let signer = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| format!("unsupported private key type: {e}"))?;

    let certified = rustls::sign::CertifiedKey::new(certs, signer);
    match certified.keys_match() {
        // Unknown means the key type cannot expose its public half for
        // comparison; accept, the proxy will reject it at handshake if wrong.
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::KeyMismatch)) => {
            return Err("certificate and private key do not match".to_string());
        }
        Err(e) => return Err(format!("certificate/key validation failed: {e}")),
    }

    Ok(not_after)
}
