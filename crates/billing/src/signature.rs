//! Webhook signature verification
//!
//! Provider envelopes are signed with HMAC-SHA256 over `{t}.{payload}` and
//! delivered with a `Stripe-Signature: t=...,v1=...[,v1=...]` header. Nothing
//! below this layer ever sees an envelope that failed these checks.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::WebhookSecurity;
use crate::events::WebhookEnvelope;

type HmacSha256 = Hmac<Sha256>;

/// Header name carrying the provider signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing signature header")]
    MissingHeader,

    #[error("Malformed signature header")]
    MalformedHeader,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// How the envelope was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Signature,
    SkippedUnverified,
}

/// An envelope that passed verification, with the exact bytes it came from
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    pub envelope: WebhookEnvelope,
    pub raw: serde_json::Value,
    pub verification: Verification,
}

#[derive(Debug, Clone)]
pub enum WebhookVerifier {
    Signed { secret: String, tolerance: Duration },
    Unverified,
}

impl WebhookVerifier {
    pub fn signed(secret: impl Into<String>, tolerance: Duration) -> Self {
        WebhookVerifier::Signed {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Development only. Anyone who can reach the endpoint can forge events.
    pub fn dangerously_unverified() -> Self {
        WebhookVerifier::Unverified
    }

    pub fn from_security(security: &WebhookSecurity) -> Self {
        match security {
            WebhookSecurity::Signed { secret, tolerance } => Self::signed(secret.clone(), *tolerance),
            WebhookSecurity::Unverified => Self::dangerously_unverified(),
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, WebhookVerifier::Signed { .. })
    }

    pub fn verify(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<VerifiedEnvelope, VerificationError> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock reading (unix seconds)
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> Result<VerifiedEnvelope, VerificationError> {
        let verification = match self {
            WebhookVerifier::Signed { secret, tolerance } => {
                let header = signature.ok_or(VerificationError::MissingHeader)?;
                let (timestamp, candidates) = parse_header(header)?;

                let drift = now.abs_diff(timestamp);
                if drift > tolerance.as_secs() {
                    tracing::warn!(
                        timestamp = timestamp,
                        now = now,
                        drift = drift,
                        "Webhook timestamp outside tolerance"
                    );
                    return Err(VerificationError::StaleTimestamp);
                }

                let expected = sign_payload(secret, timestamp, payload);
                let matched = candidates
                    .iter()
                    .any(|c| bool::from(c.as_bytes().ct_eq(expected.as_bytes())));
                if !matched {
                    tracing::warn!(candidates = candidates.len(), "Webhook signature mismatch");
                    return Err(VerificationError::SignatureMismatch);
                }
                Verification::Signature
            }
            WebhookVerifier::Unverified => Verification::SkippedUnverified,
        };

        let raw: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;
        let envelope = WebhookEnvelope::deserialize(&raw)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        if verification == Verification::SkippedUnverified {
            tracing::warn!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Accepting UNVERIFIED webhook envelope"
            );
        }

        Ok(VerifiedEnvelope {
            envelope,
            raw,
            verification,
        })
    }
}

/// Hex HMAC-SHA256 of `{timestamp}.{payload}`, as the provider computes it
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Build a complete signature header for `payload` (tests and local tooling)
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, payload))
}

fn parse_header(header: &str) -> Result<(i64, Vec<&str>), VerificationError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| VerificationError::MalformedHeader)?,
                )
            }
            "v1" => candidates.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(t) if !candidates.is_empty() => Ok((t, candidates)),
        _ => Err(VerificationError::MalformedHeader),
    }
}
