//! Stateless plan tickets: `<b64url(json)>.<b64url(hmac-sha256)>`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("invalid ticket format")]
    Format,
    #[error("invalid ticket encoding")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid ticket signature")]
    Signature,
    #[error("invalid ticket payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("ticket signing key rejected")]
    Key,
}

/// What a generated plan hands back to the client for a later save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPayload {
    pub plan_id: i64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TicketSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TicketSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketSigner").finish_non_exhaustive()
    }
}

impl TicketSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, TicketError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| TicketError::Key)
    }

    /// Signs the compact JSON encoding of `payload`.
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String, TicketError> {
        let body = serde_json::to_vec(payload)?;
        let mut mac = self.mac()?;
        mac.update(&body);
        let tag = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Checks the tag in constant time and decodes the payload.
    pub fn verify<T: DeserializeOwned>(&self, ticket: &str) -> Result<T, TicketError> {
        let (body_b64, tag_b64) = ticket.split_once('.').ok_or(TicketError::Format)?;
        let body = URL_SAFE_NO_PAD.decode(body_b64)?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64)?;

        let mut mac = self.mac()?;
        mac.update(&body);
        mac.verify_slice(&tag).map_err(|_| TicketError::Signature)?;

        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn signer() -> TicketSigner {
        TicketSigner::new("test-secret")
    }

    #[test]
    fn matches_known_ticket_encoding() {
        let ticket = signer().sign(&json!({"plan_id": 7})).unwrap();
        assert_eq!(
            ticket,
            "eyJwbGFuX2lkIjo3fQ.e66-wGdLSbBZglsRkHItkJ_AYvLG1jzAnVJHhkzTU6Y"
        );
    }

    #[test]
    fn payload_survives_sign_then_verify() {
        let payload = TicketPayload {
            plan_id: 42,
            issued_at: Utc.with_ymd_and_hms(2025, 8, 19, 1, 0, 0).single().unwrap(),
        };
        let ticket = signer().sign(&payload).unwrap();
        let back: TicketPayload = signer().verify(&ticket).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn tampered_or_foreign_tickets_are_rejected() {
        let ticket = signer().sign(&json!({"plan_id": 7})).unwrap();
        let (_, tag) = ticket.split_once('.').unwrap();

        let forged_body = format!("{}.{tag}", URL_SAFE_NO_PAD.encode(br#"{"plan_id":8}"#));
        assert!(matches!(
            signer().verify::<Value>(&forged_body),
            Err(TicketError::Signature)
        ));

        assert!(matches!(
            TicketSigner::new("other-secret").verify::<Value>(&ticket),
            Err(TicketError::Signature)
        ));
    }

    #[test]
    fn malformed_tickets_are_rejected() {
        assert!(matches!(signer().verify::<Value>("no-dot-here"), Err(TicketError::Format)));
        assert!(matches!(
            signer().verify::<Value>("***.***"),
            Err(TicketError::Encoding(_))
        ));
    }
}
