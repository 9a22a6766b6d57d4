//! HMAC-SHA256 signatures for provider webhooks (payment, refund).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Webhook secret is not configured")]
    MissingSecret,

    #[error("Signature is not valid hex")]
    Encoding,

    #[error("Signature mismatch")]
    Mismatch,
}

pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, SignatureError> {
    let mac = keyed(secret)?;
    Ok(hex::encode(mac.chain_update(payload).finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `payload`.
pub fn verify_payload(secret: &str, payload: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::Encoding)?;
    keyed(secret)?
        .chain_update(payload)
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn keyed(secret: &str) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::MissingSecret);
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::MissingSecret)
}
