//! Webhook signature handling
//!
//! The signature header carries the hex encoded HMAC-SHA256 of the raw
//! request body, keyed with the subscriber's secret.

use crate::{Result, WebhookError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default signature header name
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Webhook signer for generating signatures
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl WebhookSigner {
    /// Create a new signer with a secret
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Hex encoded HMAC-SHA256 of `payload`
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(compute_mac(&self.secret, payload))
    }
}

/// Webhook verifier for validating signatures on the receiving side
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    /// Create a new verifier with a secret
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Verify a webhook signature header value
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<()> {
        let provided = hex::decode(signature.trim()).map_err(|_| {
            WebhookError::SignatureVerificationFailed("Signature is not hex encoded".to_string())
        })?;

        // verify_slice compares in constant time
        let mut mac = new_mac(&self.secret);
        mac.update(payload);
        mac.verify_slice(&provided).map_err(|_| {
            WebhookError::SignatureVerificationFailed("No matching signature found".to_string())
        })
    }
}

fn new_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC can accept any key length")
}

fn compute_mac(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(secret);
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Generate a secure random webhook secret
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let secret: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(secret))
}
