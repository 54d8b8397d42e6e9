//! Interaction signature check
//!
//! Discord signs every interaction with the application's ed25519 key over
//! `timestamp || body` and sends the result hex-encoded in headers.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("public key is not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("public key must be 32 bytes, got {0}")]
    Length(usize),

    #[error("invalid public key: {0}")]
    Invalid(#[from] ed25519_dalek::SignatureError),
}

#[derive(Clone)]
pub struct InteractionVerifier {
    key: VerifyingKey,
}

impl InteractionVerifier {
    /// Parse the application's hex public key
    pub fn from_hex(public_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(public_key.trim())?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        Ok(Self {
            key: VerifyingKey::from_bytes(&bytes)?,
        })
    }

    pub fn verify(&self, signature: &str, timestamp: &str, body: &[u8]) -> bool {
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.key.verify(&message, &signature).is_ok()
    }
}
