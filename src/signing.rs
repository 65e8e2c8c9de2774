//! Payment signing and verification capabilities.
//!
//! Settlement never signs or checks signatures itself; it asks a
//! `PaymentSigner` for the payer's signed payment and a `PaymentVerifier` to
//! accept or refuse it. The stub pair reproduces the pass-through reference
//! flow; the Ed25519 keyring signs the challenge's canonical bytes for real.

use crate::{
    error::{NegotiationError, Result, VerificationFailure},
    model::{PaymentChallenge, SignedPayment},
    AgentId,
};
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;

#[cfg_attr(test, mockall::automock)]
pub trait PaymentSigner: Send + Sync {
    fn sign(&self, challenge: &PaymentChallenge, payer_id: &str, amount: f64) -> Result<SignedPayment>;
}

#[cfg_attr(test, mockall::automock)]
pub trait PaymentVerifier: Send + Sync {
    fn verify(
        &self,
        challenge: &PaymentChallenge,
        payment: &SignedPayment,
    ) -> std::result::Result<(), VerificationFailure>;
}

/// Passes the requested amount through without producing a signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubSigner;

impl PaymentSigner for StubSigner {
    fn sign(&self, _challenge: &PaymentChallenge, payer_id: &str, amount: f64) -> Result<SignedPayment> {
        Ok(SignedPayment {
            payer_id: payer_id.to_string(),
            amount,
            signature: None,
        })
    }
}

/// Accepts every payment. Not for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl PaymentVerifier for AcceptAllVerifier {
    fn verify(
        &self,
        _challenge: &PaymentChallenge,
        _payment: &SignedPayment,
    ) -> std::result::Result<(), VerificationFailure> {
        Ok(())
    }
}

/// Ed25519 keys per payer. Keys are ephemeral: an unknown payer gets a fresh
/// key on first signature and nothing is persisted.
#[derive(Default)]
pub struct Ed25519Keyring {
    keys: RwLock<HashMap<AgentId, SigningKey>>,
}

impl Ed25519Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, payer_id: &str) -> VerifyingKey {
        if let Some(key) = self.keys.read().get(payer_id) {
            return key.verifying_key();
        }

        let mut keys = self.keys.write();
        let key = keys.entry(payer_id.to_string()).or_insert_with(|| {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            SigningKey::from_bytes(&seed)
        });
        key.verifying_key()
    }

    pub fn verifying_key(&self, payer_id: &str) -> Option<VerifyingKey> {
        self.keys.read().get(payer_id).map(SigningKey::verifying_key)
    }
}

impl PaymentSigner for Ed25519Keyring {
    fn sign(&self, challenge: &PaymentChallenge, payer_id: &str, amount: f64) -> Result<SignedPayment> {
        use ed25519_dalek::Signer;

        self.register(payer_id);
        let keys = self.keys.read();
        let key = keys
            .get(payer_id)
            .ok_or_else(|| NegotiationError::Signing(format!("No signing key for {}", payer_id)))?;

        let signature = key.sign(&challenge.signing_bytes(payer_id, amount));
        Ok(SignedPayment {
            payer_id: payer_id.to_string(),
            amount,
            signature: Some(general_purpose::STANDARD.encode(signature.to_bytes())),
        })
    }
}

impl PaymentVerifier for Ed25519Keyring {
    fn verify(
        &self,
        challenge: &PaymentChallenge,
        payment: &SignedPayment,
    ) -> std::result::Result<(), VerificationFailure> {
        use ed25519_dalek::Verifier;

        let verifying_key = self.verifying_key(&payment.payer_id).ok_or_else(|| {
            VerificationFailure::InvalidSignature(format!("unknown payer {}", payment.payer_id))
        })?;

        let encoded = payment
            .signature
            .as_deref()
            .ok_or_else(|| VerificationFailure::InvalidSignature("missing signature".to_string()))?;

        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VerificationFailure::InvalidSignature(format!("bad encoding: {}", e)))?;

        let signature = Signature::from_slice(&bytes)
            .map_err(|e| VerificationFailure::InvalidSignature(e.to_string()))?;

        verifying_key
            .verify(&challenge.signing_bytes(&payment.payer_id, payment.amount), &signature)
            .map_err(|e| VerificationFailure::InvalidSignature(e.to_string()))
    }
}
