//! x402-style settlement: challenge, sign, verify, confirm.
//!
//! `CREATED -> CHALLENGED -> (VERIFIED | EXPIRED | MISMATCHED) -> (CONFIRMED | FAILED)`.
//! There is no retry inside an attempt; a caller that wants another try asks
//! for a new settlement and gets a new challenge with a new nonce.

use crate::{
    clock::{Clock, SystemClock},
    error::{NegotiationError, Result, VerificationFailure},
    model::{PaymentChallenge, SettlementRequest, SettlementResult, SettlementStatus, SignedPayment},
    reputation::ReputationLedger,
    signing::{AcceptAllVerifier, PaymentSigner, PaymentVerifier, StubSigner},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Transaction hash reported for failed settlements.
pub const FAILED_TX_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// Slack on the tolerance comparison so a difference equal to the tolerance
/// in decimal terms is not refused over binary rounding.
const AMOUNT_EPSILON: f64 = 1e-9;

const ADDRESS_HEX_LEN: usize = 40;

pub trait NonceSource: Send + Sync {
    fn next_nonce(&self) -> String;
}

/// 16 random bytes, hex-encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNonce;

impl NonceSource for RandomNonce {
    fn next_nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Always hands out the same nonce. Only useful for reproducible tests.
#[derive(Debug, Clone)]
pub struct FixedNonce(pub String);

impl NonceSource for FixedNonce {
    fn next_nonce(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementOptions {
    pub challenge_ttl: chrono::Duration,
    /// Absolute, in currency units.
    pub amount_tolerance: f64,
    pub simulated_latency: Duration,
    pub timeout: Duration,
}

impl Default for SettlementOptions {
    fn default() -> Self {
        Self {
            challenge_ttl: chrono::Duration::seconds(300),
            amount_tolerance: 0.01,
            simulated_latency: Duration::ZERO,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Receiver address derived from the seller id: `0x` plus the first 40 hex
/// digits of its SHA-256.
pub fn derive_receiver_address(seller_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(seller_id.as_bytes()));
    format!("0x{}", &digest[..ADDRESS_HEX_LEN])
}

/// Pure function of its inputs; identical inputs always give the same hash.
pub fn derive_tx_hash(
    buyer_id: &str,
    seller_id: &str,
    amount: f64,
    nonce: &str,
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(buyer_id.as_bytes());
    hasher.update(b"|");
    hasher.update(seller_id.as_bytes());
    hasher.update(b"|");
    hasher.update(amount.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

pub struct SettlementEngine {
    clock: Arc<dyn Clock>,
    nonces: Arc<dyn NonceSource>,
    signer: Arc<dyn PaymentSigner>,
    verifier: Arc<dyn PaymentVerifier>,
    reputation: Arc<ReputationLedger>,
    options: SettlementOptions,
}

impl SettlementEngine {
    /// Reference wiring: wall clock, random nonces, pass-through signing.
    pub fn new(reputation: Arc<ReputationLedger>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            nonces: Arc::new(RandomNonce),
            signer: Arc::new(StubSigner),
            verifier: Arc::new(AcceptAllVerifier),
            reputation,
            options: SettlementOptions::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_nonce_source(mut self, nonces: Arc<dyn NonceSource>) -> Self {
        self.nonces = nonces;
        self
    }

    pub fn with_signing(mut self, signer: Arc<dyn PaymentSigner>, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.signer = signer;
        self.verifier = verifier;
        self
    }

    pub fn with_options(mut self, options: SettlementOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SettlementOptions {
        &self.options
    }

    pub fn reputation(&self) -> &Arc<ReputationLedger> {
        &self.reputation
    }

    pub fn create_challenge(
        &self,
        seller_id: &str,
        amount: f64,
        asset: &str,
        network: &str,
    ) -> Result<PaymentChallenge> {
        if seller_id.is_empty() {
            return Err(NegotiationError::Validation("seller_id cannot be empty".to_string()));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(NegotiationError::Validation(format!(
                "Challenge amount must be positive, got {}",
                amount
            )));
        }

        let issued_at = self.clock.now();
        Ok(PaymentChallenge {
            receiver_address: derive_receiver_address(seller_id),
            amount,
            asset: asset.to_string(),
            network: network.to_string(),
            nonce: self.nonces.next_nonce(),
            issued_at,
            expires_at: issued_at + self.options.challenge_ttl,
        })
    }

    /// Expiry and amount check only; signatures are the verifier's business.
    pub fn verify_payment(&self, challenge: &PaymentChallenge, buyer_id: &str, signed_amount: f64) -> bool {
        let payment = SignedPayment {
            payer_id: buyer_id.to_string(),
            amount: signed_amount,
            signature: None,
        };
        self.check_terms(challenge, &payment).is_ok()
    }

    fn check_terms(
        &self,
        challenge: &PaymentChallenge,
        payment: &SignedPayment,
    ) -> std::result::Result<(), VerificationFailure> {
        let now = self.clock.now();
        if challenge.is_expired_at(now) {
            return Err(VerificationFailure::ExpiredChallenge {
                expired_at: challenge.expires_at,
                checked_at: now,
            });
        }

        let diff = (payment.amount - challenge.amount).abs();
        if !diff.is_finite() || diff > self.options.amount_tolerance + AMOUNT_EPSILON {
            return Err(VerificationFailure::AmountMismatch {
                expected: challenge.amount,
                signed: payment.amount,
            });
        }

        Ok(())
    }

    /// Full check of a signed payment: expiry, amount, payer, then signature.
    pub fn check_payment(
        &self,
        challenge: &PaymentChallenge,
        buyer_id: &str,
        payment: &SignedPayment,
    ) -> std::result::Result<(), VerificationFailure> {
        self.check_terms(challenge, payment)?;
        if payment.payer_id != buyer_id {
            return Err(VerificationFailure::InvalidSignature(format!(
                "payment signed by {} instead of {}",
                payment.payer_id, buyer_id
            )));
        }
        self.verifier.verify(challenge, payment)
    }

    fn validate_request(request: &SettlementRequest) -> Result<()> {
        if !request.agreed_price.is_finite() || request.agreed_price <= 0.0 {
            return Err(NegotiationError::Validation(format!(
                "agreed_price must be positive, got {}",
                request.agreed_price
            )));
        }
        if request.buyer_id.is_empty() || request.seller_id.is_empty() {
            return Err(NegotiationError::Validation("buyer_id and seller_id are required".to_string()));
        }
        if request.buyer_id == request.seller_id {
            return Err(NegotiationError::Validation("buyer and seller must be different agents".to_string()));
        }
        Ok(())
    }

    pub async fn execute_settlement(&self, request: &SettlementRequest) -> Result<SettlementResult> {
        Self::validate_request(request)?;
        let start_time = self.clock.now();

        let challenge = self.create_challenge(
            &request.seller_id,
            request.agreed_price,
            &request.asset,
            &request.network,
        )?;
        tracing::info!(
            buyer_id = %request.buyer_id,
            seller_id = %request.seller_id,
            amount = challenge.amount,
            receiver = %challenge.receiver_address,
            nonce = %challenge.nonce,
            "Issued payment challenge"
        );

        // Stand-in for the round trip to the payer.
        if !self.options.simulated_latency.is_zero() {
            tokio::time::sleep(self.options.simulated_latency).await;
        }
        tokio::task::yield_now().await;

        let payment = self.signer.sign(&challenge, &request.buyer_id, request.agreed_price)?;
        let verdict = self.check_payment(&challenge, &request.buyer_id, &payment);

        let timestamp = self.clock.now();
        let settlement_time = ((timestamp - start_time).num_milliseconds().max(0) as f64) / 1000.0;

        match verdict {
            Ok(()) => {
                let tx_hash = derive_tx_hash(
                    &request.buyer_id,
                    &request.seller_id,
                    request.agreed_price,
                    &challenge.nonce,
                    timestamp,
                );
                let (buyer, seller) = self.reputation.update_pair_after_deal(
                    &request.buyer_id,
                    &request.seller_id,
                    true,
                    request.agreed_price,
                    settlement_time,
                )?;

                tracing::info!(
                    %tx_hash,
                    amount = request.agreed_price,
                    buyer_score = buyer.score,
                    seller_score = seller.score,
                    "Settlement confirmed"
                );

                Ok(SettlementResult {
                    tx_hash,
                    buyer_id: request.buyer_id.clone(),
                    seller_id: request.seller_id.clone(),
                    amount: request.agreed_price,
                    asset: request.asset.clone(),
                    sla_tier: request.sla_tier.clone(),
                    timestamp,
                    buyer_reputation_after: buyer.score,
                    seller_reputation_after: seller.score,
                    status: SettlementStatus::Confirmed,
                    settlement_time_secs: settlement_time,
                    failure_reason: None,
                })
            }
            Err(reason) => {
                tracing::warn!(
                    buyer_id = %request.buyer_id,
                    seller_id = %request.seller_id,
                    retryable = reason.is_retryable(),
                    "Settlement failed: {}",
                    reason
                );
                Ok(self.failed_result(request, timestamp, settlement_time, reason))
            }
        }
    }

    /// `execute_settlement` bounded by the configured timeout. Elapsing maps
    /// to a `FAILED` result; reputation is only touched after the last await
    /// point, so a timed-out attempt never leaves a partial update.
    pub async fn execute_settlement_with_timeout(&self, request: &SettlementRequest) -> Result<SettlementResult> {
        Self::validate_request(request)?;
        let start_time = self.clock.now();
        let limit = self.options.timeout;

        match tokio::time::timeout(limit, self.execute_settlement(request)).await {
            Ok(result) => result,
            Err(_) => {
                let timestamp = self.clock.now();
                let settlement_time = ((timestamp - start_time).num_milliseconds().max(0) as f64) / 1000.0;
                let reason = VerificationFailure::Timeout {
                    after_ms: limit.as_millis() as u64,
                };
                tracing::warn!(
                    buyer_id = %request.buyer_id,
                    seller_id = %request.seller_id,
                    "Settlement failed: {}",
                    reason
                );
                Ok(self.failed_result(request, timestamp, settlement_time, reason))
            }
        }
    }

    fn failed_result(
        &self,
        request: &SettlementRequest,
        timestamp: DateTime<Utc>,
        settlement_time: f64,
        reason: VerificationFailure,
    ) -> SettlementResult {
        SettlementResult {
            tx_hash: FAILED_TX_HASH.to_string(),
            buyer_id: request.buyer_id.clone(),
            seller_id: request.seller_id.clone(),
            amount: request.agreed_price,
            asset: request.asset.clone(),
            sla_tier: request.sla_tier.clone(),
            timestamp,
            buyer_reputation_after: self.reputation.score_of(&request.buyer_id),
            seller_reputation_after: self.reputation.score_of(&request.seller_id),
            status: SettlementStatus::Failed,
            settlement_time_secs: settlement_time,
            failure_reason: Some(reason),
        }
    }
}
