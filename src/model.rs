use crate::{error::VerificationFailure, AgentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_SLA_TIER: &str = "standard";
pub const DEFAULT_ASSET: &str = "USDC";
pub const DEFAULT_NETWORK: &str = "base";

/// Score every agent starts from before its first deal.
pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationStatus {
    Pending,
    Agreed,
    Rejected,
    TimedOut,
}

/// Outcome of one negotiation run. `agreed_price` and `agreed_sla` are
/// present exactly when `status` is `Agreed`; the constructors are the only
/// way to build one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationResult {
    status: NegotiationStatus,
    agreed_price: Option<f64>,
    agreed_sla: Option<String>,
    rounds_taken: u32,
}

impl NegotiationResult {
    pub fn agreed(price: f64, sla: impl Into<String>, rounds_taken: u32) -> Self {
        Self {
            status: NegotiationStatus::Agreed,
            agreed_price: Some(price),
            agreed_sla: Some(sla.into()),
            rounds_taken,
        }
    }

    pub fn rejected(rounds_taken: u32) -> Self {
        Self {
            status: NegotiationStatus::Rejected,
            agreed_price: None,
            agreed_sla: None,
            rounds_taken,
        }
    }

    pub fn status(&self) -> NegotiationStatus {
        self.status
    }

    pub fn agreed_price(&self) -> Option<f64> {
        self.agreed_price
    }

    pub fn agreed_sla(&self) -> Option<&str> {
        self.agreed_sla.as_deref()
    }

    pub fn rounds_taken(&self) -> u32 {
        self.rounds_taken
    }

    pub fn is_agreed(&self) -> bool {
        self.status == NegotiationStatus::Agreed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationRound {
    pub round: u32,
    pub buyer_ceiling: f64,
    pub seller_floor: f64,
    pub crossed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationTranscript {
    pub negotiation_id: Uuid,
    pub buyer_intent: String,
    pub seller_capability: String,
    pub rounds: Vec<NegotiationRound>,
    pub result: NegotiationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentChallenge {
    pub receiver_address: String,
    pub amount: f64,
    pub asset: String,
    pub network: String,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PaymentChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Canonical bytes a payer signs. Field order is fixed; any change here
    /// invalidates every outstanding signature.
    pub fn signing_bytes(&self, payer_id: &str, amount: f64) -> Vec<u8> {
        format!(
            "x402|{}|{}|{}|{}|{}|{}|{}",
            self.receiver_address,
            amount,
            self.asset,
            self.network,
            self.nonce,
            self.expires_at.timestamp(),
            payer_id
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedPayment {
    pub payer_id: AgentId,
    pub amount: f64,
    /// Base64 signature over `PaymentChallenge::signing_bytes`, if the signer produced one.
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub agreed_price: f64,
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    #[serde(default = "default_sla_tier")]
    pub sla_tier: String,
    #[serde(default = "default_asset")]
    pub asset: String,
    #[serde(default = "default_network")]
    pub network: String,
}

impl SettlementRequest {
    pub fn new(agreed_price: f64, buyer_id: impl Into<AgentId>, seller_id: impl Into<AgentId>) -> Self {
        Self {
            agreed_price,
            buyer_id: buyer_id.into(),
            seller_id: seller_id.into(),
            sla_tier: default_sla_tier(),
            asset: default_asset(),
            network: default_network(),
        }
    }

    pub fn with_sla_tier(mut self, sla_tier: impl Into<String>) -> Self {
        self.sla_tier = sla_tier.into();
        self
    }

    pub fn with_asset(mut self, asset: impl Into<String>, network: impl Into<String>) -> Self {
        self.asset = asset.into();
        self.network = network.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementResult {
    pub tx_hash: String,
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub amount: f64,
    pub asset: String,
    pub sla_tier: String,
    pub timestamp: DateTime<Utc>,
    pub buyer_reputation_after: f64,
    pub seller_reputation_after: f64,
    pub status: SettlementStatus,
    pub settlement_time_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<VerificationFailure>,
}

impl SettlementResult {
    pub fn is_confirmed(&self) -> bool {
        self.status == SettlementStatus::Confirmed
    }
}

/// Immutable reputation snapshot. The ledger replaces records; nothing
/// mutates one after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentReputation {
    pub agent_id: AgentId,
    pub score: f64,
    pub total_deals: u64,
    pub successful_deals: u64,
    pub total_volume: f64,
    pub avg_settlement_time: f64,
}

impl AgentReputation {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self::with_score(agent_id, NEUTRAL_SCORE)
    }

    pub fn with_score(agent_id: impl Into<AgentId>, score: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            score,
            total_deals: 0,
            successful_deals: 0,
            total_volume: 0.0,
            avg_settlement_time: 0.0,
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        if self.total_deals == 0 {
            None
        } else {
            Some(self.successful_deals as f64 / self.total_deals as f64)
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        TrustLevel::from(self.score)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,     // [0.0, 0.3)
    Neutral,       // [0.3, 0.7)
    Trusted,       // [0.7, 0.9)
    HighlyTrusted, // [0.9, 1.0]
}

impl From<f64> for TrustLevel {
    fn from(score: f64) -> Self {
        if score < 0.3 {
            TrustLevel::Untrusted
        } else if score < 0.7 {
            TrustLevel::Neutral
        } else if score < 0.9 {
            TrustLevel::Trusted
        } else {
            TrustLevel::HighlyTrusted
        }
    }
}

fn default_sla_tier() -> String {
    DEFAULT_SLA_TIER.to_string()
}

fn default_asset() -> String {
    DEFAULT_ASSET.to_string()
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_result_json_shape() {
        let agreed = serde_json::to_value(NegotiationResult::agreed(100.0, "standard", 1)).unwrap();
        assert_eq!(agreed["status"], "AGREED");
        assert_eq!(agreed["agreed_price"], 100.0);
        assert_eq!(agreed["agreed_sla"], "standard");
        assert_eq!(agreed["rounds_taken"], 1);

        let rejected = serde_json::to_value(NegotiationResult::rejected(5)).unwrap();
        assert_eq!(rejected["status"], "REJECTED");
        assert!(rejected["agreed_price"].is_null());
        assert!(rejected["agreed_sla"].is_null());
    }

    #[test]
    fn test_settlement_request_defaults() {
        let request: SettlementRequest = serde_json::from_str(
            r#"{"agreed_price": 50.0, "buyer_id": "A", "seller_id": "B"}"#,
        )
        .unwrap();
        assert_eq!(request.sla_tier, "standard");
        assert_eq!(request.asset, "USDC");
        assert_eq!(request.network, "base");
    }

    #[test]
    fn test_trust_level_buckets() {
        assert_eq!(TrustLevel::from(0.0), TrustLevel::Untrusted);
        assert_eq!(TrustLevel::from(0.5), TrustLevel::Neutral);
        assert_eq!(TrustLevel::from(0.85), TrustLevel::Trusted);
        assert_eq!(TrustLevel::from(1.0), TrustLevel::HighlyTrusted);
    }

    #[test]
    fn test_fresh_reputation() {
        let rep = AgentReputation::new("agent-1");
        assert_eq!(rep.score, 0.5);
        assert_eq!(rep.success_rate(), None);
        assert_eq!(rep.trust_level(), TrustLevel::Neutral);
    }
}
