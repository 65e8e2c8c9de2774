//! # agent-deal - negotiation, settlement and reputation for autonomous agents
//!
//! The deal core for two-party agent commerce.
//!
//! ## Architecture
//!
//! - **Negotiation**: bounded linear-concession rounds between a buyer ceiling and a seller floor
//! - **Settlement**: x402-style challenge / sign / verify / confirm handshake for the agreed price
//! - **Reputation**: in-memory ledger of immutable per-agent records, swapped by compare-and-swap
//! - **Service**: Axum router exposing the above over JSON
//!
//! Data flows one way: negotiation -> settlement -> reputation.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod negotiation;
pub mod reputation;
pub mod service;
pub mod settlement;
pub mod signing;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;
pub use error::{NegotiationError, Result, VerificationFailure};
pub use model::{
    AgentReputation, NegotiationResult, NegotiationStatus, PaymentChallenge, SettlementRequest,
    SettlementResult, SettlementStatus, SignedPayment, TrustLevel,
};
pub use negotiation::{check_zopa_feasibility, NegotiationConfig, NegotiationEngine, NegotiationRequest, PricingRule};
pub use reputation::{InMemoryReputationStore, ReputationLedger, ReputationStore};
pub use settlement::{SettlementEngine, SettlementOptions};
pub use signing::{PaymentSigner, PaymentVerifier};

pub type AgentId = String;
