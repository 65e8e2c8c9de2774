//! Bounded linear-concession negotiation between one buyer and one seller.
//!
//! In round `n` (1-indexed) the buyer will pay up to
//! `budget * (1 + buyer_rate * (n - 1))` and the seller will accept down to
//! `base_price * (1 - seller_rate * (n - 1))`. The first round where the
//! ceiling reaches the floor closes the deal; running out of rounds is a
//! normal `REJECTED` outcome.

use crate::{
    error::{NegotiationError, Result},
    model::{NegotiationResult, NegotiationRound, NegotiationTranscript, DEFAULT_SLA_TIER},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Absolute slack on the crossing test so prices equal in exact arithmetic
/// still cross after binary rounding.
pub const PRICE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PricingRule {
    /// Halfway between the seller floor and the buyer ceiling.
    #[default]
    Midpoint,
    /// `floor + seller_share * (ceiling - floor)`; 0.0 favors the buyer, 1.0 the seller.
    Weighted { seller_share: f64 },
}

impl PricingRule {
    pub fn price(&self, seller_floor: f64, buyer_ceiling: f64) -> f64 {
        match self {
            PricingRule::Midpoint => (seller_floor + buyer_ceiling) / 2.0,
            PricingRule::Weighted { seller_share } => {
                seller_floor + seller_share * (buyer_ceiling - seller_floor)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    pub max_rounds: u32,
    pub buyer_concession_rate: f64,
    pub seller_concession_rate: f64,
    pub pricing_rule: PricingRule,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            buyer_concession_rate: 0.1,
            seller_concession_rate: 0.1,
            pricing_rule: PricingRule::Midpoint,
        }
    }
}

impl NegotiationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(NegotiationError::Config("max_rounds must be at least 1".to_string()));
        }
        validate_rate("buyer_concession_rate", self.buyer_concession_rate)?;
        validate_rate("seller_concession_rate", self.seller_concession_rate)?;

        if let PricingRule::Weighted { seller_share } = self.pricing_rule {
            if !(0.0..=1.0).contains(&seller_share) {
                return Err(NegotiationError::Config(format!(
                    "seller_share must be within [0, 1], got {}",
                    seller_share
                )));
            }
        }

        Ok(())
    }
}

fn validate_rate(name: &str, rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 || rate >= 1.0 {
        return Err(NegotiationError::Config(format!(
            "{} must be within (0, 1), got {}",
            name, rate
        )));
    }
    Ok(())
}

fn validate_price(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(NegotiationError::Config(format!(
            "{} must be a positive amount, got {}",
            name, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRequest {
    #[serde(default)]
    pub buyer_intent: String,
    #[serde(default)]
    pub seller_capability: String,
    pub buyer_budget: f64,
    pub seller_base_price: f64,
    #[serde(default = "default_sla_tier")]
    pub sla_tier: String,
}

impl NegotiationRequest {
    pub fn new(buyer_budget: f64, seller_base_price: f64) -> Self {
        Self {
            buyer_intent: String::new(),
            seller_capability: String::new(),
            buyer_budget,
            seller_base_price,
            sla_tier: default_sla_tier(),
        }
    }

    pub fn with_labels(mut self, buyer_intent: impl Into<String>, seller_capability: impl Into<String>) -> Self {
        self.buyer_intent = buyer_intent.into();
        self.seller_capability = seller_capability.into();
        self
    }

    pub fn with_sla_tier(mut self, sla_tier: impl Into<String>) -> Self {
        self.sla_tier = sla_tier.into();
        self
    }
}

fn default_sla_tier() -> String {
    DEFAULT_SLA_TIER.to_string()
}

pub fn buyer_ceiling(buyer_budget: f64, buyer_rate: f64, round: u32) -> f64 {
    buyer_budget * (1.0 + buyer_rate * f64::from(round.saturating_sub(1)))
}

pub fn seller_floor(seller_base_price: f64, seller_rate: f64, round: u32) -> f64 {
    seller_base_price * (1.0 - seller_rate * f64::from(round.saturating_sub(1)))
}

fn crossed(ceiling: f64, floor: f64) -> bool {
    ceiling >= floor - PRICE_EPSILON
}

/// First round at which the curves cross, if any within `config.max_rounds`.
fn crossing_round(config: &NegotiationConfig, buyer_budget: f64, seller_base_price: f64) -> Option<u32> {
    (1..=config.max_rounds).find(|&round| {
        crossed(
            buyer_ceiling(buyer_budget, config.buyer_concession_rate, round),
            seller_floor(seller_base_price, config.seller_concession_rate, round),
        )
    })
}

/// Whether a negotiation with these parameters can ever reach agreement.
/// Shares the round arithmetic with `NegotiationEngine`, so it answers
/// exactly what `run_negotiation` would.
pub fn check_zopa_feasibility(
    config: &NegotiationConfig,
    buyer_budget: f64,
    seller_base_price: f64,
) -> Result<bool> {
    config.validate()?;
    validate_price("buyer_budget", buyer_budget)?;
    validate_price("seller_base_price", seller_base_price)?;
    Ok(crossing_round(config, buyer_budget, seller_base_price).is_some())
}

#[derive(Debug, Clone)]
pub struct NegotiationEngine {
    config: NegotiationConfig,
}

impl NegotiationEngine {
    pub fn new(config: NegotiationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn check_zopa_feasibility(&self, buyer_budget: f64, seller_base_price: f64) -> Result<bool> {
        check_zopa_feasibility(&self.config, buyer_budget, seller_base_price)
    }

    pub fn run_negotiation(&self, request: &NegotiationRequest) -> Result<NegotiationResult> {
        self.run_with_transcript(request).map(|transcript| transcript.result)
    }

    pub fn run_with_transcript(&self, request: &NegotiationRequest) -> Result<NegotiationTranscript> {
        validate_price("buyer_budget", request.buyer_budget)?;
        validate_price("seller_base_price", request.seller_base_price)?;

        let negotiation_id = Uuid::new_v4();
        tracing::debug!(
            %negotiation_id,
            buyer_intent = %request.buyer_intent,
            seller_capability = %request.seller_capability,
            "Starting negotiation"
        );

        let mut rounds = Vec::new();
        let mut result = NegotiationResult::rejected(self.config.max_rounds);

        for round in 1..=self.config.max_rounds {
            let ceiling = buyer_ceiling(request.buyer_budget, self.config.buyer_concession_rate, round);
            let floor = seller_floor(request.seller_base_price, self.config.seller_concession_rate, round);
            let is_crossed = crossed(ceiling, floor);

            tracing::debug!(%negotiation_id, round, ceiling, floor, crossed = is_crossed, "Negotiation round");
            rounds.push(NegotiationRound {
                round,
                buyer_ceiling: ceiling,
                seller_floor: floor,
                crossed: is_crossed,
            });

            if is_crossed {
                // Inside the epsilon band the floor may sit a hair above the ceiling,
                // and a long run can push it to zero or below.
                let low = floor.min(ceiling).max(f64::MIN_POSITIVE);
                let price = self.config.pricing_rule.price(low, ceiling);
                result = NegotiationResult::agreed(price, request.sla_tier.clone(), round);
                break;
            }
        }

        match result.agreed_price() {
            Some(price) => tracing::info!(
                %negotiation_id,
                price,
                rounds = result.rounds_taken(),
                "Negotiation agreed"
            ),
            None => tracing::info!(
                %negotiation_id,
                rounds = result.rounds_taken(),
                "Negotiation rejected: no zone of possible agreement"
            ),
        }

        Ok(NegotiationTranscript {
            negotiation_id,
            buyer_intent: request.buyer_intent.clone(),
            seller_capability: request.seller_capability.clone(),
            rounds,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NegotiationStatus;

    fn engine(max_rounds: u32, buyer_rate: f64, seller_rate: f64) -> NegotiationEngine {
        NegotiationEngine::new(NegotiationConfig {
            max_rounds,
            buyer_concession_rate: buyer_rate,
            seller_concession_rate: seller_rate,
            pricing_rule: PricingRule::Midpoint,
        })
        .unwrap()
    }

    #[test]
    fn test_equal_prices_agree_in_first_round() {
        let result = engine(5, 0.1, 0.1)
            .run_negotiation(&NegotiationRequest::new(100.0, 100.0))
            .unwrap();
        assert_eq!(result.status(), NegotiationStatus::Agreed);
        assert_eq!(result.agreed_price(), Some(100.0));
        assert_eq!(result.agreed_sla(), Some("standard"));
        assert_eq!(result.rounds_taken(), 1);
    }

    #[test]
    fn test_budget_sixty_against_ninety_meets_at_round_three() {
        let transcript = engine(5, 0.1, 0.1)
            .run_with_transcript(&NegotiationRequest::new(60.0, 90.0))
            .unwrap();

        assert_eq!(transcript.rounds.len(), 3);
        assert!((transcript.rounds[0].buyer_ceiling - 60.0).abs() < 1e-9);
        assert!((transcript.rounds[0].seller_floor - 90.0).abs() < 1e-9);
        assert!(!transcript.rounds[0].crossed);
        assert!((transcript.rounds[1].buyer_ceiling - 66.0).abs() < 1e-9);
        assert!((transcript.rounds[1].seller_floor - 81.0).abs() < 1e-9);
        assert!(!transcript.rounds[1].crossed);
        assert!(transcript.rounds[2].crossed);

        let result = transcript.result;
        assert_eq!(result.status(), NegotiationStatus::Agreed);
        assert_eq!(result.rounds_taken(), 3);
        assert!((result.agreed_price().unwrap() - 72.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_too_wide_is_rejected() {
        let result = engine(5, 0.05, 0.05)
            .run_negotiation(&NegotiationRequest::new(10.0, 100.0))
            .unwrap();
        assert_eq!(result.status(), NegotiationStatus::Rejected);
        assert_eq!(result.agreed_price(), None);
        assert_eq!(result.agreed_sla(), None);
        assert_eq!(result.rounds_taken(), 5);
    }

    #[test]
    fn test_weighted_rule_prices_within_band() {
        let engine = NegotiationEngine::new(NegotiationConfig {
            pricing_rule: PricingRule::Weighted { seller_share: 1.0 },
            ..NegotiationConfig::default()
        })
        .unwrap();
        let result = engine.run_negotiation(&NegotiationRequest::new(120.0, 100.0)).unwrap();
        assert_eq!(result.agreed_price(), Some(120.0));

        assert_eq!(PricingRule::Weighted { seller_share: 0.0 }.price(90.0, 110.0), 90.0);
        assert_eq!(PricingRule::Midpoint.price(90.0, 110.0), 100.0);
        assert_eq!(PricingRule::default(), PricingRule::Midpoint);
    }

    #[test]
    fn test_sla_tier_carried_through() {
        let result = engine(5, 0.1, 0.1)
            .run_negotiation(&NegotiationRequest::new(100.0, 90.0).with_sla_tier("premium"))
            .unwrap();
        assert_eq!(result.agreed_sla(), Some("premium"));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let bad = [
            NegotiationConfig { max_rounds: 0, ..NegotiationConfig::default() },
            NegotiationConfig { buyer_concession_rate: 0.0, ..NegotiationConfig::default() },
            NegotiationConfig { seller_concession_rate: -0.1, ..NegotiationConfig::default() },
            NegotiationConfig { buyer_concession_rate: f64::NAN, ..NegotiationConfig::default() },
            NegotiationConfig {
                pricing_rule: PricingRule::Weighted { seller_share: 1.5 },
                ..NegotiationConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(NegotiationEngine::new(config), Err(NegotiationError::Config(_))));
        }
    }

    #[test]
    fn test_non_positive_prices_are_config_errors() {
        let engine = engine(5, 0.1, 0.1);
        assert!(matches!(
            engine.run_negotiation(&NegotiationRequest::new(0.0, 100.0)),
            Err(NegotiationError::Config(_))
        ));
        assert!(matches!(
            engine.run_negotiation(&NegotiationRequest::new(100.0, -1.0)),
            Err(NegotiationError::Config(_))
        ));
        assert!(engine.check_zopa_feasibility(100.0, 0.0).is_err());
    }

    #[test]
    fn test_long_runs_with_steep_seller_cuts_are_allowed() {
        // The seller floor would reach zero at round 11.
        let engine = engine(11, 0.1, 0.1);
        assert!(engine.check_zopa_feasibility(60.0, 90.0).unwrap());

        // Floor goes negative at round 3, the price stays positive.
        let steep = NegotiationEngine::new(NegotiationConfig {
            max_rounds: 3,
            buyer_concession_rate: 0.1,
            seller_concession_rate: 0.6,
            pricing_rule: PricingRule::Weighted { seller_share: 0.0 },
        })
        .unwrap();
        let transcript = steep
            .run_with_transcript(&NegotiationRequest::new(0.001, 100.0))
            .unwrap();
        assert!(transcript.rounds[2].seller_floor < 0.0);
        let price = transcript.result.agreed_price().unwrap();
        assert!(price > 0.0);
        assert!(price <= transcript.rounds[2].buyer_ceiling);
    }

    #[test]
    fn test_feasibility_matches_engine_on_boundary() {
        let engine = engine(3, 0.1, 0.1);
        // round 3: ceiling = 1.2 * budget, floor = 0.8 * 90 = 72
        assert!(engine.check_zopa_feasibility(60.0, 90.0).unwrap());
        assert!(!engine.check_zopa_feasibility(59.9, 90.0).unwrap());
        assert!(!engine.run_negotiation(&NegotiationRequest::new(59.9, 90.0)).unwrap().is_agreed());
    }
}
