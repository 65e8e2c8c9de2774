//! Agent reputation ledger.
//!
//! Records are immutable `AgentReputation` snapshots held behind `Arc`. The
//! only mutation is `update_after_deal`, which computes a new record from the
//! current one and installs it with `compare_and_swap`; a lost race re-reads
//! and recomputes, so concurrent updates to one agent never drop a deal.

use crate::{
    error::{NegotiationError, Result},
    model::{AgentReputation, NEUTRAL_SCORE},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Key-value backing for the ledger.
pub trait ReputationStore: Send + Sync {
    fn get(&self, agent_id: &str) -> Option<Arc<AgentReputation>>;

    /// Install `new` if the current record equals `expected` (`None` meaning
    /// absent). Returns `false` and leaves the store untouched otherwise.
    fn compare_and_swap(
        &self,
        agent_id: &str,
        expected: Option<&AgentReputation>,
        new: Arc<AgentReputation>,
    ) -> bool;

    fn all(&self) -> Vec<Arc<AgentReputation>>;
}

#[derive(Default)]
pub struct InMemoryReputationStore {
    records: RwLock<HashMap<String, Arc<AgentReputation>>>,
}

impl InMemoryReputationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReputationStore for InMemoryReputationStore {
    fn get(&self, agent_id: &str) -> Option<Arc<AgentReputation>> {
        self.records.read().get(agent_id).cloned()
    }

    fn compare_and_swap(
        &self,
        agent_id: &str,
        expected: Option<&AgentReputation>,
        new: Arc<AgentReputation>,
    ) -> bool {
        let mut records = self.records.write();
        let matches = match (records.get(agent_id), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.as_ref() == expected,
            _ => false,
        };
        if matches {
            records.insert(agent_id.to_string(), new);
        }
        matches
    }

    fn all(&self) -> Vec<Arc<AgentReputation>> {
        self.records.read().values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReputationSettings {
    pub initial_score: f64,
    /// Weight of the lifetime success rate; the prior score gets the rest.
    pub success_weight: f64,
    pub max_cas_retries: u32,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            initial_score: NEUTRAL_SCORE,
            success_weight: 0.7,
            max_cas_retries: 64,
        }
    }
}

impl ReputationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.initial_score) {
            return Err(NegotiationError::Config(format!(
                "initial_score must be within [0, 1], got {}",
                self.initial_score
            )));
        }
        if !(0.0..=1.0).contains(&self.success_weight) {
            return Err(NegotiationError::Config(format!(
                "success_weight must be within [0, 1], got {}",
                self.success_weight
            )));
        }
        if self.max_cas_retries == 0 {
            return Err(NegotiationError::Config("max_cas_retries must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// The record that replaces `old` after one more deal.
pub fn next_reputation(
    old: &AgentReputation,
    success: bool,
    deal_volume: f64,
    settlement_time: f64,
    success_weight: f64,
) -> AgentReputation {
    let total_deals = old.total_deals + 1;
    let successful_deals = old.successful_deals + u64::from(success);
    let success_rate = successful_deals as f64 / total_deals as f64;
    let score = (success_weight * success_rate + (1.0 - success_weight) * old.score).clamp(0.0, 1.0);
    let avg_settlement_time =
        (old.avg_settlement_time * (total_deals - 1) as f64 + settlement_time) / total_deals as f64;

    AgentReputation {
        agent_id: old.agent_id.clone(),
        score,
        total_deals,
        successful_deals,
        total_volume: old.total_volume + deal_volume,
        avg_settlement_time,
    }
}

fn validate_deal_inputs(deal_volume: f64, settlement_time: f64) -> Result<()> {
    if !deal_volume.is_finite() || deal_volume < 0.0 {
        return Err(NegotiationError::Validation(format!(
            "deal_volume must be non-negative, got {}",
            deal_volume
        )));
    }
    if !settlement_time.is_finite() || settlement_time < 0.0 {
        return Err(NegotiationError::Validation(format!(
            "settlement_time must be non-negative, got {}",
            settlement_time
        )));
    }
    Ok(())
}

/// `current` with one deal's counters, volume and time removed. The score
/// is a blend over history and is left as it is.
fn without_deal(current: &AgentReputation, success: bool, deal_volume: f64, settlement_time: f64) -> AgentReputation {
    let total_deals = current.total_deals.saturating_sub(1);
    let avg_settlement_time = if total_deals == 0 {
        0.0
    } else {
        ((current.avg_settlement_time * current.total_deals as f64 - settlement_time) / total_deals as f64).max(0.0)
    };

    AgentReputation {
        agent_id: current.agent_id.clone(),
        score: current.score,
        total_deals,
        successful_deals: current.successful_deals.saturating_sub(u64::from(success)).min(total_deals),
        total_volume: (current.total_volume - deal_volume).max(0.0),
        avg_settlement_time,
    }
}

pub struct ReputationLedger {
    store: Arc<dyn ReputationStore>,
    settings: ReputationSettings,
}

impl Default for ReputationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationLedger {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryReputationStore::new()),
            settings: ReputationSettings::default(),
        }
    }

    pub fn with_store(store: Arc<dyn ReputationStore>, settings: ReputationSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { store, settings })
    }

    pub fn settings(&self) -> &ReputationSettings {
        &self.settings
    }

    fn fresh(&self, agent_id: &str) -> AgentReputation {
        AgentReputation::with_score(agent_id, self.settings.initial_score)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentReputation> {
        self.store.get(agent_id).map(|record| record.as_ref().clone())
    }

    /// Current score without creating a record for unknown agents.
    pub fn score_of(&self, agent_id: &str) -> f64 {
        self.store
            .get(agent_id)
            .map(|record| record.score)
            .unwrap_or(self.settings.initial_score)
    }

    pub fn get_or_create(&self, agent_id: &str) -> Result<AgentReputation> {
        for _ in 0..self.settings.max_cas_retries {
            if let Some(existing) = self.store.get(agent_id) {
                return Ok(existing.as_ref().clone());
            }
            let fresh = self.fresh(agent_id);
            if self.store.compare_and_swap(agent_id, None, Arc::new(fresh.clone())) {
                tracing::debug!(agent_id, score = fresh.score, "Created reputation record");
                return Ok(fresh);
            }
        }
        Err(NegotiationError::StoreConflict(format!(
            "could not create reputation record for {}",
            agent_id
        )))
    }

    pub fn update_after_deal(
        &self,
        agent_id: &str,
        success: bool,
        deal_volume: f64,
        settlement_time: f64,
    ) -> Result<AgentReputation> {
        validate_deal_inputs(deal_volume, settlement_time)?;
        self.apply_deal(agent_id, success, deal_volume, settlement_time)
            .map(|(_, next)| next)
    }

    /// Records one deal for both parties. Either both records move or
    /// neither does: if the seller update cannot be installed, the buyer's
    /// new record is withdrawn before the error is returned.
    pub fn update_pair_after_deal(
        &self,
        buyer_id: &str,
        seller_id: &str,
        success: bool,
        deal_volume: f64,
        settlement_time: f64,
    ) -> Result<(AgentReputation, AgentReputation)> {
        validate_deal_inputs(deal_volume, settlement_time)?;

        let (buyer_before, buyer) = self.apply_deal(buyer_id, success, deal_volume, settlement_time)?;
        match self.apply_deal(seller_id, success, deal_volume, settlement_time) {
            Ok((_, seller)) => Ok((buyer, seller)),
            Err(err) => {
                self.withdraw_deal(&buyer_before, &buyer, success, deal_volume, settlement_time);
                Err(err)
            }
        }
    }

    /// Returns the record the update was computed from together with the
    /// installed one.
    fn apply_deal(
        &self,
        agent_id: &str,
        success: bool,
        deal_volume: f64,
        settlement_time: f64,
    ) -> Result<(AgentReputation, AgentReputation)> {
        for attempt in 1..=self.settings.max_cas_retries {
            let current = self.store.get(agent_id);
            let base = match &current {
                Some(record) => record.as_ref().clone(),
                None => self.fresh(agent_id),
            };

            let next = next_reputation(&base, success, deal_volume, settlement_time, self.settings.success_weight);
            let expected = current.as_deref();
            if self.store.compare_and_swap(agent_id, expected, Arc::new(next.clone())) {
                tracing::debug!(
                    agent_id,
                    success,
                    score = next.score,
                    total_deals = next.total_deals,
                    "Reputation updated"
                );
                return Ok((base, next));
            }

            tracing::warn!(agent_id, attempt, "Reputation update raced, retrying");
            std::thread::yield_now();
        }

        Err(NegotiationError::StoreConflict(format!(
            "reputation update for {} lost {} races",
            agent_id, self.settings.max_cas_retries
        )))
    }

    /// Undo a deal installed by `apply_deal`. While the record is still the
    /// one we installed, the exact prior snapshot goes back. If another deal
    /// landed on top, only that deal's counters, volume and time are taken out.
    fn withdraw_deal(
        &self,
        before: &AgentReputation,
        installed: &AgentReputation,
        success: bool,
        deal_volume: f64,
        settlement_time: f64,
    ) {
        let agent_id = installed.agent_id.as_str();
        for _ in 0..self.settings.max_cas_retries {
            let Some(current) = self.store.get(agent_id) else {
                return;
            };
            let restored = if current.as_ref() == installed {
                before.clone()
            } else {
                without_deal(&current, success, deal_volume, settlement_time)
            };
            if self.store.compare_and_swap(agent_id, Some(current.as_ref()), Arc::new(restored)) {
                tracing::warn!(agent_id, "Withdrew reputation update for incomplete deal");
                return;
            }
            std::thread::yield_now();
        }
        tracing::error!(agent_id, "Could not withdraw reputation update for incomplete deal");
    }

    /// Like `get`, but unknown agents are an error.
    pub fn require(&self, agent_id: &str) -> Result<AgentReputation> {
        self.get(agent_id)
            .ok_or_else(|| NegotiationError::AgentNotFound(agent_id.to_string()))
    }

    pub fn check_min_reputation(&self, agent_id: &str, min_score: f64) -> bool {
        self.score_of(agent_id) >= min_score
    }

    pub fn all(&self) -> Vec<AgentReputation> {
        let mut records: Vec<AgentReputation> =
            self.store.all().iter().map(|record| record.as_ref().clone()).collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }
}
