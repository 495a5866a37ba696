//! Strategy Registry
//!
//! Runtime projection of the strategies currently scheduled for live
//! evaluation. Persisted status lives in the store; this map only answers
//! "what is running right now and when does it run next".

use crate::brokers::BrokerAdapter;
use crate::types::{OrderSpec, Strategy, TradeContext};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Registry-level outcomes callers reconcile into success.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("strategy {0} is already active")]
    AlreadyActive(String),
    #[error("strategy {0} is not active")]
    NotActive(String),
}

/// An order sent on entry, kept so square-off can reverse it.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub spec: OrderSpec,
    pub context: TradeContext,
}

/// Scheduling state of one running strategy.
#[derive(Debug, Clone, Default)]
pub struct ScheduleState {
    /// Next evaluation time (ms)
    pub next_run: i64,
    pub last_run: Option<i64>,
    /// Exchange-local day entries were last sent
    pub entered_on: Option<NaiveDate>,
    /// Exchange-local day the last square-off was sent
    pub squared_off_on: Option<NaiveDate>,
    pub open_orders: Vec<OpenOrder>,
    pub paused: bool,
}

impl ScheduleState {
    pub fn new(next_run: i64) -> Self {
        Self {
            next_run,
            ..Default::default()
        }
    }

    /// Entered today and not yet squared off.
    pub fn holds_position(&self, today: NaiveDate) -> bool {
        self.entered_on == Some(today) && self.squared_off_on != Some(today)
    }
}

/// A registered strategy with its broker binding.
#[derive(Clone)]
pub struct RunningStrategy {
    pub strategy: Strategy,
    pub adapter: Arc<dyn BrokerAdapter>,
    pub state: ScheduleState,
}

/// Summary row for `active_strategies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStrategyInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,
    pub next_run: i64,
    pub is_active: bool,
}

/// Concurrent map of running strategies keyed by strategy id.
#[derive(Default)]
pub struct StrategyRegistry {
    entries: DashMap<String, RunningStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy; at most one entry exists per id.
    pub fn add(
        &self,
        strategy: Strategy,
        adapter: Arc<dyn BrokerAdapter>,
        next_run: i64,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(strategy.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyActive(strategy.id)),
            Entry::Vacant(slot) => {
                slot.insert(RunningStrategy {
                    strategy,
                    adapter,
                    state: ScheduleState::new(next_run),
                });
                Ok(())
            }
        }
    }

    pub fn remove(&self, strategy_id: &str) -> Result<RunningStrategy, RegistryError> {
        self.entries
            .remove(strategy_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| RegistryError::NotActive(strategy_id.to_string()))
    }

    pub fn contains(&self, strategy_id: &str) -> bool {
        self.entries.contains_key(strategy_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_paused(&self, strategy_id: &str, paused: bool) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(strategy_id)
            .ok_or_else(|| RegistryError::NotActive(strategy_id.to_string()))?;
        entry.state.paused = paused;
        Ok(())
    }

    /// Ids of unpaused strategies with `next_run <= now_ms`.
    pub fn due(&self, now_ms: i64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.state.paused && e.state.next_run <= now_ms)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Clone out an entry so no map guard is held during evaluation.
    pub fn snapshot(&self, strategy_id: &str) -> Option<RunningStrategy> {
        self.entries.get(strategy_id).map(|e| e.clone())
    }

    /// Replace an entry's schedule state if it is still registered.
    pub fn update_state(&self, strategy_id: &str, state: ScheduleState) -> bool {
        match self.entries.get_mut(strategy_id) {
            Some(mut entry) => {
                // Pause may have been toggled while evaluating
                let paused = entry.state.paused;
                entry.state = ScheduleState { paused, ..state };
                true
            }
            None => false,
        }
    }

    pub fn for_owner(&self, owner_id: &str) -> Vec<ActiveStrategyInfo> {
        let mut rows: Vec<ActiveStrategyInfo> = self
            .entries
            .iter()
            .filter(|e| e.strategy.owner_id == owner_id)
            .map(|e| ActiveStrategyInfo {
                id: e.strategy.id.clone(),
                name: e.strategy.name.clone(),
                last_run: e.state.last_run,
                next_run: e.state.next_run,
                is_active: !e.state.paused,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Distinct owners with at least one registered strategy.
    pub fn owners(&self) -> HashSet<String> {
        self.entries
            .iter()
            .map(|e| e.strategy.owner_id.clone())
            .collect()
    }
}
