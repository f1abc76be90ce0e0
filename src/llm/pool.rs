//! Credential/model rotation pool.
//!
//! A priority-ordered list of models, each with its own credentials. When the
//! backend reports a rate limit the active credential is marked and the pool
//! rotates: first to another credential of the same model, then to the next
//! unblocked model. A model whose credentials are all rate limited is blocked
//! for `block_duration` and becomes eligible again on `refresh()`.
//!
//! Pure state machine, no I/O. One instance is shared by every thread of a
//! gateway, so all mutation happens under a single mutex.

use crate::error::LlmError;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// How long a model stays blocked once all of its credentials are rate limited.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// An API credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// One model in the fallback chain with the credentials allowed to call it.
#[derive(Debug, Clone)]
pub struct ModelSlot {
    pub name: String,
    pub credentials: Vec<Credential>,
}

impl ModelSlot {
    pub fn new(name: impl Into<String>, credentials: Vec<Credential>) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }
}

/// The (credential, model) pair a generation attempt should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub model: String,
    pub model_index: usize,
    pub credential: Credential,
    pub credential_index: usize,
}

/// Loggable view of the pool state. Contains indices only, never secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub active_model: Option<String>,
    pub model_index: usize,
    pub credential_index: usize,
    pub rate_limited: Vec<usize>,
    pub blocked_models: Vec<String>,
    pub exhausted: bool,
}

#[derive(Debug)]
struct PoolState {
    model_index: usize,
    credential_index: usize,
    rate_limited: BTreeSet<usize>,
    blocked_until: HashMap<usize, Instant>,
    exhausted: bool,
}

impl PoolState {
    fn switch_model(&mut self, model_index: usize) {
        self.model_index = model_index;
        self.credential_index = 0;
        self.rate_limited.clear();
        self.exhausted = false;
    }
}

/// Shared rotation pool. Pass it around as `Arc<RotationPool>`.
#[derive(Debug)]
pub struct RotationPool {
    models: Vec<ModelSlot>,
    block_duration: Duration,
    state: Mutex<PoolState>,
}

impl RotationPool {
    pub fn new(models: Vec<ModelSlot>, block_duration: Duration) -> Result<Self, LlmError> {
        if models.is_empty() {
            return Err(LlmError::EmptyPool);
        }
        if let Some(model) = models.iter().find(|model| model.credentials.is_empty()) {
            return Err(LlmError::NoCredentials(model.name.clone()));
        }

        Ok(Self {
            models,
            block_duration,
            state: Mutex::new(PoolState {
                model_index: 0,
                credential_index: 0,
                rate_limited: BTreeSet::new(),
                blocked_until: HashMap::new(),
                exhausted: false,
            }),
        })
    }

    pub fn models(&self) -> &[ModelSlot] {
        &self.models
    }

    /// The active pair, or `PoolExhausted` when nothing is eligible.
    pub fn current(&self) -> Result<PoolEntry, LlmError> {
        let state = self.state.lock();
        if state.exhausted {
            return Err(LlmError::PoolExhausted);
        }
        let model = &self.models[state.model_index];
        Ok(PoolEntry {
            model: model.name.clone(),
            model_index: state.model_index,
            credential: model.credentials[state.credential_index].clone(),
            credential_index: state.credential_index,
        })
    }

    /// Mark `entry`'s credential rate limited and rotate if it was active.
    ///
    /// Concurrent attempts may report the same pair. Only the first report
    /// moves the pool; a report for a pair the pool already left answers
    /// `true` without rotating again.
    /// Returns `false` when no eligible pair remains; the pool then stays
    /// exhausted until `refresh()` finds an expired block.
    pub fn report_rate_limited(&self, entry: &PoolEntry) -> bool {
        let mut state = self.state.lock();
        if state.exhausted {
            return false;
        }

        let model_index = state.model_index;
        if entry.model_index != model_index {
            tracing::debug!(
                reported_model = %entry.model,
                active_model = %self.models[model_index].name,
                "stale rate limit report, pool already rotated"
            );
            return true;
        }

        state.rate_limited.insert(entry.credential_index);
        if !state.rate_limited.contains(&state.credential_index) {
            tracing::debug!(
                model = %entry.model,
                reported_credential = entry.credential_index,
                active_credential = state.credential_index,
                "stale rate limit report, pool already rotated"
            );
            return true;
        }

        let limited = state.credential_index;
        let credential_count = self.models[model_index].credentials.len();
        let next_credential = (1..credential_count)
            .map(|offset| (limited + offset) % credential_count)
            .find(|candidate| !state.rate_limited.contains(candidate));

        if let Some(credential_index) = next_credential {
            state.credential_index = credential_index;
            tracing::info!(
                model = %self.models[model_index].name,
                from_credential = limited,
                to_credential = credential_index,
                "credential rate limited, rotated to next credential"
            );
            return true;
        }

        let blocked_until = Instant::now() + self.block_duration;
        state.blocked_until.insert(model_index, blocked_until);
        tracing::warn!(
            model = %self.models[model_index].name,
            block_secs = self.block_duration.as_secs(),
            "all credentials rate limited, blocking model"
        );

        match self.first_unblocked(&state) {
            Some(next_model) => {
                state.switch_model(next_model);
                tracing::info!(
                    from_model = %self.models[model_index].name,
                    to_model = %self.models[next_model].name,
                    "rotated to fallback model"
                );
                true
            }
            None => {
                state.exhausted = true;
                tracing::error!("rotation pool exhausted, every model is blocked");
                false
            }
        }
    }

    /// Lift blocks whose window elapsed and move to the best eligible model.
    ///
    /// Returns whether the pool currently has an eligible pair.
    pub fn refresh(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();

        let before = state.blocked_until.len();
        state.blocked_until.retain(|_, until| *until > now);
        if state.blocked_until.len() != before {
            tracing::info!(
                unblocked = before - state.blocked_until.len(),
                "model block windows elapsed"
            );
        }

        if let Some(best) = self.first_unblocked(&state)
            && (state.exhausted || best < state.model_index)
        {
            state.switch_model(best);
            tracing::info!(
                model = %self.models[best].name,
                "switched to higher-priority model"
            );
        }

        !state.exhausted
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        let mut blocked: Vec<usize> = state.blocked_until.keys().copied().collect();
        blocked.sort_unstable();
        PoolSnapshot {
            active_model: (!state.exhausted)
                .then(|| self.models[state.model_index].name.clone()),
            model_index: state.model_index,
            credential_index: state.credential_index,
            rate_limited: state.rate_limited.iter().copied().collect(),
            blocked_models: blocked
                .into_iter()
                .map(|index| self.models[index].name.clone())
                .collect(),
            exhausted: state.exhausted,
        }
    }

    fn first_unblocked(&self, state: &PoolState) -> Option<usize> {
        (0..self.models.len()).find(|index| !state.blocked_until.contains_key(index))
    }
}
