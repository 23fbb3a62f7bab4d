//! Escrow Ledger Port
//!
//! Capability contract for the custodial backend that actually holds and
//! moves staked value. The core depends on this trait and never on a
//! concrete chain client; `InMemoryLedger` is the reference implementation
//! backing the demo binary and the test suite, and doubles as the
//! conformance model for real backends (per-handle exactly-once terminal
//! outcome, idempotent retries).

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::wager::state::ParticipantId;

/// Opaque reference to one wager's pooled, custodially-held stake.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EscrowHandle(pub String);

impl EscrowHandle {
    /// Wrap a handle string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The underlying handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EscrowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The ledger refused the operation; retrying the same request will
    /// not succeed (insufficient funds, conflicting terminal outcome).
    #[error("ledger rejected operation: {0}")]
    Rejected(String),

    /// Transient backend failure; safe to retry later.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The handle does not reference a known escrow pool.
    #[error("unknown escrow handle")]
    UnknownHandle,
}

impl LedgerError {
    /// Whether a retry of the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// The escrow ledger capability.
///
/// All operations must be safe to retry: the remote call may succeed while
/// the local result reports failure, so a repeated `transfer`/`refund` with
/// the same handle and the same terminal outcome must report success rather
/// than double-move funds.
pub trait EscrowLedger: Send + Sync {
    /// Reserve a participant's stake into a fresh escrow pool.
    fn reserve(
        &self,
        participant: &ParticipantId,
        amount: u64,
    ) -> impl Future<Output = Result<EscrowHandle, LedgerError>> + Send;

    /// Add a joiner's matching stake to an existing pool.
    fn extend(
        &self,
        handle: &EscrowHandle,
        participant: &ParticipantId,
        amount: u64,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Pay the full pool out to the recipient and close the pool.
    fn transfer(
        &self,
        handle: &EscrowHandle,
        recipient: &ParticipantId,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Return each contributor's share and close the pool.
    fn refund(&self, handle: &EscrowHandle) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Current free balance of an account.
    fn balance(
        &self,
        participant: &ParticipantId,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;
}

impl<T: EscrowLedger> EscrowLedger for std::sync::Arc<T> {
    fn reserve(
        &self,
        participant: &ParticipantId,
        amount: u64,
    ) -> impl Future<Output = Result<EscrowHandle, LedgerError>> + Send {
        (**self).reserve(participant, amount)
    }

    fn extend(
        &self,
        handle: &EscrowHandle,
        participant: &ParticipantId,
        amount: u64,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send {
        (**self).extend(handle, participant, amount)
    }

    fn transfer(
        &self,
        handle: &EscrowHandle,
        recipient: &ParticipantId,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send {
        (**self).transfer(handle, recipient)
    }

    fn refund(&self, handle: &EscrowHandle) -> impl Future<Output = Result<(), LedgerError>> + Send {
        (**self).refund(handle)
    }

    fn balance(
        &self,
        participant: &ParticipantId,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send {
        (**self).balance(participant)
    }
}

// =============================================================================
// IN-MEMORY REFERENCE LEDGER
// =============================================================================

/// Terminal outcome of a pool. At most one per handle, ever.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolOutcome {
    Paid(ParticipantId),
    Refunded,
}

#[derive(Debug)]
struct Pool {
    contributions: Vec<(ParticipantId, u64)>,
    outcome: Option<PoolOutcome>,
    /// Times value actually moved out of this pool. 1 at most.
    settlement_actions: u32,
}

impl Pool {
    fn total(&self) -> u64 {
        self.contributions.iter().map(|(_, amount)| amount).sum()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: BTreeMap<ParticipantId, u64>,
    pools: BTreeMap<EscrowHandle, Pool>,
}

/// In-memory escrow ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account (funding for demos and tests).
    pub async fn credit(&self, participant: &ParticipantId, amount: u64) {
        let mut state = self.state.lock().await;
        *state.balances.entry(participant.clone()).or_insert(0) += amount;
    }

    /// Value currently held in a pool (0 once the pool reached a terminal
    /// outcome).
    pub async fn pool_balance(&self, handle: &EscrowHandle) -> u64 {
        let state = self.state.lock().await;
        state
            .pools
            .get(handle)
            .filter(|pool| pool.outcome.is_none())
            .map(|pool| pool.total())
            .unwrap_or(0)
    }

    /// Times value moved out of the pool. Never exceeds 1.
    pub async fn settlement_actions(&self, handle: &EscrowHandle) -> u32 {
        let state = self.state.lock().await;
        state
            .pools
            .get(handle)
            .map(|pool| pool.settlement_actions)
            .unwrap_or(0)
    }
}

impl EscrowLedger for InMemoryLedger {
    async fn reserve(
        &self,
        participant: &ParticipantId,
        amount: u64,
    ) -> Result<EscrowHandle, LedgerError> {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(participant.clone()).or_insert(0);
        if *balance < amount {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds: have {balance}, need {amount}"
            )));
        }
        *balance -= amount;

        let prefix: String = participant.as_str().chars().take(8).collect();
        let handle = EscrowHandle::new(format!(
            "escrow_{prefix}_{amount}_{}",
            uuid::Uuid::new_v4().simple()
        ));
        state.pools.insert(
            handle.clone(),
            Pool {
                contributions: vec![(participant.clone(), amount)],
                outcome: None,
                settlement_actions: 0,
            },
        );
        Ok(handle)
    }

    async fn extend(
        &self,
        handle: &EscrowHandle,
        participant: &ParticipantId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        match state.pools.get(handle) {
            None => return Err(LedgerError::UnknownHandle),
            Some(pool) if pool.outcome.is_some() => {
                return Err(LedgerError::Rejected("pool already closed".into()))
            }
            Some(_) => {}
        }
        let balance = state.balances.entry(participant.clone()).or_insert(0);
        if *balance < amount {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds: have {balance}, need {amount}"
            )));
        }
        *balance -= amount;
        if let Some(pool) = state.pools.get_mut(handle) {
            pool.contributions.push((participant.clone(), amount));
        }
        Ok(())
    }

    async fn transfer(
        &self,
        handle: &EscrowHandle,
        recipient: &ParticipantId,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let pool = state.pools.get_mut(handle).ok_or(LedgerError::UnknownHandle)?;

        match &pool.outcome {
            // Retry of an already-applied transfer: report success, move
            // nothing.
            Some(PoolOutcome::Paid(winner)) if winner == recipient => return Ok(()),
            Some(PoolOutcome::Paid(winner)) => {
                return Err(LedgerError::Rejected(format!(
                    "pool already paid to {winner}"
                )))
            }
            Some(PoolOutcome::Refunded) => {
                return Err(LedgerError::Rejected("pool already refunded".into()))
            }
            None => {}
        }

        let total = pool.total();
        pool.outcome = Some(PoolOutcome::Paid(recipient.clone()));
        pool.settlement_actions += 1;
        *state.balances.entry(recipient.clone()).or_insert(0) += total;
        Ok(())
    }

    async fn refund(&self, handle: &EscrowHandle) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let pool = state.pools.get_mut(handle).ok_or(LedgerError::UnknownHandle)?;

        match &pool.outcome {
            Some(PoolOutcome::Refunded) => return Ok(()),
            Some(PoolOutcome::Paid(winner)) => {
                return Err(LedgerError::Rejected(format!(
                    "pool already paid to {winner}"
                )))
            }
            None => {}
        }

        pool.outcome = Some(PoolOutcome::Refunded);
        pool.settlement_actions += 1;
        let contributions = pool.contributions.clone();
        for (participant, amount) in contributions {
            *state.balances.entry(participant).or_insert(0) += amount;
        }
        Ok(())
    }

    async fn balance(&self, participant: &ParticipantId) -> Result<u64, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.balances.get(participant).copied().unwrap_or(0))
    }
}
