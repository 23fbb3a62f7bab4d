//! Bet Lifecycle Engine
//!
//! Owns the wager state machine and orchestrates the escrow ledger, the
//! stats extractor and the condition evaluator. Every operation holds at
//! most one wager's lock; ledger calls run inside that critical section
//! (a transition is not durable until the ledger agrees) while stats
//! extraction runs with no lock held at all.
//!
//! Settlement is decided exactly once: the decision is recorded on the
//! wager before the ledger call, and a retry after a ledger failure
//! replays the recorded decision instead of re-evaluating evidence.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ports::escrow::{EscrowLedger, LedgerError};
use crate::ports::extractor::{evidence_digest, ExtractError, StatsExtractor};
use crate::wager::condition::{evaluate_all, ConditionVerdict, EvalError};
use crate::wager::registry::{WagerHandle, WagerRegistry};
use crate::wager::state::{
    JoinContext, ParticipantId, SettlementDecision, Wager, WagerError, WagerId, WagerSpec,
    WagerStatus,
};
use crate::wager::stats::MatchStatistics;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on any single escrow ledger call.
    pub ledger_timeout: Duration,
    /// Bound on a stats extraction call.
    pub extract_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_timeout: Duration::from_secs(10),
            extract_timeout: Duration::from_secs(30),
        }
    }
}

/// How a verification request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationVerdict {
    /// Conditions met; pool paid to the winner.
    Settled,
    /// Conditions unmet; all stakes refunded.
    Refunded,
    /// A custom condition is involved; a human must rule.
    AwaitingAdjudication,
}

/// Result of a verification request.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    /// Wager state after the operation.
    pub wager: Wager,
    /// How it resolved.
    pub verdict: VerificationVerdict,
    /// Statistics the decision was based on. Absent when a previously
    /// recorded decision was replayed.
    pub statistics: Option<MatchStatistics>,
    /// SHA-256 of the submitted evidence, for the audit trail.
    pub evidence_digest: String,
}

/// A manual adjudication ruling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ruling {
    /// Pay the pool to this participant.
    Winner(ParticipantId),
    /// Void the wager and refund everyone.
    Void,
}

/// Listing filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WagerFilter {
    /// Only wagers requiring this game mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<String>,
    /// Minimum stake, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stake: Option<u64>,
    /// Maximum stake, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stake: Option<u64>,
}

impl WagerFilter {
    fn matches(&self, wager: &Wager) -> bool {
        if let Some(ref mode) = self.game_mode {
            if wager.eligibility.required_mode.as_deref() != Some(mode.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_stake {
            if wager.stake_amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_stake {
            if wager.stake_amount > max {
                return false;
            }
        }
        true
    }
}

/// The bet lifecycle engine.
///
/// Generic over its two external capabilities so tests can substitute
/// fakes; the registry is owned.
pub struct WagerEngine<L, X> {
    registry: WagerRegistry,
    ledger: L,
    extractor: X,
    config: EngineConfig,
}

impl<L: EscrowLedger, X: StatsExtractor> WagerEngine<L, X> {
    /// Create an engine over the given capabilities.
    pub fn new(ledger: L, extractor: X, config: EngineConfig) -> Self {
        Self {
            registry: WagerRegistry::new(),
            ledger,
            extractor,
            config,
        }
    }

    /// Create a wager: validate, reserve the creator's stake, persist in
    /// `Open`. A failed reservation leaves nothing behind.
    pub async fn create_wager(&self, spec: WagerSpec) -> Result<Wager, WagerError> {
        spec.validate()?;

        let escrow = self
            .bounded(self.ledger.reserve(&spec.creator, spec.stake_amount))
            .await
            .map_err(WagerError::Escrow)?;

        let wager = Wager::new(WagerId::generate(), spec, escrow, Utc::now());
        info!(
            wager = %wager.id.to_uuid_string(),
            creator = %wager.creator,
            stake = wager.stake_amount,
            "wager created"
        );
        let out = wager.clone();
        self.registry.insert(wager).await;
        Ok(out)
    }

    /// Join a wager with a matching stake. Capacity check, stake
    /// reservation and the fill-to-`Locked` transition are atomic under
    /// the wager's lock: two joiners racing for the last slot cannot both
    /// win.
    pub async fn join_wager(
        &self,
        id: WagerId,
        participant: ParticipantId,
        stake: u64,
        ctx: JoinContext,
    ) -> Result<Wager, WagerError> {
        let handle = self.registry.get(&id).await.ok_or(WagerError::NotFound)?;
        let mut wager = handle.write().await;

        match wager.status {
            WagerStatus::Open => {}
            // A filled wager has already locked; a joiner racing for the
            // last slot lost it, which is a capacity failure.
            WagerStatus::Locked if wager.is_full() => return Err(WagerError::Capacity),
            status => return Err(WagerError::Lifecycle { status }),
        }
        if wager.is_expired(Utc::now()) {
            // The sweep has not caught this one yet; expire it in place.
            self.expire(&mut wager).await;
            return Err(WagerError::Timeout);
        }
        if wager.is_full() {
            return Err(WagerError::Capacity);
        }
        if wager.contains(&participant) {
            return Err(WagerError::Validation("already a participant".into()));
        }
        if stake != wager.stake_amount {
            return Err(WagerError::Validation(format!(
                "stake must match the wager amount of {}",
                wager.stake_amount
            )));
        }
        wager.eligibility.check_join(&ctx)?;

        self.bounded(self.ledger.extend(&wager.escrow, &participant, stake))
            .await
            .map_err(WagerError::Escrow)?;

        wager.participants.push(participant.clone());
        debug!(
            wager = %wager.id.to_uuid_string(),
            participant = %participant,
            "participant joined"
        );

        if wager.is_full() {
            wager.advance(WagerStatus::Locked)?;
            info!(
                wager = %wager.id.to_uuid_string(),
                pool = wager.pool_total(),
                "wager filled and locked"
            );
        }
        Ok(wager.clone())
    }

    /// Submit match evidence for a locked wager.
    ///
    /// Claims the verification slot, extracts statistics with no lock
    /// held, then decides and settles under the wager's lock. Unusable
    /// evidence releases the wager back to `Locked`; a ledger failure
    /// after the decision leaves it `Verifying` for an idempotent retry.
    pub async fn submit_verification(
        &self,
        id: WagerId,
        claimant: ParticipantId,
        evidence: &[u8],
    ) -> Result<VerificationOutcome, WagerError> {
        let handle = self.registry.get(&id).await.ok_or(WagerError::NotFound)?;
        let digest = evidence_digest(evidence);

        // Claim the verification slot, or replay a recorded decision.
        {
            let mut wager = handle.write().await;
            match wager.status {
                WagerStatus::Locked => {
                    if !wager.contains(&claimant) {
                        return Err(WagerError::Validation(
                            "claimant is not a participant".into(),
                        ));
                    }
                    wager.advance(WagerStatus::Verifying)?;
                }
                WagerStatus::Verifying => {
                    return self.replay_pending(&mut wager, digest).await;
                }
                status => return Err(WagerError::Lifecycle { status }),
            }
        }

        debug!(wager = %id.to_uuid_string(), evidence = %digest, "extracting statistics");

        // Extraction may take arbitrarily long; no lock is held here.
        let extracted = tokio::time::timeout(
            self.config.extract_timeout,
            self.extractor.extract(evidence),
        )
        .await
        .unwrap_or(Err(ExtractError::Timeout));

        let stats = match extracted {
            Ok(stats) => stats,
            Err(e) => {
                self.release_verification(&handle).await;
                return Err(WagerError::Extraction(e));
            }
        };

        // The extractor is untrusted; enforce the sanity filter here even
        // if the implementation claims to have run it.
        if let Err(violation) = stats.sanity_check() {
            self.release_verification(&handle).await;
            return Err(WagerError::Extraction(ExtractError::Implausible(violation)));
        }

        // Decide and settle under the wager's lock.
        let mut wager = handle.write().await;

        // The scoreboard must not attribute the performance to someone
        // other than the claimant.
        if let Some(attributed) = stats.player_stats.player.as_deref() {
            if attributed != claimant.as_str() {
                wager.advance(WagerStatus::Locked)?;
                return Err(WagerError::Evaluation(EvalError::AttributionConflict {
                    claimed: claimant.to_string(),
                    attributed: attributed.to_string(),
                }));
            }
        }

        // A match played in the wrong mode or on the wrong map cannot
        // satisfy the wager, whatever the numbers say.
        let verdict = if let Some(mismatch) = wager.eligibility.statistics_mismatch(&stats) {
            debug!(wager = %id.to_uuid_string(), %mismatch, "evidence from non-qualifying match");
            ConditionVerdict::Unmet
        } else {
            match evaluate_all(&wager.conditions, &stats) {
                Ok(verdict) => verdict,
                Err(e) => {
                    wager.advance(WagerStatus::Locked)?;
                    return Err(WagerError::Evaluation(e));
                }
            }
        };

        let verdict = match verdict {
            ConditionVerdict::Met => {
                wager.pending_outcome = Some(SettlementDecision::PayWinner(claimant.clone()));
                self.settle(&mut wager, &claimant).await?;
                VerificationVerdict::Settled
            }
            ConditionVerdict::Unmet => {
                wager.pending_outcome = Some(SettlementDecision::RefundAll);
                self.refund_and_cancel(&mut wager).await?;
                VerificationVerdict::Refunded
            }
            ConditionVerdict::NeedsAdjudication => {
                wager.pending_outcome = Some(SettlementDecision::NeedsAdjudication);
                info!(
                    wager = %id.to_uuid_string(),
                    "custom condition present, awaiting manual adjudication"
                );
                VerificationVerdict::AwaitingAdjudication
            }
        };

        Ok(VerificationOutcome {
            wager: wager.clone(),
            verdict,
            statistics: Some(stats),
            evidence_digest: digest,
        })
    }

    /// Manual override for wagers machine verification cannot settle.
    /// The ruling must name a participant (or void the wager); a recorded
    /// ledger-failed decision can only be retried, never changed.
    pub async fn adjudicate(&self, id: WagerId, ruling: Ruling) -> Result<Wager, WagerError> {
        let handle = self.registry.get(&id).await.ok_or(WagerError::NotFound)?;
        let mut wager = handle.write().await;

        if let Ruling::Winner(ref winner) = ruling {
            if !wager.contains(winner) {
                return Err(WagerError::Validation("winner must be a participant".into()));
            }
        }

        let decision = match &ruling {
            Ruling::Winner(winner) => SettlementDecision::PayWinner(winner.clone()),
            Ruling::Void => SettlementDecision::RefundAll,
        };

        match (wager.status, &wager.pending_outcome) {
            (WagerStatus::Locked, _) => {
                wager.advance(WagerStatus::Verifying)?;
            }
            (WagerStatus::Verifying, Some(SettlementDecision::NeedsAdjudication)) => {}
            // Retrying the decision a failed ledger call left behind.
            (WagerStatus::Verifying, Some(existing)) if *existing == decision => {}
            (status, _) => return Err(WagerError::Lifecycle { status }),
        }

        info!(wager = %id.to_uuid_string(), ?ruling, "manual adjudication");
        wager.pending_outcome = Some(decision.clone());
        match decision {
            SettlementDecision::PayWinner(winner) => self.settle(&mut wager, &winner).await?,
            SettlementDecision::RefundAll => self.refund_and_cancel(&mut wager).await?,
            SettlementDecision::NeedsAdjudication => unreachable!("ruling maps to a terminal decision"),
        }
        Ok(wager.clone())
    }

    /// Cancel and refund every `Open` wager whose join window has closed.
    /// Safe to run concurrently with joins; returns how many were
    /// cancelled.
    pub async fn cancel_expired(&self) -> usize {
        let now = Utc::now();
        let mut cancelled = 0;

        for handle in self.registry.handles().await {
            let mut wager = handle.write().await;
            if wager.status == WagerStatus::Open && wager.is_expired(now) {
                self.expire(&mut wager).await;
                if wager.status == WagerStatus::Cancelled {
                    cancelled += 1;
                }
            }
        }

        if cancelled > 0 {
            info!(cancelled, "expired wagers swept");
        }
        cancelled
    }

    /// Fetch a wager by id.
    pub async fn get_wager(&self, id: &WagerId) -> Result<Wager, WagerError> {
        let handle = self.registry.get(id).await.ok_or(WagerError::NotFound)?;
        let wager = handle.read().await;
        Ok(wager.clone())
    }

    /// List joinable wagers (`Open`/`Locked`), filtered.
    pub async fn list_wagers(&self, filter: &WagerFilter) -> Vec<Wager> {
        let mut out = Vec::new();
        for handle in self.registry.handles().await {
            let wager = handle.read().await;
            if matches!(wager.status, WagerStatus::Open | WagerStatus::Locked)
                && filter.matches(&wager)
            {
                out.push(wager.clone());
            }
        }
        out.sort_by_key(|w| w.created_at);
        out
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Replay the settlement decision a previous verification recorded.
    async fn replay_pending(
        &self,
        wager: &mut Wager,
        digest: String,
    ) -> Result<VerificationOutcome, WagerError> {
        match wager.pending_outcome.clone() {
            Some(SettlementDecision::PayWinner(winner)) => {
                self.settle(wager, &winner).await?;
                Ok(VerificationOutcome {
                    wager: wager.clone(),
                    verdict: VerificationVerdict::Settled,
                    statistics: None,
                    evidence_digest: digest,
                })
            }
            Some(SettlementDecision::RefundAll) => {
                self.refund_and_cancel(wager).await?;
                Ok(VerificationOutcome {
                    wager: wager.clone(),
                    verdict: VerificationVerdict::Refunded,
                    statistics: None,
                    evidence_digest: digest,
                })
            }
            // Awaiting a human, or another verification is in flight.
            Some(SettlementDecision::NeedsAdjudication) | None => Err(WagerError::Lifecycle {
                status: WagerStatus::Verifying,
            }),
        }
    }

    /// Pay the pool to the winner and finish the wager.
    async fn settle(&self, wager: &mut Wager, winner: &ParticipantId) -> Result<(), WagerError> {
        self.bounded(self.ledger.transfer(&wager.escrow, winner))
            .await
            .map_err(WagerError::Settlement)?;
        wager.winner = Some(winner.clone());
        wager.pending_outcome = None;
        wager.advance(WagerStatus::Settled)?;
        info!(
            wager = %wager.id.to_uuid_string(),
            winner = %winner,
            pool = wager.pool_total(),
            "wager settled"
        );
        Ok(())
    }

    /// Refund every contributor and finish the wager.
    async fn refund_and_cancel(&self, wager: &mut Wager) -> Result<(), WagerError> {
        self.bounded(self.ledger.refund(&wager.escrow))
            .await
            .map_err(WagerError::Settlement)?;
        wager.pending_outcome = None;
        wager.advance(WagerStatus::Cancelled)?;
        info!(wager = %wager.id.to_uuid_string(), "wager cancelled and refunded");
        Ok(())
    }

    /// Expire an `Open` wager: refund, then cancel. A failed refund
    /// leaves it `Open` so the next sweep retries; the refund is
    /// idempotent per handle.
    async fn expire(&self, wager: &mut Wager) {
        match self.bounded(self.ledger.refund(&wager.escrow)).await {
            Ok(()) => {
                if wager.advance(WagerStatus::Cancelled).is_ok() {
                    info!(
                        wager = %wager.id.to_uuid_string(),
                        "unfilled wager expired, stakes refunded"
                    );
                }
            }
            Err(e) => {
                warn!(
                    wager = %wager.id.to_uuid_string(),
                    error = %e,
                    "refund of expired wager failed, will retry on next sweep"
                );
            }
        }
    }

    /// Release a `Verifying` wager back to `Locked` after unusable
    /// evidence, so verification can be retried.
    async fn release_verification(&self, handle: &WagerHandle) {
        let mut wager = handle.write().await;
        if wager.status == WagerStatus::Verifying && wager.pending_outcome.is_none() {
            let _ = wager.advance(WagerStatus::Locked);
        }
    }

    /// Bound a ledger call by the configured timeout.
    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        tokio::time::timeout(self.config.ledger_timeout, call)
            .await
            .unwrap_or_else(|_| Err(LedgerError::Unavailable("ledger call timed out".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::escrow::{EscrowHandle, InMemoryLedger};
    use crate::ports::extractor::ScoreboardJsonExtractor;
    use crate::wager::condition::{Comparator, ConditionKind, WinCondition};
    use crate::wager::state::Eligibility;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Ledger wrapper that fails settlement calls on demand.
    #[derive(Default)]
    struct FlakyLedger {
        inner: InMemoryLedger,
        fail_settlements: AtomicBool,
    }

    impl FlakyLedger {
        fn fail_settlements(&self, fail: bool) {
            self.fail_settlements.store(fail, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), LedgerError> {
            if self.fail_settlements.load(Ordering::SeqCst) {
                Err(LedgerError::Unavailable("injected failure".into()))
            } else {
                Ok(())
            }
        }
    }

    impl EscrowLedger for FlakyLedger {
        async fn reserve(
            &self,
            participant: &ParticipantId,
            amount: u64,
        ) -> Result<EscrowHandle, LedgerError> {
            self.inner.reserve(participant, amount).await
        }

        async fn extend(
            &self,
            handle: &EscrowHandle,
            participant: &ParticipantId,
            amount: u64,
        ) -> Result<(), LedgerError> {
            self.inner.extend(handle, participant, amount).await
        }

        async fn transfer(
            &self,
            handle: &EscrowHandle,
            recipient: &ParticipantId,
        ) -> Result<(), LedgerError> {
            self.check()?;
            self.inner.transfer(handle, recipient).await
        }

        async fn refund(&self, handle: &EscrowHandle) -> Result<(), LedgerError> {
            self.check()?;
            self.inner.refund(handle).await
        }

        async fn balance(&self, participant: &ParticipantId) -> Result<u64, LedgerError> {
            self.inner.balance(participant).await
        }
    }

    type TestEngine = WagerEngine<Arc<FlakyLedger>, ScoreboardJsonExtractor>;

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    fn carol() -> ParticipantId {
        ParticipantId::new("carol")
    }

    async fn test_engine() -> (TestEngine, Arc<FlakyLedger>) {
        let ledger = Arc::new(FlakyLedger::default());
        for account in [alice(), bob(), carol()] {
            ledger.inner.credit(&account, 1000).await;
        }
        let engine = WagerEngine::new(
            Arc::clone(&ledger),
            ScoreboardJsonExtractor::new(),
            EngineConfig::default(),
        );
        (engine, ledger)
    }

    fn kills_spec() -> WagerSpec {
        WagerSpec {
            match_ref: "match-123".into(),
            stake_amount: 100,
            conditions: vec![WinCondition::numeric(ConditionKind::Kills, Comparator::Gt, 20)],
            creator: alice(),
            eligibility: Eligibility::default(),
            time_limit_minutes: 30,
            max_participants: 2,
        }
    }

    fn evidence(kills: u32) -> Vec<u8> {
        format!(
            r#"{{"player_stats": {{"kills": {kills}, "deaths": 5, "assists": 3}},
                "game_info": {{"mode": "Team Deathmatch", "map": "Shipment"}}}}"#
        )
        .into_bytes()
    }

    async fn filled_wager(engine: &TestEngine) -> Wager {
        let wager = engine.create_wager(kills_spec()).await.unwrap();
        engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await
            .unwrap()
    }

    async fn backdate(engine: &TestEngine, id: WagerId, minutes: i64) {
        let handle = engine.registry.get(&id).await.unwrap();
        let mut wager = handle.write().await;
        wager.created_at = Utc::now() - chrono::Duration::minutes(minutes);
    }

    // =========================================================================
    // CREATE / JOIN
    // =========================================================================

    #[tokio::test]
    async fn test_create_reserves_creator_stake() {
        let (engine, ledger) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();

        assert_eq!(wager.status, WagerStatus::Open);
        assert_eq!(wager.participants, vec![alice()]);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 900);
        assert_eq!(ledger.inner.pool_balance(&wager.escrow).await, 100);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_spec_without_side_effects() {
        let (engine, ledger) = test_engine().await;
        let mut spec = kills_spec();
        spec.stake_amount = 0;

        assert!(matches!(
            engine.create_wager(spec).await,
            Err(WagerError::Validation(_))
        ));
        assert_eq!(engine.registry.count().await, 0);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_create_fails_when_reservation_fails() {
        let (engine, _ledger) = test_engine().await;
        let mut spec = kills_spec();
        spec.creator = ParticipantId::new("unfunded");

        assert!(matches!(
            engine.create_wager(spec).await,
            Err(WagerError::Escrow(_))
        ));
        // No partial state is persisted.
        assert_eq!(engine.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_join_fills_and_locks() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        assert_eq!(wager.status, WagerStatus::Locked);
        assert_eq!(wager.participants.len(), 2);
        // Pool invariant: stake x participants == reserved total.
        assert_eq!(
            ledger.inner.pool_balance(&wager.escrow).await,
            wager.pool_total()
        );
    }

    #[tokio::test]
    async fn test_join_unknown_wager() {
        let (engine, _) = test_engine().await;
        let result = engine
            .join_wager(WagerId::generate(), bob(), 100, JoinContext::default())
            .await;
        assert!(matches!(result, Err(WagerError::NotFound)));
    }

    #[tokio::test]
    async fn test_join_full_wager_is_capacity_error() {
        let (engine, _) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let result = engine
            .join_wager(wager.id, carol(), 100, JoinContext::default())
            .await;
        assert!(matches!(result, Err(WagerError::Capacity)));
    }

    #[tokio::test]
    async fn test_join_settled_wager_is_lifecycle_error() {
        let (engine, _) = test_engine().await;
        let wager = filled_wager(&engine).await;
        engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();

        let result = engine
            .join_wager(wager.id, carol(), 100, JoinContext::default())
            .await;
        assert!(matches!(
            result,
            Err(WagerError::Lifecycle { status: WagerStatus::Settled })
        ));
    }

    #[tokio::test]
    async fn test_join_stake_mismatch() {
        let (engine, _) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();

        let result = engine
            .join_wager(wager.id, bob(), 50, JoinContext::default())
            .await;
        assert!(matches!(result, Err(WagerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_join_twice_rejected() {
        let (engine, _) = test_engine().await;
        let mut spec = kills_spec();
        spec.max_participants = 3;
        let wager = engine.create_wager(spec).await.unwrap();

        engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await
            .unwrap();
        let result = engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await;
        assert!(matches!(result, Err(WagerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_join_eligibility_enforced() {
        let (engine, _) = test_engine().await;
        let mut spec = kills_spec();
        spec.eligibility.min_kd_ratio = Some(1.5);
        let wager = engine.create_wager(spec).await.unwrap();

        let low = JoinContext {
            kd_ratio: Some(0.8),
            ..Default::default()
        };
        assert!(matches!(
            engine.join_wager(wager.id, bob(), 100, low).await,
            Err(WagerError::Eligibility(_))
        ));

        let ok = JoinContext {
            kd_ratio: Some(2.1),
            ..Default::default()
        };
        assert!(engine.join_wager(wager.id, bob(), 100, ok).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_failed_reservation_changes_nothing() {
        let (engine, _) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();

        let result = engine
            .join_wager(
                wager.id,
                ParticipantId::new("unfunded"),
                100,
                JoinContext::default(),
            )
            .await;
        assert!(matches!(result, Err(WagerError::Escrow(_))));

        let after = engine.get_wager(&wager.id).await.unwrap();
        assert_eq!(after.status, WagerStatus::Open);
        assert_eq!(after.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_exactly_one_fills_last_slot() {
        let (engine, _) = test_engine().await;
        let engine = Arc::new(engine);
        let wager = engine.create_wager(kills_spec()).await.unwrap();

        let e1 = Arc::clone(&engine);
        let e2 = Arc::clone(&engine);
        let id = wager.id;
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { e1.join_wager(id, bob(), 100, JoinContext::default()).await }),
            tokio::spawn(
                async move { e2.join_wager(id, carol(), 100, JoinContext::default()).await }
            ),
        );
        let results = [r1.unwrap(), r2.unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let capacity_losses = results
            .iter()
            .filter(|r| matches!(r, Err(WagerError::Capacity)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(capacity_losses, 1);

        let after = engine.get_wager(&wager.id).await.unwrap();
        assert_eq!(after.status, WagerStatus::Locked);
        assert_eq!(after.participants.len(), 2);
    }

    // =========================================================================
    // EXPIRY
    // =========================================================================

    #[tokio::test]
    async fn test_join_after_deadline_fails_even_without_sweep() {
        let (engine, ledger) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();
        backdate(&engine, wager.id, 31).await;

        let result = engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await;
        assert!(matches!(result, Err(WagerError::Timeout)));

        // The join itself expired the wager and refunded the creator.
        let after = engine.get_wager(&wager.id).await.unwrap();
        assert_eq!(after.status, WagerStatus::Cancelled);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
        assert_eq!(ledger.inner.settlement_actions(&after.escrow).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_cancels_expired_only() {
        let (engine, ledger) = test_engine().await;
        let expired = engine.create_wager(kills_spec()).await.unwrap();
        let fresh = engine.create_wager(kills_spec()).await.unwrap();
        backdate(&engine, expired.id, 45).await;

        assert_eq!(engine.cancel_expired().await, 1);
        assert_eq!(
            engine.get_wager(&expired.id).await.unwrap().status,
            WagerStatus::Cancelled
        );
        assert_eq!(
            engine.get_wager(&fresh.id).await.unwrap().status,
            WagerStatus::Open
        );
        assert_eq!(ledger.inner.settlement_actions(&expired.escrow).await, 1);

        // Second sweep finds nothing.
        assert_eq!(engine.cancel_expired().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_retries_after_refund_failure() {
        let (engine, ledger) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();
        backdate(&engine, wager.id, 45).await;

        ledger.fail_settlements(true);
        assert_eq!(engine.cancel_expired().await, 0);
        // Still open: the refund never happened.
        assert_eq!(
            engine.get_wager(&wager.id).await.unwrap().status,
            WagerStatus::Open
        );

        ledger.fail_settlements(false);
        assert_eq!(engine.cancel_expired().await, 1);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
    }

    // =========================================================================
    // VERIFICATION & SETTLEMENT
    // =========================================================================

    #[tokio::test]
    async fn test_winning_verification_settles() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let outcome = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();

        assert_eq!(outcome.verdict, VerificationVerdict::Settled);
        assert_eq!(outcome.wager.status, WagerStatus::Settled);
        assert_eq!(outcome.wager.winner, Some(alice()));
        assert_eq!(outcome.statistics.unwrap().player_stats.kills, 25);

        // Full 200-unit pool paid out exactly once.
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1100);
        assert_eq!(ledger.inner.balance(&bob()).await.unwrap(), 900);
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 1);
    }

    #[tokio::test]
    async fn test_losing_verification_refunds() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let outcome = engine
            .submit_verification(wager.id, alice(), &evidence(10))
            .await
            .unwrap();

        assert_eq!(outcome.verdict, VerificationVerdict::Refunded);
        assert_eq!(outcome.wager.status, WagerStatus::Cancelled);
        assert_eq!(outcome.wager.winner, None);

        // Each participant made whole, exactly one refund issued.
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
        assert_eq!(ledger.inner.balance(&bob()).await.unwrap(), 1000);
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 1);
    }

    #[tokio::test]
    async fn test_verification_before_lock_rejected() {
        let (engine, _) = test_engine().await;
        let wager = engine.create_wager(kills_spec()).await.unwrap();

        let result = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await;
        assert!(matches!(
            result,
            Err(WagerError::Lifecycle { status: WagerStatus::Open })
        ));
    }

    #[tokio::test]
    async fn test_second_verification_after_settlement_rejected() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();
        let second = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await;

        assert!(matches!(
            second,
            Err(WagerError::Lifecycle { status: WagerStatus::Settled })
        ));
        // No second payout.
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 1);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1100);
    }

    #[tokio::test]
    async fn test_claimant_must_be_participant() {
        let (engine, _) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let result = engine
            .submit_verification(wager.id, carol(), &evidence(25))
            .await;
        assert!(matches!(result, Err(WagerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unusable_evidence_releases_wager() {
        let (engine, _) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let result = engine
            .submit_verification(wager.id, alice(), b"not a scoreboard")
            .await;
        assert!(matches!(result, Err(WagerError::Extraction(_))));

        // Back to Locked: a better screenshot can still settle it.
        let after = engine.get_wager(&wager.id).await.unwrap();
        assert_eq!(after.status, WagerStatus::Locked);

        let outcome = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();
        assert_eq!(outcome.verdict, VerificationVerdict::Settled);
    }

    #[tokio::test]
    async fn test_implausible_stats_are_extraction_not_refund() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let result = engine
            .submit_verification(wager.id, alice(), &evidence(9000))
            .await;
        assert!(matches!(
            result,
            Err(WagerError::Extraction(ExtractError::Implausible(_)))
        ));
        // Hallucinated numbers must not trigger a refund.
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 0);
        assert_eq!(
            engine.get_wager(&wager.id).await.unwrap().status,
            WagerStatus::Locked
        );
    }

    #[tokio::test]
    async fn test_missing_field_is_evaluation_error() {
        let (engine, _) = test_engine().await;
        let mut spec = kills_spec();
        spec.conditions = vec![WinCondition::numeric(
            ConditionKind::Placement,
            Comparator::Le,
            3,
        )];
        let wager = engine.create_wager(spec).await.unwrap();
        engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await
            .unwrap();

        // Evidence has no placement; the condition cannot be answered.
        let result = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await;
        assert!(matches!(result, Err(WagerError::Evaluation(_))));
        assert_eq!(
            engine.get_wager(&wager.id).await.unwrap().status,
            WagerStatus::Locked
        );
    }

    #[tokio::test]
    async fn test_attribution_conflict_is_evaluation_error() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        let foreign = br#"{"player_stats": {"kills": 30, "deaths": 2, "assists": 1, "player": "mallory"},
            "game_info": {"mode": "Team Deathmatch", "map": "Shipment"}}"#;
        let result = engine
            .submit_verification(wager.id, alice(), foreign)
            .await;

        assert!(matches!(
            result,
            Err(WagerError::Evaluation(EvalError::AttributionConflict { .. }))
        ));
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 0);
    }

    #[tokio::test]
    async fn test_wrong_mode_evidence_refunds() {
        let (engine, ledger) = test_engine().await;
        let mut spec = kills_spec();
        spec.eligibility.required_mode = Some("Team Deathmatch".into());
        let wager = engine.create_wager(spec).await.unwrap();
        let ctx = JoinContext {
            game_mode: Some("Team Deathmatch".into()),
            ..Default::default()
        };
        engine.join_wager(wager.id, bob(), 100, ctx).await.unwrap();

        let warzone = br#"{"player_stats": {"kills": 30, "deaths": 2, "assists": 1},
            "game_info": {"mode": "Warzone", "map": "Verdansk"}}"#;
        let outcome = engine
            .submit_verification(wager.id, alice(), warzone)
            .await
            .unwrap();

        // A non-qualifying match cannot satisfy the wager.
        assert_eq!(outcome.verdict, VerificationVerdict::Refunded);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_settlement_failure_keeps_decision_for_retry() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        ledger.fail_settlements(true);
        let result = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await;
        assert!(matches!(result, Err(WagerError::Settlement(_))));

        // Stuck in Verifying with the decision recorded.
        let stuck = engine.get_wager(&wager.id).await.unwrap();
        assert_eq!(stuck.status, WagerStatus::Verifying);
        assert_eq!(
            stuck.pending_outcome,
            Some(SettlementDecision::PayWinner(alice()))
        );

        // Retry replays the recorded decision; the losing evidence passed
        // here must not be re-evaluated.
        ledger.fail_settlements(false);
        let outcome = engine
            .submit_verification(wager.id, alice(), &evidence(0))
            .await
            .unwrap();
        assert_eq!(outcome.verdict, VerificationVerdict::Settled);
        assert!(outcome.statistics.is_none());
        assert_eq!(outcome.wager.winner, Some(alice()));
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 1);
    }

    // =========================================================================
    // CUSTOM CONDITIONS & ADJUDICATION
    // =========================================================================

    async fn custom_wager(engine: &TestEngine) -> Wager {
        let mut spec = kills_spec();
        spec.conditions.push(WinCondition::custom("win without dying in the final minute"));
        let wager = engine.create_wager(spec).await.unwrap();
        engine
            .join_wager(wager.id, bob(), 100, JoinContext::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_custom_condition_never_auto_settles() {
        let (engine, ledger) = test_engine().await;
        let wager = custom_wager(&engine).await;

        let outcome = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();

        assert_eq!(outcome.verdict, VerificationVerdict::AwaitingAdjudication);
        assert_eq!(outcome.wager.status, WagerStatus::Verifying);
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 0);
    }

    #[tokio::test]
    async fn test_adjudication_settles_custom_wager() {
        let (engine, ledger) = test_engine().await;
        let wager = custom_wager(&engine).await;
        engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();

        let settled = engine
            .adjudicate(wager.id, Ruling::Winner(bob()))
            .await
            .unwrap();
        assert_eq!(settled.status, WagerStatus::Settled);
        assert_eq!(settled.winner, Some(bob()));
        assert_eq!(ledger.inner.balance(&bob()).await.unwrap(), 1100);
    }

    #[tokio::test]
    async fn test_adjudication_void_refunds() {
        let (engine, ledger) = test_engine().await;
        let wager = custom_wager(&engine).await;
        engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await
            .unwrap();

        let voided = engine.adjudicate(wager.id, Ruling::Void).await.unwrap();
        assert_eq!(voided.status, WagerStatus::Cancelled);
        assert_eq!(ledger.inner.balance(&alice()).await.unwrap(), 1000);
        assert_eq!(ledger.inner.balance(&bob()).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_adjudication_winner_must_be_participant() {
        let (engine, _) = test_engine().await;
        let wager = custom_wager(&engine).await;

        let result = engine.adjudicate(wager.id, Ruling::Winner(carol())).await;
        assert!(matches!(result, Err(WagerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_adjudication_cannot_override_recorded_decision() {
        let (engine, ledger) = test_engine().await;
        let wager = filled_wager(&engine).await;

        ledger.fail_settlements(true);
        let _ = engine
            .submit_verification(wager.id, alice(), &evidence(25))
            .await;

        // The winner was decided; a contrary ruling must not rewrite it.
        ledger.fail_settlements(false);
        let result = engine.adjudicate(wager.id, Ruling::Winner(bob())).await;
        assert!(matches!(result, Err(WagerError::Lifecycle { .. })));

        // Retrying the same decision is allowed.
        let settled = engine
            .adjudicate(wager.id, Ruling::Winner(alice()))
            .await
            .unwrap();
        assert_eq!(settled.winner, Some(alice()));
        assert_eq!(ledger.inner.settlement_actions(&wager.escrow).await, 1);
    }

    // =========================================================================
    // LISTING
    // =========================================================================

    #[tokio::test]
    async fn test_list_returns_joinable_only() {
        let (engine, _) = test_engine().await;
        let open = engine.create_wager(kills_spec()).await.unwrap();
        let settled = filled_wager(&engine).await;
        engine
            .submit_verification(settled.id, alice(), &evidence(25))
            .await
            .unwrap();

        let listed = engine.list_wagers(&WagerFilter::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, open.id);
    }

    #[tokio::test]
    async fn test_list_filters_by_mode_and_stake() {
        let (engine, _) = test_engine().await;

        let mut tdm = kills_spec();
        tdm.eligibility.required_mode = Some("Team Deathmatch".into());
        engine.create_wager(tdm).await.unwrap();

        let mut pricey = kills_spec();
        pricey.stake_amount = 500;
        engine.create_wager(pricey).await.unwrap();

        let by_mode = engine
            .list_wagers(&WagerFilter {
                game_mode: Some("Team Deathmatch".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_mode.len(), 1);

        let by_stake = engine
            .list_wagers(&WagerFilter {
                min_stake: Some(200),
                max_stake: Some(800),
                ..Default::default()
            })
            .await;
        assert_eq!(by_stake.len(), 1);
        assert_eq!(by_stake[0].stake_amount, 500);
    }
}
