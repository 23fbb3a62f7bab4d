//! Wager State
//!
//! The wager data model and its lifecycle state machine. Status moves
//! strictly forward: `Open -> Locked -> Verifying -> {Settled, Cancelled}`,
//! with `Open -> Cancelled` on timeout. A wager that reaches `Settled` or
//! `Cancelled` never changes again. The one backward edge,
//! `Verifying -> Locked`, exists so that unusable evidence (extraction or
//! evaluation failure, before any settlement decision is recorded) releases
//! the wager for a fresh verification attempt instead of wedging it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ports::escrow::{EscrowHandle, LedgerError};
use crate::ports::extractor::ExtractError;
use crate::wager::condition::{EvalError, WinCondition};
use crate::wager::stats::MatchStatistics;

/// Smallest allowed participant count.
pub const MIN_PARTICIPANTS: usize = 2;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique wager identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct WagerId(pub [u8; 16]);

impl WagerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Opaque participant identifier: the wallet/account string the escrow
/// ledger is addressed by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Wrap an account string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The underlying account string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// STATUS STATE MACHINE
// =============================================================================

/// Wager lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerStatus {
    /// Accepting joiners.
    Open,
    /// Filled; waiting for the match to be played and verified.
    Locked,
    /// Verification in flight, or a recorded settlement decision awaiting
    /// a successful ledger call.
    Verifying,
    /// Pool paid out to the winner. Terminal.
    Settled,
    /// Stakes refunded (timeout or unmet conditions). Terminal.
    Cancelled,
}

impl WagerStatus {
    /// Whether the wager can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, WagerStatus::Settled | WagerStatus::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle edge.
    pub fn can_transition(self, next: WagerStatus) -> bool {
        use WagerStatus::*;
        matches!(
            (self, next),
            (Open, Locked)
                | (Open, Cancelled)
                | (Locked, Verifying)
                | (Verifying, Settled)
                | (Verifying, Cancelled)
                | (Verifying, Locked)
        )
    }
}

/// Settlement decision recorded before the ledger call is attempted.
///
/// Once recorded it is never re-derived: a retry after a ledger failure
/// replays exactly this decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementDecision {
    /// Transfer the full pool to this participant.
    PayWinner(ParticipantId),
    /// Return every contributor's share.
    RefundAll,
    /// A custom condition is involved; a human must rule.
    NeedsAdjudication,
}

// =============================================================================
// ELIGIBILITY
// =============================================================================

/// Join-time eligibility requirements, all optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    /// Minimum kill/death ratio required to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_kd_ratio: Option<f64>,
    /// Required game mode (e.g. "Team Deathmatch").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_mode: Option<String>,
    /// Required map name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_map: Option<String>,
}

/// Context a joiner supplies to satisfy eligibility requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinContext {
    /// Joiner's kill/death ratio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kd_ratio: Option<f64>,
    /// Game mode the joiner intends to play.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<String>,
    /// Map the joiner intends to play.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
}

impl Eligibility {
    /// True if no requirement is set.
    pub fn is_empty(&self) -> bool {
        self.min_kd_ratio.is_none() && self.required_mode.is_none() && self.required_map.is_none()
    }

    /// Check a joiner's declared context against the requirements.
    ///
    /// A required value the joiner did not declare counts as not matched.
    pub fn check_join(&self, ctx: &JoinContext) -> Result<(), WagerError> {
        if let Some(min) = self.min_kd_ratio {
            match ctx.kd_ratio {
                Some(ratio) if ratio >= min => {}
                Some(ratio) => {
                    return Err(WagerError::Eligibility(format!(
                        "K/D ratio {ratio} below minimum {min}"
                    )))
                }
                None => {
                    return Err(WagerError::Eligibility(format!(
                        "K/D ratio of at least {min} required"
                    )))
                }
            }
        }
        if let Some(ref mode) = self.required_mode {
            if ctx.game_mode.as_deref() != Some(mode.as_str()) {
                return Err(WagerError::Eligibility(format!("game mode {mode} required")));
            }
        }
        if let Some(ref map) = self.required_map {
            if ctx.map.as_deref() != Some(map.as_str()) {
                return Err(WagerError::Eligibility(format!("map {map} required")));
            }
        }
        Ok(())
    }

    /// Check extracted statistics against the mode/map requirements.
    /// Returns the first mismatch, if any.
    pub fn statistics_mismatch(&self, stats: &MatchStatistics) -> Option<String> {
        if let Some(ref mode) = self.required_mode {
            if stats.game_info.mode != *mode {
                return Some(format!(
                    "played {} but wager requires {mode}",
                    stats.game_info.mode
                ));
            }
        }
        if let Some(ref map) = self.required_map {
            if stats.game_info.map != *map {
                return Some(format!(
                    "played on {} but wager requires {map}",
                    stats.game_info.map
                ));
            }
        }
        None
    }
}

// =============================================================================
// WAGER
// =============================================================================

/// Parameters for creating a wager.
#[derive(Debug, Clone)]
pub struct WagerSpec {
    /// Opaque reference to the match to be played.
    pub match_ref: String,
    /// Stake per participant, in token units.
    pub stake_amount: u64,
    /// Win conditions (AND-combined, non-empty).
    pub conditions: Vec<WinCondition>,
    /// Creator's account.
    pub creator: ParticipantId,
    /// Join requirements.
    pub eligibility: Eligibility,
    /// Minutes after creation within which the wager must fill.
    pub time_limit_minutes: i64,
    /// Maximum participants (>= 2; 2 for head-to-head, more for a pool).
    pub max_participants: usize,
}

impl WagerSpec {
    /// Validate everything that can be rejected before any side effect.
    pub fn validate(&self) -> Result<(), WagerError> {
        if self.stake_amount == 0 {
            return Err(WagerError::Validation("stake amount must be positive".into()));
        }
        if self.max_participants < MIN_PARTICIPANTS {
            return Err(WagerError::Validation(format!(
                "max participants must be at least {MIN_PARTICIPANTS}"
            )));
        }
        if self.conditions.is_empty() {
            return Err(WagerError::Validation("at least one win condition required".into()));
        }
        if self.time_limit_minutes <= 0 {
            return Err(WagerError::Validation("time limit must be positive".into()));
        }
        if self.match_ref.is_empty() {
            return Err(WagerError::Validation("match reference required".into()));
        }
        for condition in &self.conditions {
            condition
                .validate()
                .map_err(|e| WagerError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}

/// A single wager: the authoritative record the registry stores.
#[derive(Debug, Clone)]
pub struct Wager {
    /// Unique identifier, assigned at creation.
    pub id: WagerId,
    /// Opaque reference to the match to be played.
    pub match_ref: String,
    /// Stake per participant.
    pub stake_amount: u64,
    /// Win conditions, AND-combined.
    pub conditions: Vec<WinCondition>,
    /// Creator's account.
    pub creator: ParticipantId,
    /// All participants, creator first. Never exceeds `max_participants`.
    pub participants: Vec<ParticipantId>,
    /// Capacity.
    pub max_participants: usize,
    /// Join requirements.
    pub eligibility: Eligibility,
    /// Minutes after creation within which the wager must fill.
    pub time_limit_minutes: i64,
    /// Lifecycle status.
    pub status: WagerStatus,
    /// Escrow handle for the pooled stakes.
    pub escrow: EscrowHandle,
    /// Winner, set on successful settlement. Always a participant.
    pub winner: Option<ParticipantId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Settlement decision recorded before the ledger call; present only
    /// while `Verifying`.
    pub pending_outcome: Option<SettlementDecision>,
}

impl Wager {
    /// Build an `Open` wager from a validated spec and a reserved escrow
    /// handle. The creator is the first participant.
    pub fn new(id: WagerId, spec: WagerSpec, escrow: EscrowHandle, now: DateTime<Utc>) -> Self {
        Self {
            id,
            match_ref: spec.match_ref,
            stake_amount: spec.stake_amount,
            conditions: spec.conditions,
            participants: vec![spec.creator.clone()],
            creator: spec.creator,
            max_participants: spec.max_participants,
            eligibility: spec.eligibility,
            time_limit_minutes: spec.time_limit_minutes,
            status: WagerStatus::Open,
            escrow,
            winner: None,
            created_at: now,
            pending_outcome: None,
        }
    }

    /// Latest instant at which the wager can still be joined.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(self.time_limit_minutes)
    }

    /// Whether the join window has closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline()
    }

    /// Whether the wager has reached capacity.
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// Total value reserved in escrow for this wager.
    pub fn pool_total(&self) -> u64 {
        self.stake_amount * self.participants.len() as u64
    }

    /// Whether the account is already a participant.
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == participant)
    }

    /// Move to the next status, enforcing the lifecycle edges.
    pub fn advance(&mut self, next: WagerStatus) -> Result<(), WagerError> {
        if !self.status.can_transition(next) {
            return Err(WagerError::Lifecycle { status: self.status });
        }
        self.status = next;
        Ok(())
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Wager operation errors.
///
/// Every operation fails with exactly one of these; the transport layer
/// maps them onto wire error codes with a retryable flag.
#[derive(Debug, Error)]
pub enum WagerError {
    /// Malformed request. Never mutates state.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No wager with the given id.
    #[error("wager not found")]
    NotFound,

    /// Operation illegal for the wager's current status.
    #[error("operation not allowed while wager is {status:?}")]
    Lifecycle {
        /// Status at the time of the request.
        status: WagerStatus,
    },

    /// Wager already at capacity.
    #[error("wager is full")]
    Capacity,

    /// Joiner does not meet the wager's requirements.
    #[error("not eligible: {0}")]
    Eligibility(String),

    /// Join window has closed.
    #[error("wager time limit exceeded")]
    Timeout,

    /// Evidence could not be turned into usable statistics.
    #[error("evidence unusable")]
    Extraction(#[from] ExtractError),

    /// Statistics cannot answer what a condition asks, or contradict the
    /// claimed winner.
    #[error("evaluation failed")]
    Evaluation(#[from] EvalError),

    /// Ledger failure while reserving stakes; no wager state was changed.
    #[error("escrow operation failed")]
    Escrow(#[source] LedgerError),

    /// Ledger failure after a settlement decision was recorded; the wager
    /// stays `Verifying` and the same decision is replayed on retry.
    #[error("settlement incomplete, retry later")]
    Settlement(#[source] LedgerError),
}
