//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are serialized as tagged JSON for debugging ease; the one
//! binary path is the flat evidence-upload frame (bincode), since raw
//! screenshots do not belong in JSON strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::extractor::ExtractError;
use crate::wager::condition::WinCondition;
use crate::wager::engine::{VerificationOutcome, VerificationVerdict, WagerFilter};
use crate::wager::state::{
    Eligibility, JoinContext, ParticipantId, Wager, WagerError, WagerSpec, WagerStatus,
};
use crate::wager::stats::MatchStatistics;
use crate::{DEFAULT_MAX_PARTICIPANTS, DEFAULT_TIME_LIMIT_MINUTES};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Propose a new wager.
    Create(CreateWagerRequest),

    /// Join an open wager with a matching stake.
    Join(JoinWagerRequest),

    /// Submit match evidence for a locked wager (hex payload; use the
    /// binary frame for raw bytes).
    Verify(VerifyRequest),

    /// Manually adjudicate a wager a custom condition left undecidable.
    Adjudicate(AdjudicateRequest),

    /// List joinable wagers.
    List(ListRequest),

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Bearer token (JWT) from the auth provider.
    pub token: String,
    /// Client version for compatibility check.
    pub client_version: String,
}

/// Wager creation request. The creator is the authenticated participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWagerRequest {
    /// Opaque reference to the match to be played.
    pub match_ref: String,
    /// Stake per participant, in token units.
    pub stake_amount: u64,
    /// Win conditions (AND-combined).
    pub conditions: Vec<WinCondition>,
    /// Minutes the wager stays joinable. Defaults to 30.
    #[serde(default)]
    pub time_limit_minutes: Option<i64>,
    /// Minimum K/D ratio required to join.
    #[serde(default)]
    pub min_kd_ratio: Option<f64>,
    /// Required game mode.
    #[serde(default)]
    pub required_mode: Option<String>,
    /// Required map.
    #[serde(default)]
    pub required_map: Option<String>,
    /// Maximum participants. Defaults to 2 (head-to-head).
    #[serde(default)]
    pub max_participants: Option<usize>,
}

impl CreateWagerRequest {
    /// Build the engine-facing spec for the authenticated creator.
    pub fn into_spec(self, creator: ParticipantId) -> WagerSpec {
        WagerSpec {
            match_ref: self.match_ref,
            stake_amount: self.stake_amount,
            conditions: self.conditions,
            creator,
            eligibility: Eligibility {
                min_kd_ratio: self.min_kd_ratio,
                required_mode: self.required_mode,
                required_map: self.required_map,
            },
            time_limit_minutes: self.time_limit_minutes.unwrap_or(DEFAULT_TIME_LIMIT_MINUTES),
            max_participants: self.max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS),
        }
    }
}

/// Join request. The joiner is the authenticated participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWagerRequest {
    /// Wager to join (UUID string).
    pub wager_id: String,
    /// Offered stake; must match the wager's stake amount.
    pub stake_amount: u64,
    /// Joiner's K/D ratio, if the wager requires one.
    #[serde(default)]
    pub kd_ratio: Option<f64>,
    /// Declared game mode, if the wager requires one.
    #[serde(default)]
    pub game_mode: Option<String>,
    /// Declared map, if the wager requires one.
    #[serde(default)]
    pub map: Option<String>,
}

impl JoinWagerRequest {
    /// The eligibility context this request declares.
    pub fn context(&self) -> JoinContext {
        JoinContext {
            kd_ratio: self.kd_ratio,
            game_mode: self.game_mode.clone(),
            map: self.map.clone(),
        }
    }
}

/// Verification request with hex-encoded evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Wager to verify (UUID string).
    pub wager_id: String,
    /// Hex-encoded evidence payload.
    pub evidence_hex: String,
}

impl VerifyRequest {
    /// Decode the evidence payload.
    pub fn evidence(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.evidence_hex)
    }
}

/// Manual adjudication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicateRequest {
    /// Wager to rule on (UUID string).
    pub wager_id: String,
    /// Winning participant, or absent to void the wager and refund.
    #[serde(default)]
    pub winner: Option<String>,
}

/// Listing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    /// Only wagers requiring this game mode.
    #[serde(default)]
    pub game_mode: Option<String>,
    /// Minimum stake, inclusive.
    #[serde(default)]
    pub min_stake: Option<u64>,
    /// Maximum stake, inclusive.
    #[serde(default)]
    pub max_stake: Option<u64>,
}

impl ListRequest {
    /// The engine-facing filter.
    pub fn filter(&self) -> WagerFilter {
        WagerFilter {
            game_mode: self.game_mode.clone(),
            min_stake: self.min_stake,
            max_stake: self.max_stake,
        }
    }
}

/// Flat binary frame for uploading raw evidence bytes.
///
/// Tagged enums do not survive bincode, so this frame is sent as a raw
/// binary WebSocket message rather than wrapped in [`ClientMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceUpload {
    /// Wager to verify.
    pub wager_id: [u8; 16],
    /// Raw evidence payload (screenshot bytes or recognizer output).
    pub evidence: Vec<u8>,
}

impl EvidenceUpload {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Wager created.
    Created(WagerView),

    /// Joined a wager.
    Joined(WagerView),

    /// Verification resolved (or escalated to a human).
    Verified(VerificationResult),

    /// Manual adjudication applied.
    Adjudicated(WagerView),

    /// Listing response.
    WagerList {
        /// Joinable wagers matching the filter.
        wagers: Vec<WagerView>,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server wall clock, milliseconds since the epoch.
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Reason shown to the client.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Authenticated participant account, if successful.
    pub participant: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Public projection of a wager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerView {
    /// Wager id (UUID string).
    pub id: String,
    /// Match reference.
    pub match_ref: String,
    /// Stake per participant.
    pub stake_amount: u64,
    /// Win conditions.
    pub conditions: Vec<WinCondition>,
    /// Lifecycle status.
    pub status: WagerStatus,
    /// Creator account.
    pub creator: String,
    /// All participant accounts.
    pub participants: Vec<String>,
    /// Capacity.
    pub max_participants: usize,
    /// Join requirements.
    #[serde(default)]
    pub eligibility: Eligibility,
    /// Minutes the wager stays joinable after creation.
    pub time_limit_minutes: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Escrow handle for the pooled stakes.
    pub escrow: String,
    /// Winner, once settled.
    pub winner: Option<String>,
    /// Total value reserved in escrow.
    pub pool_total: u64,
}

impl From<&Wager> for WagerView {
    fn from(wager: &Wager) -> Self {
        Self {
            id: wager.id.to_uuid_string(),
            match_ref: wager.match_ref.clone(),
            stake_amount: wager.stake_amount,
            conditions: wager.conditions.clone(),
            status: wager.status,
            creator: wager.creator.to_string(),
            participants: wager.participants.iter().map(|p| p.to_string()).collect(),
            max_participants: wager.max_participants,
            eligibility: wager.eligibility.clone(),
            time_limit_minutes: wager.time_limit_minutes,
            created_at: wager.created_at,
            escrow: wager.escrow.to_string(),
            winner: wager.winner.as_ref().map(|w| w.to_string()),
            pool_total: wager.pool_total(),
        }
    }
}

/// Settlement outcome returned from a verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Wager state after the operation.
    pub wager: WagerView,
    /// How the verification resolved.
    pub verdict: VerificationVerdict,
    /// Statistics the decision was based on (absent when a recorded
    /// decision was replayed).
    pub statistics: Option<MatchStatistics>,
    /// SHA-256 of the submitted evidence.
    pub evidence_digest: String,
}

impl From<&VerificationOutcome> for VerificationResult {
    fn from(outcome: &VerificationOutcome) -> Self {
        Self {
            wager: WagerView::from(&outcome.wager),
            verdict: outcome.verdict,
            statistics: outcome.statistics.clone(),
            evidence_digest: outcome.evidence_digest.clone(),
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether retrying the same request later can succeed.
    pub retryable: bool,
}

impl ServerError {
    /// Non-retryable error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Malformed request.
    InvalidRequest,
    /// Wager not found.
    WagerNotFound,
    /// Operation illegal for the wager's current status.
    LifecycleViolation,
    /// Wager already at capacity.
    WagerFull,
    /// Joiner does not meet the wager's requirements.
    NotEligible,
    /// Join window has closed.
    WagerExpired,
    /// Evidence could not be turned into usable statistics.
    EvidenceUnusable,
    /// Statistics cannot answer the wager's conditions.
    EvaluationFailed,
    /// Escrow reservation failed.
    EscrowFailed,
    /// Settlement decided but not yet applied; retry.
    SettlementPending,
    /// Internal error.
    InternalError,
}

impl From<&WagerError> for ServerError {
    fn from(err: &WagerError) -> Self {
        let (code, retryable) = match err {
            WagerError::Validation(_) => (ErrorCode::InvalidRequest, false),
            WagerError::NotFound => (ErrorCode::WagerNotFound, false),
            WagerError::Lifecycle { .. } => (ErrorCode::LifecycleViolation, false),
            WagerError::Capacity => (ErrorCode::WagerFull, false),
            WagerError::Eligibility(_) => (ErrorCode::NotEligible, false),
            WagerError::Timeout => (ErrorCode::WagerExpired, false),
            WagerError::Extraction(source) => (
                ErrorCode::EvidenceUnusable,
                matches!(source, ExtractError::Timeout | ExtractError::Upstream(_)),
            ),
            WagerError::Evaluation(_) => (ErrorCode::EvaluationFailed, false),
            WagerError::Escrow(source) => (ErrorCode::EscrowFailed, source.is_retryable()),
            WagerError::Settlement(_) => (ErrorCode::SettlementPending, true),
        };
        // Surface the source detail, not just the wrapper.
        let message = match err {
            WagerError::Extraction(source) => format!("{err}: {source}"),
            WagerError::Evaluation(source) => format!("{err}: {source}"),
            WagerError::Escrow(source) => format!("{err}: {source}"),
            WagerError::Settlement(source) => format!("{err}: {source}"),
            _ => err.to_string(),
        };
        Self {
            code,
            message,
            retryable,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
