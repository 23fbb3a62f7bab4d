//! # Matchstake Server
//!
//! Escrow-backed peer-to-peer wagering on played-match outcomes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MATCHSTAKE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wager/          - Core domain (deterministic)               │
//! │  ├── condition.rs- Win conditions and the evaluator          │
//! │  ├── stats.rs    - Match statistics and the sanity filter    │
//! │  ├── state.rs    - Wager data model and status machine       │
//! │  ├── engine.rs   - Lifecycle engine (create/join/verify)     │
//! │  └── registry.rs - Per-wager atomic state store              │
//! │                                                              │
//! │  ports/          - External capability contracts             │
//! │  ├── escrow.rs   - Custodial ledger port + reference impl    │
//! │  └── extractor.rs- Stats extraction port + JSON normalizer   │
//! │                                                              │
//! │  network/        - Transport glue (non-deterministic)        │
//! │  ├── server.rs   - WebSocket server + expiry sweep           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Settlement Guarantee
//!
//! Funds move exactly once, to exactly one resolved outcome:
//! - Per-wager state sits behind its own lock; capacity checks, status
//!   transitions and ledger calls for one wager are linearizable.
//! - Settlement decisions are recorded before the ledger call and
//!   replayed verbatim on retry, never re-derived from evidence.
//! - Ledger operations are idempotent per escrow handle.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod ports;
pub mod wager;

// Re-export commonly used types
pub use ports::escrow::{EscrowHandle, EscrowLedger, InMemoryLedger, LedgerError};
pub use ports::extractor::{ExtractError, ScoreboardJsonExtractor, StatsExtractor};
pub use wager::condition::{Comparator, ConditionKind, ConditionVerdict, WinCondition};
pub use wager::engine::{EngineConfig, VerificationVerdict, WagerEngine, WagerFilter};
pub use wager::state::{ParticipantId, Wager, WagerError, WagerId, WagerSpec, WagerStatus};
pub use wager::stats::MatchStatistics;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default join window when a creation request does not set one (minutes).
pub const DEFAULT_TIME_LIMIT_MINUTES: i64 = 30;

/// Default capacity: head-to-head.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 2;
