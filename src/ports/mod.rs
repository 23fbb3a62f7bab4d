//! Capability Ports
//!
//! Contracts for the external collaborators the core depends on but does
//! not implement: the custodial escrow ledger and the match-statistics
//! extractor. Reference implementations back the demo binary and tests.

pub mod escrow;
pub mod extractor;

pub use escrow::{EscrowHandle, EscrowLedger, InMemoryLedger, LedgerError};
pub use extractor::{evidence_digest, ExtractError, ScoreboardJsonExtractor, StatsExtractor};
