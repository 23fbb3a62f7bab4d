//! Stats Extraction Port
//!
//! Capability contract for turning raw match evidence (a screenshot, or the
//! text a vision model produced from one) into structured statistics. The
//! upstream recognizer is slow, untrusted, and prone to hallucination, so
//! everything that comes back is normalized into the one canonical shape
//! and pushed through the sanity filter before the core ever sees it.

use std::future::Future;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::wager::stats::{GameInfo, MatchStatistics, PlayerStats, SanityViolation};

/// Extraction failures. None of these are a failed-condition outcome; the
/// wager stays decidable and verification can be retried with better
/// evidence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Evidence could not be parsed at all.
    #[error("unreadable evidence: {0}")]
    Unreadable(String),

    /// The recognizer output lacks a field the canonical shape requires.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Values parsed but failed the sanity filter.
    #[error("implausible statistics")]
    Implausible(#[from] SanityViolation),

    /// Upstream recognizer failed.
    #[error("extractor failed: {0}")]
    Upstream(String),

    /// The extractor did not answer within the configured bound.
    #[error("extraction timed out")]
    Timeout,
}

/// The stats extraction capability.
pub trait StatsExtractor: Send + Sync {
    /// Turn raw evidence into canonical match statistics.
    ///
    /// Implementations must normalize whatever the upstream recognizer
    /// emits into exactly [`MatchStatistics`] and run the sanity filter,
    /// or fail.
    fn extract(
        &self,
        evidence: &[u8],
    ) -> impl Future<Output = Result<MatchStatistics, ExtractError>> + Send;
}

impl<T: StatsExtractor> StatsExtractor for std::sync::Arc<T> {
    fn extract(
        &self,
        evidence: &[u8],
    ) -> impl Future<Output = Result<MatchStatistics, ExtractError>> + Send {
        (**self).extract(evidence)
    }
}

/// Hex SHA-256 digest of an evidence payload, for logs and audit trails.
pub fn evidence_digest(evidence: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(evidence);
    hex::encode(hasher.finalize())
}

// =============================================================================
// SCOREBOARD JSON NORMALIZER
// =============================================================================

/// Extractor for evidence that is already recognizer output: the JSON a
/// vision model produced from a scoreboard screenshot, possibly wrapped in
/// markdown fences and with any of the shapes such models like to invent.
/// The vision call itself lives outside this crate; this is the normalizing
/// half of the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreboardJsonExtractor;

impl ScoreboardJsonExtractor {
    /// Create a new extractor.
    pub fn new() -> Self {
        Self
    }

    /// Normalize recognizer JSON into canonical statistics.
    pub fn normalize(value: &serde_json::Value) -> Result<MatchStatistics, ExtractError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ExtractError::Unreadable("top-level JSON object expected".into()))?;

        // Team scores live under "team_scores" or "teams".
        let mut team_scores = std::collections::BTreeMap::new();
        if let Some(teams) = obj
            .get("team_scores")
            .or_else(|| obj.get("teams"))
            .and_then(|v| v.as_object())
        {
            for (team, score) in teams {
                let score = score.as_i64().ok_or_else(|| {
                    ExtractError::Unreadable(format!("non-numeric score for team {team}"))
                })?;
                team_scores.insert(team.clone(), score);
            }
        }

        // Player stats: nested object, or kills/deaths/assists at the root.
        let stats_obj = obj
            .get("player_stats")
            .and_then(|v| v.as_object())
            .unwrap_or(obj);
        let player_stats = PlayerStats {
            kills: read_count(stats_obj, "kills")?,
            deaths: read_count(stats_obj, "deaths")?,
            assists: read_count(stats_obj, "assists")?,
            placement: stats_obj
                .get("placement")
                .or_else(|| stats_obj.get("rank"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            player: stats_obj
                .get("player")
                .or_else(|| stats_obj.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_owned),
        };

        // Game info: nested object, or mode/map at the root.
        let info_obj = obj
            .get("game_info")
            .and_then(|v| v.as_object())
            .unwrap_or(obj);
        let game_info = GameInfo {
            mode: read_string(info_obj, "mode")?,
            map: read_string(info_obj, "map")?,
            player_team: info_obj
                .get("player_team")
                .or_else(|| info_obj.get("team"))
                .and_then(|v| v.as_str())
                .map(str::to_owned),
        };

        let stats = MatchStatistics {
            team_scores,
            player_stats,
            game_info,
        };
        stats.sanity_check()?;
        Ok(stats)
    }
}

impl StatsExtractor for ScoreboardJsonExtractor {
    async fn extract(&self, evidence: &[u8]) -> Result<MatchStatistics, ExtractError> {
        let text = std::str::from_utf8(evidence)
            .map_err(|_| ExtractError::Unreadable("evidence is not UTF-8 text".into()))?;
        let json = strip_fences(text);
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| ExtractError::Unreadable(format!("invalid JSON: {e}")))?;
        Self::normalize(&value)
    }
}

/// Pull JSON out of a markdown code fence, if the recognizer wrapped its
/// answer in one (possibly with prose around it).
fn strip_fences(text: &str) -> &str {
    if let Some(idx) = text.find("```json") {
        let rest = &text[idx + "```json".len()..];
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    text.trim()
}

fn read_count(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &'static str,
) -> Result<u32, ExtractError> {
    let value = obj.get(key).ok_or(ExtractError::MissingField(key))?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ExtractError::Unreadable(format!("{key} is not a non-negative integer")))
}

fn read_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &'static str,
) -> Result<String, ExtractError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or(ExtractError::MissingField(key))
}
