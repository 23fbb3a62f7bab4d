//! Match Statistics
//!
//! Structured statistics produced by the stats extraction port, plus the
//! sanity filter applied before any condition is evaluated. Extractors are
//! untrusted: everything here assumes the numbers may be hallucinated and
//! bounds-checks them accordingly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for plausible kills in a single match.
pub const MAX_KILLS: u32 = 100;
/// Upper bound for plausible deaths in a single match.
pub const MAX_DEATHS: u32 = 100;
/// Upper bound for plausible assists in a single match.
pub const MAX_ASSISTS: u32 = 50;

/// Statistics extracted from match evidence.
///
/// This is the exact shape every extractor implementation must normalize
/// into, regardless of what the upstream recognizer returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStatistics {
    /// Team name -> final score.
    #[serde(default)]
    pub team_scores: BTreeMap<String, i64>,
    /// Stats for the player the evidence belongs to.
    pub player_stats: PlayerStats,
    /// Match metadata.
    pub game_info: GameInfo,
}

/// Per-player performance numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    /// Eliminations scored.
    pub kills: u32,
    /// Times eliminated.
    pub deaths: u32,
    /// Assists.
    pub assists: u32,
    /// Final placement (1-based), if the mode has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<u32>,
    /// Gamertag the scoreboard attributes these stats to, if legible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
}

/// Match metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    /// Game mode (e.g. "Team Deathmatch").
    pub mode: String,
    /// Map name.
    pub map: String,
    /// Team the player was on, when identifiable from the scoreboard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_team: Option<String>,
}

/// A statistics value that fails the sanity filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityViolation {
    /// A numeric stat is outside its plausible range.
    #[error("{field} value {value} outside plausible range 0..={max}")]
    OutOfRange {
        /// Which stat.
        field: &'static str,
        /// Reported value.
        value: i64,
        /// Allowed maximum.
        max: i64,
    },
    /// A team score is negative.
    #[error("negative score {score} for team {team}")]
    NegativeTeamScore {
        /// Team name.
        team: String,
        /// Reported score.
        score: i64,
    },
    /// A required text field is empty.
    #[error("required field {0} is empty")]
    EmptyField(&'static str),
}

impl MatchStatistics {
    /// Run the sanity filter: required fields present, all values within
    /// plausible bounds. Called before statistics reach the evaluator.
    pub fn sanity_check(&self) -> Result<(), SanityViolation> {
        let p = &self.player_stats;
        if p.kills > MAX_KILLS {
            return Err(SanityViolation::OutOfRange {
                field: "kills",
                value: p.kills as i64,
                max: MAX_KILLS as i64,
            });
        }
        if p.deaths > MAX_DEATHS {
            return Err(SanityViolation::OutOfRange {
                field: "deaths",
                value: p.deaths as i64,
                max: MAX_DEATHS as i64,
            });
        }
        if p.assists > MAX_ASSISTS {
            return Err(SanityViolation::OutOfRange {
                field: "assists",
                value: p.assists as i64,
                max: MAX_ASSISTS as i64,
            });
        }
        if let Some(placement) = p.placement {
            if placement == 0 {
                return Err(SanityViolation::OutOfRange {
                    field: "placement",
                    value: 0,
                    max: u32::MAX as i64,
                });
            }
        }
        for (team, score) in &self.team_scores {
            if *score < 0 {
                return Err(SanityViolation::NegativeTeamScore {
                    team: team.clone(),
                    score: *score,
                });
            }
        }
        if self.game_info.mode.is_empty() {
            return Err(SanityViolation::EmptyField("game_info.mode"));
        }
        if self.game_info.map.is_empty() {
            return Err(SanityViolation::EmptyField("game_info.map"));
        }
        Ok(())
    }

    /// Kill/death ratio, with deaths clamped to at least 1.
    pub fn kd_ratio(&self) -> f64 {
        let deaths = self.player_stats.deaths.max(1);
        self.player_stats.kills as f64 / deaths as f64
    }

    /// Score of the player's own team, when the scoreboard identifies it.
    pub fn own_team_score(&self) -> Option<i64> {
        let team = self.game_info.player_team.as_ref()?;
        self.team_scores.get(team).copied()
    }
}
