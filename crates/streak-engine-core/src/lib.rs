use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

pub mod chain;
pub mod memory;
pub mod period;
pub mod settlement;
pub mod store;

pub use chain::{advance, walk_chain, ChainState, ChainStep, TrackChainEngine};
pub use settlement::{
    provisional_score, ChallengeSettlement, SettlementFailure, SettlementJob, SettlementReport,
};
pub use store::{
    ChallengeStore, Clock, FixedClock, Repository, SystemClock, TrackStore, Transactor, UserStore,
};

/// Number of trailing periods during which a track may still be edited.
pub const DEFAULT_EDIT_WINDOW: u32 = 3;

/// Page size used when the settlement job walks all challenges.
pub const DEFAULT_SETTLEMENT_CHUNK_SIZE: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("date {date} is not aligned to the {period} period")]
    InvalidPeriodAlignment { date: Date, period: Period },
    #[error("unsupported period: {0}")]
    UnsupportedPeriod(Period),
    #[error("date arithmetic out of range: {date} shifted by {periods} periods")]
    DateOutOfRange { date: Date, periods: i64 },
    #[error("edit window closed for {date}; earliest editable date is {earliest}")]
    EditWindowClosed { date: Date, earliest: Date },
    #[error("storage failure during {operation}: {source}")]
    Storage {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl EngineError {
    pub fn storage(
        operation: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Storage { operation, source: source.into() }
    }

    /// Adapter for `map_err` on store calls.
    pub fn at(operation: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::storage(operation, source)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChallengeId(pub Ulid);

impl ChallengeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChallengeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ChallengeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChallengeId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrackId(pub Ulid);

impl TrackId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TrackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrackId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

/// How often a challenge expects a track.
///
/// Only [`Period::EveryDay`] has calendar support; the other kinds are
/// recognized so stored values round-trip, but calendar operations on them
/// fail with [`EngineError::UnsupportedPeriod`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    EveryDay,
    EveryWeek,
    EveryMonth,
}

impl Period {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EveryDay => "every_day",
            Self::EveryWeek => "every_week",
            Self::EveryMonth => "every_month",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "every_day" => Some(Self::EveryDay),
            "every_week" => Some(Self::EveryWeek),
            "every_month" => Some(Self::EveryMonth),
            _ => None,
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Challenge {
    pub id: ChallengeId,
    pub user_id: UserId,
    pub name: String,
    pub period: Period,
    /// Streak of the newest settled track, refreshed by settlement.
    pub last_series: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One period's completion record plus the chain values derived up to it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub challenge_id: ChallengeId,
    pub user_id: UserId,
    pub date: Date,
    pub done: bool,
    pub streak: i64,
    pub score: i64,
    pub daily_delta: i64,
    pub settled: bool,
}

impl Track {
    /// A not-yet-persisted `done=false` record for a calendar point with no input.
    #[must_use]
    pub fn placeholder(challenge_id: ChallengeId, user_id: UserId, date: Date) -> Self {
        Self {
            id: TrackId::new(),
            challenge_id,
            user_id,
            date,
            done: false,
            streak: 0,
            score: 0,
            daily_delta: 0,
            settled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    /// Permanent score; changes only through settlement increments.
    pub score: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserScores {
    pub user_id: UserId,
    pub permanent: i64,
    pub provisional: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub edit_window: u32,
    pub settlement_chunk_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            edit_window: DEFAULT_EDIT_WINDOW,
            settlement_chunk_size: DEFAULT_SETTLEMENT_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    /// Earliest date that is still editable as of `today` for `period`.
    ///
    /// Tracks dated strictly before this boundary are final and belong to settlement.
    ///
    /// # Errors
    /// Returns [`EngineError::UnsupportedPeriod`] for periods without calendar support.
    pub fn edit_boundary(&self, today: Date, period: Period) -> Result<Date, EngineError> {
        period::step_back(today, period, self.edit_window)
    }
}
