use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use streak_engine_core::period::{backward_list, month_bounds};
use streak_engine_core::store::{ChallengeStore, TrackStore, UserStore};
use streak_engine_core::{
    provisional_score, Challenge, ChallengeId, Clock, EngineConfig, EngineError, Period,
    SettlementJob, SettlementReport, SystemClock, Track, TrackChainEngine, User, UserId,
    UserScores,
};
use streak_engine_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use time::{Date, OffsetDateTime};
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterChallengeRequest {
    pub user_id: UserId,
    pub name: String,
    #[serde(default = "default_period")]
    pub period: Period,
}

fn default_period() -> Period {
    Period::EveryDay
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackDayRequest {
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    pub date: Date,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackDayStatus {
    Applied,
    Rejected,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackDayResult {
    pub status: TrackDayStatus,
    pub last_series: Option<i64>,
    pub provisional_score: Option<i64>,
}

impl TrackDayResult {
    fn without_change(status: TrackDayStatus) -> Self {
        Self { status, last_series: None, provisional_score: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecomputeRequest {
    pub challenge_id: ChallengeId,
    pub date: Date,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecomputeResult {
    pub applied: bool,
}

/// Synchronous facade over the SQLite store and the engine.
///
/// Each call opens its own connection and brings the schema up to date first,
/// so handles are cheap to clone across threads.
#[derive(Debug, Clone)]
pub struct StreakApi<C = SystemClock> {
    db_path: PathBuf,
    clock: C,
    config: EngineConfig,
}

impl StreakApi<SystemClock> {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_clock(db_path, SystemClock)
    }
}

impl<C: Clock + Copy> StreakApi<C> {
    #[must_use]
    pub fn with_clock(db_path: PathBuf, clock: C) -> Self {
        Self { db_path, clock, config: EngineConfig::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// SQLite health checks plus the settled-prefix check on every chain.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the user id is already taken or persistence fails.
    pub fn register_user(&self, input: RegisterUserRequest) -> Result<User> {
        let mut store = self.open_migrated()?;
        let user = User {
            id: input.user_id.unwrap_or_default(),
            score: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_user(&user)?;
        Ok(user)
    }

    /// Returns `None` when the owner does not exist.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn register_challenge(
        &self,
        input: RegisterChallengeRequest,
    ) -> Result<Option<Challenge>> {
        let mut store = self.open_migrated()?;
        if store.user_by_id(input.user_id)?.is_none() {
            return Ok(None);
        }
        let challenge = Challenge {
            id: ChallengeId::new(),
            user_id: input.user_id,
            name: input.name,
            period: input.period,
            last_series: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_challenge(&challenge)?;
        Ok(Some(challenge))
    }

    /// Record a user's completion flag for one day, guarded by ownership and
    /// the edit window.
    ///
    /// # Errors
    /// Returns [`EngineError::EditWindowClosed`] for dates before the window,
    /// and any engine or storage error from the recompute.
    pub fn track_day(&self, input: TrackDayRequest) -> Result<TrackDayResult> {
        let store = self.open_migrated()?;
        let challenge = match store.challenge_by_id(input.challenge_id)? {
            Some(challenge) if challenge.user_id == input.user_id => challenge,
            _ => return Ok(TrackDayResult::without_change(TrackDayStatus::NotFound)),
        };

        let today = self.clock.today();
        self.ensure_editable(&store, &challenge, input.date, today)?;
        if input.date > today {
            debug!(challenge_id = %challenge.id, date = %input.date, "future track rejected");
            return Ok(TrackDayResult::without_change(TrackDayStatus::Rejected));
        }

        let mut engine = TrackChainEngine::new(store, self.clock);
        if !engine.recompute(challenge.id, input.date, input.done)? {
            return Ok(TrackDayResult::without_change(TrackDayStatus::Rejected));
        }

        let store = engine.into_store();
        let last_series =
            store.challenge_by_id(challenge.id)?.map_or(challenge.last_series, |c| c.last_series);
        let provisional = provisional_score(&store, challenge.user_id)?;
        Ok(TrackDayResult {
            status: TrackDayStatus::Applied,
            last_series: Some(last_series),
            provisional_score: Some(provisional),
        })
    }

    /// Engine entry point without the ownership check. The edit window and
    /// settled tracks are still enforced.
    ///
    /// # Errors
    /// Returns [`EngineError::EditWindowClosed`] for closed or settled dates,
    /// and any engine or storage error from the recompute.
    pub fn recompute(&self, input: RecomputeRequest) -> Result<RecomputeResult> {
        let store = self.open_migrated()?;
        let Some(challenge) = store.challenge_by_id(input.challenge_id)? else {
            return Ok(RecomputeResult { applied: false });
        };
        self.ensure_editable(&store, &challenge, input.date, self.clock.today())?;
        let mut engine = TrackChainEngine::new(store, self.clock);
        let applied = engine.recompute(input.challenge_id, input.date, input.done)?;
        Ok(RecomputeResult { applied })
    }

    /// Rejects edits before the window boundary, and edits that would rewrite a
    /// settled track. A recompute of `date` rewrites every track in `[date, today]`,
    /// so a settled track anywhere in that range closes `date`. That range can
    /// hold settled tracks when the window was widened after a settlement run.
    fn ensure_editable(
        &self,
        store: &SqliteStore,
        challenge: &Challenge,
        date: Date,
        today: Date,
    ) -> Result<()> {
        let boundary = self.config.edit_boundary(today, challenge.period)?;
        let last_settled = store
            .points_between(challenge.id, date, today)?
            .iter()
            .filter(|track| track.settled)
            .map(|track| track.date)
            .max();
        if date >= boundary && last_settled.is_none() {
            return Ok(());
        }
        let earliest =
            last_settled.and_then(Date::next_day).map_or(boundary, |day| day.max(boundary));
        debug!(challenge_id = %challenge.id, %date, %earliest, "edit of a closed date rejected");
        Err(EngineError::EditWindowClosed { date, earliest }.into())
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or challenges cannot be listed.
    pub fn run_settlement(&self) -> Result<SettlementReport> {
        let store = self.open_migrated()?;
        let mut job = SettlementJob::new(store, self.clock, self.config);
        Ok(job.run()?)
    }

    /// The last `n` days of a challenge ending today, oldest first. Days without
    /// a stored track appear as unsaved `done=false` placeholders.
    ///
    /// # Errors
    /// Returns an error when the calendar or the store fails.
    pub fn recent_tracks(&self, challenge_id: ChallengeId, n: u32) -> Result<Option<Vec<Track>>> {
        let store = self.open_migrated()?;
        let Some(challenge) = store.challenge_by_id(challenge_id)? else {
            return Ok(None);
        };
        let dates = backward_list(self.clock.today(), challenge.period, n)?;
        let tracks = store.points_in_range(challenge.id, challenge.user_id, &dates)?;
        Ok(Some(tracks))
    }

    /// Stored tracks of the calendar month containing `date`, for the owner only.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn month_tracks(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        date: Date,
    ) -> Result<Option<Vec<Track>>> {
        let store = self.open_migrated()?;
        match store.challenge_by_id(challenge_id)? {
            Some(challenge) if challenge.user_id == user_id => {
                let (first, last) = month_bounds(date);
                Ok(Some(store.points_between(challenge.id, first, last)?))
            }
            _ => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the store fails.
    pub fn user_scores(&self, user_id: UserId) -> Result<Option<UserScores>> {
        let store = self.open_migrated()?;
        let Some(user) = store.user_by_id(user_id)? else {
            return Ok(None);
        };
        let provisional = provisional_score(&store, user.id)?;
        Ok(Some(UserScores { user_id: user.id, permanent: user.score, provisional }))
    }
}
