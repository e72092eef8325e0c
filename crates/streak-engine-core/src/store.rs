//! Persistence contracts consumed by the engine and the settlement job.
//!
//! Reads take `&self`, writes take `&mut self`. Every method returns
//! `anyhow::Result`; callers in this crate wrap failures with
//! [`EngineError::at`] so the failing operation is named.

use time::{Date, OffsetDateTime};

use crate::{Challenge, ChallengeId, EngineError, Track, TrackId, User, UserId};

pub trait TrackStore {
    /// Persisted track at exactly `date`.
    fn point_at(&self, challenge_id: ChallengeId, date: Date) -> anyhow::Result<Option<Track>>;

    /// Latest persisted track strictly before `date`.
    fn point_before(&self, challenge_id: ChallengeId, date: Date)
        -> anyhow::Result<Option<Track>>;

    /// One track per requested date, in the order given. Dates with no row come
    /// back as unsaved `done=false` placeholders owned by `user_id`.
    fn points_in_range(
        &self,
        challenge_id: ChallengeId,
        user_id: UserId,
        dates: &[Date],
    ) -> anyhow::Result<Vec<Track>>;

    /// Persisted tracks with `from <= date <= to`, ascending.
    fn points_between(
        &self,
        challenge_id: ChallengeId,
        from: Date,
        to: Date,
    ) -> anyhow::Result<Vec<Track>>;

    /// Insert or update by `(challenge_id, date)`. Existing rows keep their id
    /// and `settled` flag.
    fn bulk_upsert(&mut self, challenge_id: ChallengeId, tracks: &[Track]) -> anyhow::Result<()>;

    /// Unsettled tracks strictly before `date`, ascending.
    fn unsettled_before(&self, challenge_id: ChallengeId, date: Date)
        -> anyhow::Result<Vec<Track>>;

    fn mark_settled(&mut self, ids: &[TrackId]) -> anyhow::Result<()>;
}

pub trait ChallengeStore {
    /// Live (not soft-deleted) challenge by id.
    fn challenge_by_id(&self, id: ChallengeId) -> anyhow::Result<Option<Challenge>>;

    /// Live challenges ordered by id.
    fn challenges_page(&self, limit: u32, offset: u64) -> anyhow::Result<Vec<Challenge>>;

    fn challenges_for_user(&self, user_id: UserId) -> anyhow::Result<Vec<Challenge>>;

    fn update_streak(&mut self, id: ChallengeId, streak: i64) -> anyhow::Result<()>;
}

pub trait UserStore {
    fn user_by_id(&self, id: UserId) -> anyhow::Result<Option<User>>;

    /// Relative update of the permanent score.
    fn increment_score(&mut self, id: UserId, delta: i64) -> anyhow::Result<()>;
}

pub trait Repository: TrackStore + ChallengeStore + UserStore {}

impl<T> Repository for T where T: TrackStore + ChallengeStore + UserStore + ?Sized {}

/// Scoped atomic unit of work.
///
/// `work` sees a repository whose writes commit together when it returns `Ok`
/// and are discarded when it returns `Err` or unwinds.
pub trait Transactor: Repository {
    /// # Errors
    /// Returns the error produced by `work`, or [`EngineError::Storage`] tagged
    /// with `operation` when the transaction cannot begin or commit.
    fn atomically<T>(
        &mut self,
        operation: &'static str,
        work: impl FnOnce(&mut dyn Repository) -> Result<T, EngineError>,
    ) -> Result<T, EngineError>;
}

/// Source of "today" for window and future-date checks.
pub trait Clock {
    fn today(&self) -> Date;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> Date {
        crate::period::truncate_to_day(OffsetDateTime::now_utc())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FixedClock(pub Date);

impl Clock for FixedClock {
    fn today(&self) -> Date {
        self.0
    }
}
