//! Track-chain recomputation.
//!
//! `streak`, `score` and `daily_delta` of a track are a prefix function of the
//! `done` flags before and at it, so an edit on day D rewrites every track from
//! D through today. The rewrite happens in one transaction together with the
//! reads it was computed from.

use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{debug, info};

use crate::period::{is_aligned, missing_dates, step_back};
use crate::store::{Clock, Repository, Transactor};
use crate::{ChallengeId, EngineError, Track};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainState {
    pub score: i64,
    pub streak: i64,
}

impl From<&Track> for ChainState {
    fn from(track: &Track) -> Self {
        Self { score: track.score, streak: track.streak }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainStep {
    pub state: ChainState,
    pub delta: i64,
}

/// One application of the recurrence.
///
/// A completed period adds one to both score and streak. A missed period
/// resets the streak and keeps a fifth of the score, rounded down.
#[must_use]
pub fn advance(state: ChainState, done: bool) -> ChainStep {
    let next = if done {
        ChainState {
            score: state.score.saturating_add(1),
            streak: state.streak.saturating_add(1),
        }
    } else {
        ChainState { score: state.score.div_euclid(5), streak: 0 }
    };
    ChainStep { state: next, delta: next.score - state.score }
}

/// Applies [`advance`] over `flags` starting from `seed`.
#[must_use]
pub fn replay(seed: ChainState, flags: &[bool]) -> Vec<ChainStep> {
    let mut state = seed;
    flags
        .iter()
        .map(|&done| {
            let step = advance(state, done);
            state = step.state;
            step
        })
        .collect()
}

/// Recomputes `points` (ascending, contiguous) from `seed`, overriding the
/// `done` flag of the point dated `edited` with `done`.
#[must_use]
pub fn walk_chain(seed: ChainState, points: Vec<Track>, edited: Date, done: bool) -> Vec<Track> {
    let mut state = seed;
    points
        .into_iter()
        .map(|mut track| {
            if track.date == edited {
                track.done = done;
            }
            let step = advance(state, track.done);
            track.score = step.state.score;
            track.streak = step.state.streak;
            track.daily_delta = step.delta;
            state = step.state;
            track
        })
        .collect()
}

pub struct TrackChainEngine<S, C> {
    store: S,
    clock: C,
}

impl<S: Transactor, C: Clock> TrackChainEngine<S, C> {
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Sets the `done` flag of `date` and rewrites the chain from there to today.
    ///
    /// Returns `Ok(false)` without writing when `date` is after today or the
    /// challenge does not exist. The caller is responsible for rejecting dates
    /// that are already settled.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidPeriodAlignment`] or
    /// [`EngineError::UnsupportedPeriod`] for dates the challenge calendar
    /// cannot place, and [`EngineError::Storage`] when any read or the bulk
    /// write fails. Nothing is persisted on error.
    pub fn recompute(
        &mut self,
        challenge_id: ChallengeId,
        date: Date,
        done: bool,
    ) -> Result<bool, EngineError> {
        let today = self.clock.today();
        if date > today {
            debug!(%challenge_id, %date, %today, "rejecting edit of a future date");
            return Ok(false);
        }

        let written = self.store.atomically("recompute", |repo| {
            recompute_window(repo, challenge_id, date, done, today)
        })?;

        match written {
            Some(count) => {
                info!(%challenge_id, %date, done, rewritten = count, "track chain recomputed");
                Ok(true)
            }
            None => {
                debug!(%challenge_id, %date, "challenge not found; nothing recomputed");
                Ok(false)
            }
        }
    }
}

fn recompute_window(
    repo: &mut dyn Repository,
    challenge_id: ChallengeId,
    date: Date,
    done: bool,
    today: Date,
) -> Result<Option<usize>, EngineError> {
    let Some(challenge) =
        repo.challenge_by_id(challenge_id).map_err(EngineError::at("challenge_by_id"))?
    else {
        return Ok(None);
    };
    if !is_aligned(date, challenge.period)? {
        return Err(EngineError::InvalidPeriodAlignment { date, period: challenge.period });
    }

    let anchor = repo.point_before(challenge_id, date).map_err(EngineError::at("point_before"))?;
    let (seed, since) = match anchor {
        Some(track) => (ChainState::from(&track), track.date),
        None => (ChainState::default(), step_back(date, challenge.period, 1)?),
    };

    let dates = missing_dates(since, today, challenge.period)?;
    let points = repo
        .points_in_range(challenge_id, challenge.user_id, &dates)
        .map_err(EngineError::at("points_in_range"))?;
    let chain = walk_chain(seed, points, date, done);

    repo.bulk_upsert(challenge_id, &chain).map_err(EngineError::at("bulk_upsert"))?;
    Ok(Some(chain.len()))
}
