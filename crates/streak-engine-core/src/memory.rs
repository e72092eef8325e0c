//! In-process store used by tests, benchmarks and replays.
//!
//! Transactions snapshot the whole state and restore it when the unit of work
//! fails or panics. [`MemoryStore::fail_next`] arms a one-shot failure for a named
//! operation; a failing `bulk_upsert` writes half of its input first so
//! rollback is observable.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, bail};
use time::Date;

use crate::store::{ChallengeStore, Repository, TrackStore, Transactor, UserStore};
use crate::{Challenge, ChallengeId, EngineError, Track, TrackId, User, UserId};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    challenges: BTreeMap<ChallengeId, Challenge>,
    deleted: BTreeSet<ChallengeId>,
    tracks: BTreeMap<(ChallengeId, Date), Track>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: MemoryState,
    fail_on: Option<&'static str>,
    writes: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&mut self, user: User) {
        self.state.users.insert(user.id, user);
    }

    pub fn insert_challenge(&mut self, challenge: Challenge) {
        self.state.challenges.insert(challenge.id, challenge);
    }

    pub fn soft_delete_challenge(&mut self, id: ChallengeId) {
        self.state.deleted.insert(id);
    }

    /// Every persisted track of a challenge, ascending by date.
    #[must_use]
    pub fn tracks(&self, challenge_id: ChallengeId) -> Vec<Track> {
        self.state
            .tracks
            .range((challenge_id, Date::MIN)..=(challenge_id, Date::MAX))
            .map(|(_, track)| track.clone())
            .collect()
    }

    /// Makes the next call of `operation` fail. `"commit"` fails the next
    /// transaction commit.
    pub fn fail_next(&mut self, operation: &'static str) {
        self.fail_on = Some(operation);
    }

    /// Number of write calls that reached the store, including rolled back ones.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn trip(&mut self, operation: &'static str) -> bool {
        if self.fail_on == Some(operation) {
            self.fail_on = None;
            return true;
        }
        false
    }

    fn is_live(&self, id: ChallengeId) -> bool {
        self.state.challenges.contains_key(&id) && !self.state.deleted.contains(&id)
    }

    fn upsert_one(&mut self, challenge_id: ChallengeId, track: &Track) {
        match self.state.tracks.entry((challenge_id, track.date)) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.user_id = track.user_id;
                existing.done = track.done;
                existing.streak = track.streak;
                existing.score = track.score;
                existing.daily_delta = track.daily_delta;
            }
            Entry::Vacant(entry) => {
                entry.insert(Track { challenge_id, ..track.clone() });
            }
        }
    }
}

impl TrackStore for MemoryStore {
    fn point_at(&self, challenge_id: ChallengeId, date: Date) -> anyhow::Result<Option<Track>> {
        Ok(self.state.tracks.get(&(challenge_id, date)).cloned())
    }

    fn point_before(
        &self,
        challenge_id: ChallengeId,
        date: Date,
    ) -> anyhow::Result<Option<Track>> {
        Ok(self
            .state
            .tracks
            .range((challenge_id, Date::MIN)..(challenge_id, date))
            .next_back()
            .map(|(_, track)| track.clone()))
    }

    fn points_in_range(
        &self,
        challenge_id: ChallengeId,
        user_id: UserId,
        dates: &[Date],
    ) -> anyhow::Result<Vec<Track>> {
        Ok(dates
            .iter()
            .map(|&date| {
                self.state
                    .tracks
                    .get(&(challenge_id, date))
                    .cloned()
                    .unwrap_or_else(|| Track::placeholder(challenge_id, user_id, date))
            })
            .collect())
    }

    fn points_between(
        &self,
        challenge_id: ChallengeId,
        from: Date,
        to: Date,
    ) -> anyhow::Result<Vec<Track>> {
        if to < from {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .tracks
            .range((challenge_id, from)..=(challenge_id, to))
            .map(|(_, track)| track.clone())
            .collect())
    }

    fn bulk_upsert(&mut self, challenge_id: ChallengeId, tracks: &[Track]) -> anyhow::Result<()> {
        self.writes += 1;
        let fail_at = self.trip("bulk_upsert").then_some(tracks.len() / 2);
        for (index, track) in tracks.iter().enumerate() {
            if fail_at == Some(index) {
                bail!("injected failure after {index} of {} rows", tracks.len());
            }
            self.upsert_one(challenge_id, track);
        }
        if fail_at.is_some() {
            bail!("injected failure after {} rows", tracks.len());
        }
        Ok(())
    }

    fn unsettled_before(
        &self,
        challenge_id: ChallengeId,
        date: Date,
    ) -> anyhow::Result<Vec<Track>> {
        Ok(self
            .state
            .tracks
            .range((challenge_id, Date::MIN)..(challenge_id, date))
            .map(|(_, track)| track)
            .filter(|track| !track.settled)
            .cloned()
            .collect())
    }

    fn mark_settled(&mut self, ids: &[TrackId]) -> anyhow::Result<()> {
        self.writes += 1;
        if self.trip("mark_settled") {
            bail!("injected mark_settled failure");
        }
        let ids = ids.iter().collect::<BTreeSet<_>>();
        for track in self.state.tracks.values_mut() {
            if ids.contains(&track.id) {
                track.settled = true;
            }
        }
        Ok(())
    }
}

impl ChallengeStore for MemoryStore {
    fn challenge_by_id(&self, id: ChallengeId) -> anyhow::Result<Option<Challenge>> {
        if !self.is_live(id) {
            return Ok(None);
        }
        Ok(self.state.challenges.get(&id).cloned())
    }

    fn challenges_page(&self, limit: u32, offset: u64) -> anyhow::Result<Vec<Challenge>> {
        let offset = usize::try_from(offset)?;
        let limit = usize::try_from(limit)?;
        Ok(self
            .state
            .challenges
            .values()
            .filter(|challenge| !self.state.deleted.contains(&challenge.id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn challenges_for_user(&self, user_id: UserId) -> anyhow::Result<Vec<Challenge>> {
        Ok(self
            .state
            .challenges
            .values()
            .filter(|challenge| {
                challenge.user_id == user_id && !self.state.deleted.contains(&challenge.id)
            })
            .cloned()
            .collect())
    }

    fn update_streak(&mut self, id: ChallengeId, streak: i64) -> anyhow::Result<()> {
        self.writes += 1;
        if self.trip("update_streak") {
            bail!("injected update_streak failure");
        }
        let challenge =
            self.state.challenges.get_mut(&id).ok_or_else(|| anyhow!("challenge {id} not found"))?;
        challenge.last_series = streak;
        Ok(())
    }
}

impl UserStore for MemoryStore {
    fn user_by_id(&self, id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.state.users.get(&id).cloned())
    }

    fn increment_score(&mut self, id: UserId, delta: i64) -> anyhow::Result<()> {
        self.writes += 1;
        if self.trip("increment_score") {
            bail!("injected increment_score failure");
        }
        let user = self.state.users.get_mut(&id).ok_or_else(|| anyhow!("user {id} not found"))?;
        user.score += delta;
        Ok(())
    }
}

impl Transactor for MemoryStore {
    fn atomically<T>(
        &mut self,
        operation: &'static str,
        work: impl FnOnce(&mut dyn Repository) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let snapshot = self.state.clone();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&mut *self))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                self.state = snapshot;
                panic::resume_unwind(payload);
            }
        };
        let outcome = outcome.and_then(|value| {
            if self.trip("commit") {
                return Err(EngineError::storage(operation, anyhow!("injected commit failure")));
            }
            Ok(value)
        });
        if outcome.is_err() {
            self.state = snapshot;
        }
        outcome
    }
}
