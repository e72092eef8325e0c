//! Settlement: folds the deltas of tracks that left the edit window into the
//! owner's permanent score.

use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{debug, info, warn};

use crate::store::{Clock, Repository, Transactor};
use crate::{Challenge, ChallengeId, EngineConfig, EngineError, TrackId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChallengeSettlement {
    pub challenge_id: ChallengeId,
    pub user_id: UserId,
    /// Tracks strictly before this date were considered.
    pub boundary: Date,
    pub settled_tracks: usize,
    pub score_increment: i64,
    pub last_series: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SettlementFailure {
    pub challenge_id: ChallengeId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SettlementReport {
    pub challenges_seen: u64,
    pub settled: Vec<ChallengeSettlement>,
    pub failures: Vec<SettlementFailure>,
}

impl SettlementReport {
    #[must_use]
    pub fn total_increment(&self) -> i64 {
        self.settled.iter().map(|item| item.score_increment).sum()
    }
}

pub struct SettlementJob<S, C> {
    store: S,
    clock: C,
    config: EngineConfig,
}

impl<S: Transactor, C: Clock> SettlementJob<S, C> {
    pub fn new(store: S, clock: C, config: EngineConfig) -> Self {
        Self { store, clock, config }
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

    /// Settles every live challenge, one transaction each.
    ///
    /// A challenge whose settlement fails is recorded in
    /// [`SettlementReport::failures`] and the walk continues.
    ///
    /// # Errors
    /// Returns [`EngineError::Storage`] only when a page of challenges cannot be listed.
    pub fn run(&mut self) -> Result<SettlementReport, EngineError> {
        let today = self.clock.today();
        let limit = self.config.settlement_chunk_size.max(1);
        let mut report = SettlementReport::default();
        let mut offset = 0_u64;

        loop {
            let page = self
                .store
                .challenges_page(limit, offset)
                .map_err(EngineError::at("challenges_page"))?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;

            for challenge in &page {
                report.challenges_seen += 1;
                match self.settle_challenge(challenge, today) {
                    Ok(settled) => report.settled.push(settled),
                    Err(err) => {
                        warn!(
                            challenge_id = %challenge.id,
                            user_id = %challenge.user_id,
                            error = %err,
                            "challenge settlement failed"
                        );
                        report.failures.push(SettlementFailure {
                            challenge_id: challenge.id,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            challenges = report.challenges_seen,
            settled = report.settled.len(),
            failed = report.failures.len(),
            increment = report.total_increment(),
            "settlement run finished"
        );
        Ok(report)
    }

    /// Settles one challenge as of `today`.
    ///
    /// # Errors
    /// Returns the calendar error for unsupported periods and
    /// [`EngineError::Storage`] when any read or write fails; in that case
    /// nothing is written.
    pub fn settle_challenge(
        &mut self,
        challenge: &Challenge,
        today: Date,
    ) -> Result<ChallengeSettlement, EngineError> {
        let boundary = self.config.edit_boundary(today, challenge.period)?;
        let settlement = self
            .store
            .atomically("settle_challenge", |repo| settle_before(repo, challenge, boundary))?;
        debug!(
            challenge_id = %challenge.id,
            %boundary,
            tracks = settlement.settled_tracks,
            increment = settlement.score_increment,
            last_series = settlement.last_series,
            "challenge settled"
        );
        Ok(settlement)
    }
}

fn settle_before(
    repo: &mut dyn Repository,
    challenge: &Challenge,
    boundary: Date,
) -> Result<ChallengeSettlement, EngineError> {
    let pending =
        repo.unsettled_before(challenge.id, boundary).map_err(EngineError::at("unsettled_before"))?;
    let score_increment = pending.iter().map(|track| track.daily_delta).sum::<i64>();
    let ids = pending.iter().map(|track| track.id).collect::<Vec<TrackId>>();
    let last_series = repo
        .point_before(challenge.id, boundary)
        .map_err(EngineError::at("point_before"))?
        .map_or(0, |track| track.streak);

    repo.increment_score(challenge.user_id, score_increment)
        .map_err(EngineError::at("increment_score"))?;
    repo.mark_settled(&ids).map_err(EngineError::at("mark_settled"))?;
    repo.update_streak(challenge.id, last_series).map_err(EngineError::at("update_streak"))?;

    Ok(ChallengeSettlement {
        challenge_id: challenge.id,
        user_id: challenge.user_id,
        boundary,
        settled_tracks: ids.len(),
        score_increment,
        last_series,
    })
}

/// Score the user has earned but not yet settled.
///
/// Sums `daily_delta` of unsettled tracks across the user's live challenges,
/// leaving out each chain's trailing run of missed days, which may still be
/// filled in.
///
/// # Errors
/// Returns [`EngineError::Storage`] when a read fails.
pub fn provisional_score<R>(repo: &R, user_id: UserId) -> Result<i64, EngineError>
where
    R: Repository + ?Sized,
{
    let challenges =
        repo.challenges_for_user(user_id).map_err(EngineError::at("challenges_for_user"))?;
    let mut total = 0_i64;
    for challenge in challenges {
        let pending = repo
            .unsettled_before(challenge.id, Date::MAX)
            .map_err(EngineError::at("unsettled_before"))?;
        let counted = pending.iter().rposition(|track| track.done).map_or(0, |last| last + 1);
        total += pending[..counted].iter().map(|track| track.daily_delta).sum::<i64>();
    }
    Ok(total)
}
