use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::ArticleProjection;
use crate::tag::{importance_contribution, TagSignal, TagSignals};

pub const DEFAULT_HALF_LIFE_HOURS: f64 = 24.0;
pub const DEFAULT_BLOCK_HOURS: i64 = 24;

const WEIGHT_TAGS: f64 = 0.4;
const WEIGHT_RECENCY: f64 = 0.4;
const WEIGHT_DESCRIPTION: f64 = 0.2;

const DESCRIPTION_IDEAL_MIN: usize = 80;
const DESCRIPTION_IDEAL_MAX: usize = 300;
const SHORT_DESCRIPTION_CEILING: f64 = 0.7;
const LONG_DESCRIPTION_SCALE: f64 = 400.0;

/// How candidates are put in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingPolicy {
    /// Weighted blend of tag importance, recency and description length
    #[default]
    Scored,
    /// Fixed-width age blocks, ordinal priority inside each block
    PriorityBlocks,
}

#[derive(Debug, Clone)]
pub struct RankingEngine {
    policy: RankingPolicy,
    half_life_hours: f64,
    block: Duration,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self {
            policy: RankingPolicy::Scored,
            half_life_hours: DEFAULT_HALF_LIFE_HOURS,
            block: Duration::hours(DEFAULT_BLOCK_HOURS),
        }
    }
}

impl RankingEngine {
    pub fn new(policy: RankingPolicy, half_life_hours: f64, block_hours: i64) -> Self {
        Self {
            policy,
            half_life_hours,
            block: Duration::hours(block_hours.max(1)),
        }
    }

    pub fn rank(&self, candidates: Vec<ArticleProjection>, signals: &TagSignals) -> Vec<ArticleProjection> {
        self.rank_at(candidates, signals, Utc::now())
    }

    /// Total, deterministic order of `candidates` as seen at `now`.
    ///
    /// Candidates missing from `signals` rank as if they had no tags.
    pub fn rank_at(
        &self,
        candidates: Vec<ArticleProjection>,
        signals: &TagSignals,
        now: DateTime<Utc>,
    ) -> Vec<ArticleProjection> {
        if candidates.is_empty() {
            return candidates;
        }
        debug!(
            "Ranking {} candidates with {:?} policy",
            candidates.len(),
            self.policy
        );
        match self.policy {
            RankingPolicy::Scored => self.rank_scored(candidates, signals, now),
            RankingPolicy::PriorityBlocks => self.rank_blocks(candidates, now),
        }
    }

    pub fn score(
        &self,
        candidate: &ArticleProjection,
        signals: Option<&[TagSignal]>,
        now: DateTime<Utc>,
    ) -> f64 {
        let tags = tag_score(signals.unwrap_or_default());
        let recency = recency_score(age_hours(candidate.published_at, now), self.half_life_hours);
        let description = description_score(candidate.description_len);

        WEIGHT_TAGS * tags + WEIGHT_RECENCY * recency + WEIGHT_DESCRIPTION * description
    }

    fn rank_scored(
        &self,
        candidates: Vec<ArticleProjection>,
        signals: &TagSignals,
        now: DateTime<Utc>,
    ) -> Vec<ArticleProjection> {
        let mut scored: Vec<(f64, ArticleProjection)> = candidates
            .into_iter()
            .map(|candidate| {
                let tags = signals.get(&candidate.id).map(Vec::as_slice);
                (self.score(&candidate, tags, now), candidate)
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| newest_then_largest_id(a, b))
        });

        scored.into_iter().map(|(_, candidate)| candidate).collect()
    }

    fn rank_blocks(&self, candidates: Vec<ArticleProjection>, now: DateTime<Utc>) -> Vec<ArticleProjection> {
        let block_ms = self.block.num_milliseconds().max(1);
        let mut keyed: Vec<(i64, ArticleProjection)> = candidates
            .into_iter()
            .map(|candidate| {
                let age_ms = (now - candidate.published_at).num_milliseconds().max(0);
                (age_ms / block_ms, candidate)
            })
            .collect();

        keyed.sort_by(|(block_a, a), (block_b, b)| {
            block_a
                .cmp(block_b)
                .then_with(|| priority_rank(a).cmp(&priority_rank(b)))
                .then_with(|| newest_then_largest_id(a, b))
        });

        keyed.into_iter().map(|(_, candidate)| candidate).collect()
    }
}

/// Known priorities first, ascending; unknown last.
fn priority_rank(candidate: &ArticleProjection) -> (bool, u8) {
    match candidate.priority {
        Some(priority) => (false, priority.get()),
        None => (true, 0),
    }
}

fn newest_then_largest_id(a: &ArticleProjection, b: &ArticleProjection) -> Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Hours since publication, never negative.
pub fn age_hours(published_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - published_at).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}

/// Saturates quickly: a handful of important tags is as good as many.
pub fn tag_score(signals: &[TagSignal]) -> f64 {
    importance_contribution(signals).tanh()
}

pub fn recency_score(age_hours: f64, half_life_hours: f64) -> f64 {
    (-age_hours.max(0.0) / half_life_hours).exp()
}

/// Rewards medium-length descriptions, penalises stubs and walls of text.
pub fn description_score(len: usize) -> f64 {
    if len < DESCRIPTION_IDEAL_MIN {
        (len as f64 / DESCRIPTION_IDEAL_MIN as f64) * SHORT_DESCRIPTION_CEILING
    } else if len <= DESCRIPTION_IDEAL_MAX {
        1.0
    } else {
        let overflow = (len - DESCRIPTION_IDEAL_MAX) as f64;
        1.0 / (1.0 + overflow / LONG_DESCRIPTION_SCALE)
    }
}
