//! Identity matching: rank known people against a query embedding.
//!
//! A person is scored by the **best** of their stored embeddings, not the
//! average — one great sample should not be dragged down by older poor
//! ones. The whole gallery is always traversed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Embedding, PersonId};

/// Similarity at or above which a match is rendered as high confidence.
pub const HIGH_CONFIDENCE: f32 = 0.85;
/// Similarity at or above which a match is rendered as ambiguous.
pub const AMBIGUOUS_CONFIDENCE: f32 = 0.70;
/// Score bonus for people already confirmed present in the session.
pub const DEFAULT_BOOST_BONUS: f32 = 0.05;

/// Discretized match confidence, used for UI-facing coloring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    None,
    Ambiguous,
    High,
}

impl Confidence {
    pub fn from_score(score: f32) -> Self {
        if score >= HIGH_CONFIDENCE {
            Confidence::High
        } else if score >= AMBIGUOUS_CONFIDENCE {
            Confidence::Ambiguous
        } else {
            Confidence::None
        }
    }
}

/// One person's stored embeddings, as loaded from the identity store.
#[derive(Debug, Clone)]
pub struct GalleryPerson {
    pub person_id: PersonId,
    pub embeddings: Vec<Embedding>,
}

/// Caller-supplied matching policy.
#[derive(Debug, Clone)]
pub struct MatchParams {
    /// Candidates scoring below this are discarded. 0.5 for suggestion
    /// contexts; auto-accept uses its own, higher threshold.
    pub threshold: f32,
    pub top_k: usize,
    /// People already confirmed present nearby; their score gets
    /// `boost_bonus` added (capped at 1.0) before ranking.
    pub boost: HashSet<PersonId>,
    pub boost_bonus: f32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            top_k: 5,
            boost: HashSet::new(),
            boost_bonus: DEFAULT_BOOST_BONUS,
        }
    }
}

/// A ranked match candidate. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub person_id: PersonId,
    /// Final score in [0, 1] (boost included).
    pub score: f32,
    pub confidence: Confidence,
}

/// Rank gallery people by best-case similarity to `query`.
///
/// Deterministic given the same gallery ordering; ties keep gallery order.
pub fn find_matches(
    query: &Embedding,
    gallery: &[GalleryPerson],
    params: &MatchParams,
) -> Vec<MatchResult> {
    let mut results: Vec<MatchResult> = Vec::new();

    for person in gallery {
        let best = person
            .embeddings
            .iter()
            .map(|e| query.similarity(e))
            .fold(f32::NEG_INFINITY, f32::max);

        if best == f32::NEG_INFINITY || best < params.threshold {
            continue;
        }

        let score = if params.boost.contains(&person.person_id) {
            (best + params.boost_bonus).min(1.0)
        } else {
            best
        };

        results.push(MatchResult {
            person_id: person.person_id,
            score,
            confidence: Confidence::from_score(score),
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(params.top_k);
    results
}
