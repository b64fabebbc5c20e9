//! Nearest-neighbour matching of a live descriptor against the enrolled registry.

use crate::types::{Descriptor, RegistryEntry, StudentId};

/// Distance at which face-api descriptors separate same-identity from
/// different-identity pairs. Lower is stricter.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Display confidence for a match distance: `1 - distance`, clamped to [0, 1].
///
/// Purely presentational. Acceptance is decided on the raw distance alone.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// An accepted match.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub student_id: StudentId,
    pub distance: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Match),
    /// Nothing within the threshold. `nearest` is the best distance seen, if
    /// any comparable entry existed.
    NoMatch { nearest: Option<f32> },
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&Match> {
        match self {
            Self::Matched(m) => Some(m),
            Self::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a live descriptor against the registry.
pub trait Matcher {
    fn compare(&self, live: &Descriptor, registry: &[RegistryEntry], threshold: f32) -> MatchOutcome;
}

/// Euclidean nearest-neighbour matcher.
///
/// Scans every entry in registry order. The strictly smallest distance wins,
/// so on exact ties the earliest entry is kept. Entries whose descriptor
/// length differs from the live descriptor are skipped.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, live: &Descriptor, registry: &[RegistryEntry], threshold: f32) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, entry) in registry.iter().enumerate() {
            let Some(distance) = live.euclidean_distance(&entry.descriptor) else {
                skipped += 1;
                continue;
            };
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((i, distance));
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                live_len = live.len(),
                "registry entries with mismatched descriptor length ignored"
            );
        }

        match best {
            Some((idx, distance)) if distance <= threshold => MatchOutcome::Matched(Match {
                student_id: registry[idx].student_id.clone(),
                distance,
                confidence: confidence_from_distance(distance),
            }),
            Some((_, distance)) => MatchOutcome::NoMatch {
                nearest: Some(distance),
            },
            None => MatchOutcome::NoMatch { nearest: None },
        }
    }
}
