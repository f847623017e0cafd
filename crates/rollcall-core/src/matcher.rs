//! Nearest-within-tolerance identity matching.

use crate::provider::EmbeddingProvider;
use crate::types::{Embedding, GalleryEntry, Identity, MatchResult};

/// Index of the closest entry among those flagged within tolerance.
///
/// Exact ties resolve to the earliest entry in gallery order.
pub fn select_nearest(within: &[bool], distances: &[f32]) -> Option<usize> {
    within
        .iter()
        .zip(distances)
        .enumerate()
        .filter(|(_, (ok, _))| **ok)
        .fold(None, |best: Option<(usize, f32)>, (i, (_, &d))| match best {
            Some((_, best_d)) if best_d <= d => best,
            _ => Some((i, d)),
        })
        .map(|(i, _)| i)
}

/// Resolve the identity of `candidate` against every gallery entry.
///
/// Every entry is flagged through the provider's `compare` and measured
/// through its `distance`; the nearest flagged entry wins. An empty gallery or
/// no flagged entry yields [`Identity::Unmatched`].
pub fn identify<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    gallery: &[GalleryEntry],
    candidate: &Embedding,
    tolerance: f32,
) -> MatchResult {
    let within = provider.compare(gallery, candidate, tolerance);
    let distances: Vec<f32> = gallery
        .iter()
        .map(|entry| provider.distance(&entry.embedding, candidate))
        .collect();

    match select_nearest(&within, &distances) {
        Some(idx) => MatchResult {
            identity: Identity::Matched(gallery[idx].identity.clone()),
            distance: distances[idx],
            index: Some(idx),
        },
        None => MatchResult::unmatched(distances.iter().copied().fold(f32::INFINITY, f32::min)),
    }
}
