use crate::core::recognizer::euclidean_distance;
use crate::storage::CatalogEntry;

/// Distance at or below which a probe is accepted as the catalog identity.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub person_id: String,
    pub name: String,
    pub distance: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Match),
    NoMatch,
}

/// Nearest neighbour by Euclidean distance over a linear scan of `catalog`.
///
/// The first entry at the minimum distance wins, so the result only depends
/// on catalog order. An empty catalog, or a nearest entry farther than
/// `threshold`, yields [`MatchOutcome::NoMatch`]. Entries whose length
/// differs from the input vector's are never candidates.
pub fn match_probe(probe: &[f32], catalog: &[CatalogEntry], threshold: f32) -> MatchOutcome {
    let mut best: Option<(&CatalogEntry, f32)> = None;

    for entry in catalog {
        if entry.vector.len() != probe.len() {
            tracing::warn!(
                person_id = %entry.person_id,
                stored = entry.vector.len(),
                expected = probe.len(),
                "skipping embedding with mismatched length"
            );
            continue;
        }
        let distance = euclidean_distance(probe, &entry.vector);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((entry, distance)),
        }
    }

    match best {
        Some((entry, distance)) if distance <= threshold => MatchOutcome::Matched(Match {
            person_id: entry.person_id.clone(),
            name: entry.name.clone(),
            distance,
            confidence: (1.0 - distance).max(0.0),
        }),
        _ => MatchOutcome::NoMatch,
    }
}
