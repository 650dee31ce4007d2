//! Spot zone weighting.
//!
//! Turns recent per-zone trouble (preemptions plus resource exhaustions)
//! into a probability distribution over candidate zones, then draws a zone
//! from it. A troubled zone is de-weighted rather than excluded, except by
//! the hard per-window cutoff, and even that is undone by the failsafe when
//! it would leave too few zones.
//!
//! # Algorithm
//!
//! ```text
//! zones    = zones with repeats dropped, first occurrence kept
//! keep     = zones with score <= MAX_PREEMPTIONS_PER_WINDOW
//! if keep is empty or (|zones| > 5 and |keep| < 3):
//!     keep = 3 lowest-scored zones of the original list (stable)
//! region   = zone minus its trailing "-<suffix>"
//! bias     = REGION_SCORES[region] or DEFAULT_REGION_SCORE,
//!            only if some kept zone is in REGION_SCORES, else 0
//! raw      = score + 1 + bias
//! adjusted = max(raw) / raw
//! weight   = round3(adjusted / sum(adjusted))
//! ```

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::Serialize;

/// Zones with more adverse events than this in the window are filtered out.
pub const MAX_PREEMPTIONS_PER_WINDOW: u32 = 10;

/// Default window over which adverse events are counted, in minutes.
pub const DEFAULT_SCORE_WINDOW_MINS: u64 = 60;

/// Number of zones kept by the failsafe.
pub const FAILSAFE_ZONE_COUNT: usize = 3;

/// Region penalty applied to regions outside [`REGION_SCORES`] once region
/// scoring is active.
pub const DEFAULT_REGION_SCORE: u32 = 5;

/// Regions that are markedly cheaper than the rest. All other regions are
/// penalized with [`DEFAULT_REGION_SCORE`].
pub const REGION_SCORES: &[(&str, u32)] = &[
    ("northamerica-northeast2", 0),
    ("europe-west2", 0),
    ("southamerica-east1", 0),
    ("asia-south2", 0),
];

/// Count of recent adverse events per zone. Missing zones count as 0.
pub type ZoneScores = BTreeMap<String, u32>;

/// Per-zone sum of two score maps.
pub fn merge_scores(preemptions: &ZoneScores, resource_exhaustions: &ZoneScores) -> ZoneScores {
    let mut merged = preemptions.clone();
    for (zone, count) in resource_exhaustions {
        let entry = merged.entry(zone.clone()).or_insert(0);
        *entry = entry.saturating_add(*count);
    }
    merged
}

/// Sum of every zone's score, saturating at `u32::MAX`.
pub fn total_score(scores: &ZoneScores) -> u32 {
    scores
        .values()
        .fold(0u32, |total, count| total.saturating_add(*count))
}

/// Region of a zone: the zone with its trailing `-<suffix>` removed.
pub fn region_of(zone: &str) -> &str {
    zone.rfind('-').map_or(zone, |idx| &zone[..idx])
}

fn region_score(region: &str) -> Option<u32> {
    REGION_SCORES
        .iter()
        .find(|(name, _)| *name == region)
        .map(|(_, score)| *score)
}

/// Probability of picking each zone, in walk order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZoneWeighting(Vec<(String, f64)>);

impl ZoneWeighting {
    pub fn get(&self, zone: &str) -> Option<f64> {
        self.0.iter().find(|(z, _)| z == zone).map(|(_, w)| *w)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(z, w)| (z.as_str(), *w))
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(z, _)| z.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for ZoneWeighting {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for ZoneWeighting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (zone, weight)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "[{zone}:{weight}]")?;
        }
        Ok(())
    }
}

/// Compute the weighting over `zones` given per-zone scores.
///
/// The result covers exactly the zones that survive filtering; weights are
/// rounded to three decimals and need not sum to exactly 1.
pub fn compute_weighting(zones: &[String], scores: &ZoneScores) -> ZoneWeighting {
    let score = |zone: &str| scores.get(zone).copied().unwrap_or(0);

    let mut seen = HashSet::new();
    let zones: Vec<&str> = zones
        .iter()
        .map(String::as_str)
        .filter(|zone| seen.insert(*zone))
        .collect();

    let mut kept: Vec<&str> = zones
        .iter()
        .copied()
        .filter(|zone| score(zone) <= MAX_PREEMPTIONS_PER_WINDOW)
        .collect();

    if kept.is_empty() || (zones.len() > 5 && kept.len() < FAILSAFE_ZONE_COUNT) {
        let mut ranked = zones.clone();
        // sort_by_key is stable: ties keep their configured order.
        ranked.sort_by_key(|zone| score(zone));
        ranked.truncate(FAILSAFE_ZONE_COUNT);
        kept = ranked;
    }

    let use_region_scores = kept
        .iter()
        .any(|zone| region_score(region_of(zone)).is_some());

    let raw: Vec<(&str, f64)> = kept
        .iter()
        .map(|zone| {
            let bias = if use_region_scores {
                region_score(region_of(zone)).unwrap_or(DEFAULT_REGION_SCORE)
            } else {
                0
            };
            (*zone, f64::from(score(zone)) + 1.0 + f64::from(bias))
        })
        .collect();

    let max = raw.iter().map(|(_, s)| *s).fold(0.0, f64::max);
    let adjusted: Vec<(&str, f64)> = raw.iter().map(|(z, s)| (*z, max / s)).collect();
    let total: f64 = adjusted.iter().map(|(_, a)| a).sum();

    adjusted
        .into_iter()
        .map(|(zone, a)| (zone.to_string(), round3(a / total)))
        .collect()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Pick a zone for the draw `r` in `[0, 1)`.
///
/// Walks the weighting accumulating a running sum and returns the first zone
/// where the sum reaches `r`. If rounding leaves the total short of `r`, the
/// last zone is returned.
pub fn pick_zone_with(weighting: &ZoneWeighting, r: f64) -> Option<&str> {
    let mut sum = 0.0;
    for (zone, weight) in weighting.iter() {
        sum += weight;
        if sum >= r {
            return Some(zone);
        }
    }
    weighting.zones().last()
}

/// Pick a zone using the supplied random source.
pub fn pick_zone_from<'a, R: Rng + ?Sized>(
    weighting: &'a ZoneWeighting,
    rng: &mut R,
) -> Option<&'a str> {
    pick_zone_with(weighting, rng.random::<f64>())
}

/// Pick a zone using the thread-local random source.
pub fn pick_zone(weighting: &ZoneWeighting) -> Option<&str> {
    pick_zone_from(weighting, &mut rand::rng())
}
