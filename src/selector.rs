//! Variant selection and deduplication
//!
//! [`select`] is a pure function over a list of candidate [`Variant`]s:
//! filter by size, group by resolution label, reduce each group per the
//! dedup strategy, restrict to a target resolution, then narrow to a
//! single candidate unless the policy keeps all survivors. Deterministic
//! for identical inputs; ties always keep the first-encountered variant.

use crate::error::SelectionError;
use crate::metadata::Variant;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// How to reduce several candidates that share a resolution label
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Keep the candidate with the highest bitrate
    HighestBitrate,
    /// Keep the candidate with the lowest bitrate
    LowestBitrate,
    /// Keep the candidate with the largest known size
    LargestSize,
    /// Keep the candidate with the smallest known size
    SmallestSize,
    /// Keep every candidate (default)
    #[default]
    None,
}

/// Policy driving [`select`]
///
/// Maps 1:1 onto the CLI surface of a consuming application
/// (min-size/max-size/dedup-strategy/resolution/all flags).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Inclusive lower bound on known sizes; variants with unknown size
    /// always survive (fail-open, size can't be verified without fetching)
    #[serde(default)]
    pub min_size_bytes: Option<u64>,

    /// Inclusive upper bound on known sizes
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Per-label reduction strategy
    #[serde(default)]
    pub dedup: DedupStrategy,

    /// Restrict output to this resolution label, or the nearest available
    /// one by parsed height when no exact match exists
    #[serde(default)]
    pub target_resolution: Option<String>,

    /// Keep every surviving variant (one per distinct label after dedup)
    /// instead of narrowing to a single best candidate
    #[serde(default)]
    pub select_all: bool,
}

/// Select variants according to the policy
///
/// Pure and deterministic: no side effects, identical inputs produce
/// identical outputs. Steps, in order:
///
/// 1. drop variants whose *known* size falls outside
///    `[min_size_bytes, max_size_bytes]`
/// 2. group survivors by `label` in first-encounter order
/// 3. reduce each group per [`DedupStrategy`] (ties keep the first)
/// 4. restrict to `target_resolution` (exact label, else nearest parsed
///    height; an unparseable target falls back to exact-match-only)
/// 5. unless `select_all`, narrow to the highest-resolution group; a group
///    that still holds several candidates is [`SelectionError::Ambiguous`]
///
/// # Errors
///
/// [`SelectionError::NotFound`] when nothing survives,
/// [`SelectionError::Ambiguous`] when exactly one variant was requested but
/// no policy resolves the tie.
pub fn select(
    variants: &[Variant],
    policy: &SelectionPolicy,
) -> std::result::Result<Vec<Variant>, SelectionError> {
    // 1. Size filter — unknown sizes are never dropped here
    let surviving: Vec<&Variant> = variants
        .iter()
        .filter(|v| match v.size_bytes {
            Some(size) => {
                policy.min_size_bytes.is_none_or(|min| size >= min)
                    && policy.max_size_bytes.is_none_or(|max| size <= max)
            }
            None => true,
        })
        .collect();

    // 2. Group by label, stable first-encounter order
    let mut groups: Vec<(String, Vec<&Variant>)> = Vec::new();
    for variant in surviving {
        match groups.iter_mut().find(|(label, _)| *label == variant.label) {
            Some((_, members)) => members.push(variant),
            None => groups.push((variant.label.clone(), vec![variant])),
        }
    }

    // 3. Reduce each group per the dedup strategy
    if policy.dedup != DedupStrategy::None {
        for (_, members) in &mut groups {
            let chosen = reduce_group(members, policy.dedup);
            *members = vec![chosen];
        }
    }

    // 4. Target resolution filter
    if let Some(target) = &policy.target_resolution {
        groups = filter_target(groups, target)?;
    }

    if groups.is_empty() {
        return Err(SelectionError::NotFound);
    }

    // 5. Cardinality — narrow to one candidate unless the caller keeps all
    if policy.select_all {
        return Ok(groups
            .into_iter()
            .flat_map(|(_, members)| members)
            .cloned()
            .collect());
    }

    let picked = if groups.len() > 1 {
        best_group(groups)
    } else {
        groups.into_iter().next()
    };
    let Some((label, members)) = picked else {
        return Err(SelectionError::NotFound);
    };

    match members.as_slice() {
        [single] => Ok(vec![(*single).clone()]),
        _ => Err(SelectionError::Ambiguous {
            label,
            candidates: members.len(),
        }),
    }
}

/// Reduce a group to one member per the strategy; ties keep the first.
///
/// Candidates with an unknown comparison key are only chosen when the
/// whole group lacks the key — a group is never silently discarded.
fn reduce_group<'a>(members: &[&'a Variant], strategy: DedupStrategy) -> &'a Variant {
    let key = |v: &Variant| match strategy {
        DedupStrategy::HighestBitrate | DedupStrategy::LowestBitrate => v.bitrate_bps,
        DedupStrategy::LargestSize | DedupStrategy::SmallestSize => v.size_bytes,
        DedupStrategy::None => unreachable!("reduce_group is not called for DedupStrategy::None"),
    };
    let prefer_max = matches!(
        strategy,
        DedupStrategy::HighestBitrate | DedupStrategy::LargestSize
    );

    let mut best = members[0];
    for &candidate in &members[1..] {
        let better = match (key(candidate), key(best)) {
            // Strict comparisons keep the first-encountered member on ties
            (Some(c), Some(b)) => {
                if prefer_max {
                    c > b
                } else {
                    c < b
                }
            }
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best = candidate;
        }
    }
    best
}

/// Restrict groups to the target resolution: exact label match preferred,
/// otherwise the group whose parsed height is numerically nearest. When the
/// target itself does not parse, only an exact match counts.
fn filter_target<'a>(
    groups: Vec<(String, Vec<&'a Variant>)>,
    target: &str,
) -> std::result::Result<Vec<(String, Vec<&'a Variant>)>, SelectionError> {
    if let Some(exact) = groups.iter().position(|(label, _)| label == target) {
        let mut groups = groups;
        return Ok(vec![groups.swap_remove(exact)]);
    }

    let Some(target_height) = parse_height(target) else {
        return Err(SelectionError::NotFound);
    };

    let nearest = groups
        .into_iter()
        .filter_map(|group| parse_height(&group.0).map(|h| (h.abs_diff(target_height), group)))
        .min_by_key(|(distance, _)| *distance);

    match nearest {
        Some((distance, group)) => {
            tracing::debug!(
                target = target,
                chosen = %group.0,
                distance = distance,
                "No exact resolution match, using nearest by height"
            );
            Ok(vec![group])
        }
        None => Err(SelectionError::NotFound),
    }
}

/// Pick the highest-resolution group by parsed label height; labels that do
/// not parse rank below any that do, and ties keep the earlier group.
fn best_group(groups: Vec<(String, Vec<&Variant>)>) -> Option<(String, Vec<&Variant>)> {
    // Strict comparison keeps the earlier group on ties; None < Some ranks
    // unparseable labels last
    groups
        .into_iter()
        .reduce(|best, group| {
            if parse_height(&group.0) > parse_height(&best.0) {
                group
            } else {
                best
            }
        })
}

/// Parse the numeric height out of a resolution label ("1080p" -> 1080)
pub(crate) fn parse_height(label: &str) -> Option<u32> {
    static HEIGHT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = HEIGHT_RE
        .get_or_init(|| Regex::new(r"(\d+)").ok())
        .as_ref()?;
    re.captures(label)?.get(1)?.as_str().parse().ok()
}
