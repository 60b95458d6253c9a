//! Field-level delta between two versions of a record.
//!
//! Remote services report changes as "here is the whole record now". This
//! module turns a pair of whole records into removals, additions, and
//! in-place modifications of details, so that the stored record keeps the
//! identity of every detail that was merely edited.
//!
//! # Algorithm
//!
//! 1. [`fallback_delta`]: drop every pair of value-equal details. What is
//!    left on the old side are naive removals, on the new side naive
//!    additions.
//! 2. [`improve_delta`]: per detail kind, greedily pair removals with
//!    additions by lowest [`score_for_detail_pair`]. A pair becomes a
//!    modification of the old detail.
//! 3. [`apply_delta`]: apply the result to a copy of the old record.
//!
//! The matching is greedy with ties broken by encounter order. It is not a
//! minimum-cost assignment, and changing that would change which detail an
//! ambiguous edit lands on.

use crate::detail::{Detail, DetailKind, FieldId, FieldValue, ValueShape};
use crate::Record;
use std::collections::{BTreeMap, BTreeSet};

/// Naive removal/addition sets, as indices into the old and new detail lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackDelta {
    /// Indices into the old details with no exact counterpart
    pub removals: Vec<usize>,
    /// Indices into the new details with no exact counterpart
    pub additions: Vec<usize>,
}

impl FallbackDelta {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

/// Exact-match pass. Ignorable kinds appear in neither list.
pub fn fallback_delta(prev: &[Detail], curr: &[Detail]) -> FallbackDelta {
    let mut consumed = vec![false; curr.len()];
    let mut removals = Vec::new();

    for (i, old) in prev.iter().enumerate() {
        if old.is_ignorable() {
            continue;
        }
        let found = (0..curr.len())
            .find(|&j| !consumed[j] && !curr[j].is_ignorable() && old.same_values(&curr[j]));
        match found {
            Some(j) => consumed[j] = true,
            None => removals.push(i),
        }
    }

    let additions = (0..curr.len())
        .filter(|&j| !consumed[j] && !curr[j].is_ignorable())
        .collect();

    FallbackDelta {
        removals,
        additions,
    }
}

/// How two differently-shaped values may still be the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Equivalence {
    /// Same string content (a URL stored as text vs. as a URL)
    SameString,
    /// Same integers (an int list vs. a generic list of ints)
    SameInts,
}

/// Value shapes compared by content rather than by variant.
const EQUIVALENT_SHAPES: &[(ValueShape, ValueShape, Equivalence)] = &[
    (ValueShape::Text, ValueShape::Url, Equivalence::SameString),
    (ValueShape::Url, ValueShape::Text, Equivalence::SameString),
    (ValueShape::IntList, ValueShape::List, Equivalence::SameInts),
    (ValueShape::List, ValueShape::IntList, Equivalence::SameInts),
    (ValueShape::List, ValueShape::List, Equivalence::SameInts),
];

fn equivalent(a: &FieldValue, b: &FieldValue) -> bool {
    let rule = EQUIVALENT_SHAPES
        .iter()
        .find(|(x, y, _)| *x == a.shape() && *y == b.shape())
        .map(|(_, _, rule)| *rule);

    match rule {
        Some(Equivalence::SameString) => a.as_str() == b.as_str(),
        Some(Equivalence::SameInts) => match (a.as_ints(), b.as_ints()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        None => false,
    }
}

/// Distance between two values of one field: 0 when they are the same
/// value, 1 otherwise. An absent value equals an empty one.
pub fn score_for_value(a: Option<&FieldValue>, b: Option<&FieldValue>) -> u32 {
    match (a, b) {
        (None, None) => 0,
        (Some(v), None) | (None, Some(v)) => u32::from(!v.is_emptyish()),
        (Some(a), Some(b)) => {
            if a == b || (a.is_emptyish() && b.is_emptyish()) || equivalent(a, b) {
                0
            } else {
                1
            }
        }
    }
}

/// Distance between two details: the sum of [`score_for_value`] over the
/// union of their fields. Details of different kinds never match.
pub fn score_for_detail_pair(a: &Detail, b: &Detail) -> u32 {
    if a.kind != b.kind {
        return u32::MAX;
    }
    let fields: BTreeSet<FieldId> = a.fields.keys().chain(b.fields.keys()).copied().collect();
    fields
        .into_iter()
        .map(|f| score_for_value(a.get(f), b.get(f)))
        .sum()
}

/// Outcome of greedy matching within one detail kind. Indices refer to the
/// slices passed to [`match_details`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matching {
    /// `(removal, addition, score)` in commit order
    pub pairs: Vec<(usize, usize, u32)>,
    pub unmatched_removals: Vec<usize>,
    pub unmatched_additions: Vec<usize>,
}

/// Greedily pair removals with additions, lowest score first.
pub fn match_details(removals: &[&Detail], additions: &[&Detail]) -> Matching {
    let scores: Vec<Vec<u32>> = removals
        .iter()
        .map(|r| additions.iter().map(|a| score_for_detail_pair(r, a)).collect())
        .collect();

    let mut removal_used = vec![false; removals.len()];
    let mut addition_used = vec![false; additions.len()];
    let mut pairs = Vec::new();

    loop {
        let mut best: Option<(usize, usize, u32)> = None;
        for (i, row) in scores.iter().enumerate() {
            if removal_used[i] {
                continue;
            }
            for (j, &score) in row.iter().enumerate() {
                // Different kinds never pair.
                if addition_used[j] || score == u32::MAX {
                    continue;
                }
                if best.map_or(true, |(_, _, s)| score < s) {
                    best = Some((i, j, score));
                }
            }
        }

        let Some((i, j, score)) = best else { break };
        removal_used[i] = true;
        addition_used[j] = true;
        pairs.push((i, j, score));
    }

    Matching {
        pairs,
        unmatched_removals: (0..removals.len()).filter(|&i| !removal_used[i]).collect(),
        unmatched_additions: (0..additions.len()).filter(|&j| !addition_used[j]).collect(),
    }
}

/// Merge an addition into the removal it was matched with. The result keeps
/// the removal's identity and takes exactly the addition's fields.
pub fn merge_modification(removal: &Detail, addition: &Detail) -> Detail {
    let mut merged = removal.clone();
    for (field, value) in &addition.fields {
        merged.set(*field, value.clone());
    }
    merged
        .fields
        .retain(|field, _| addition.fields.contains_key(field));
    merged
}

/// Field-level delta against an old detail list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailDelta {
    /// Indices into the old details to drop
    pub removals: Vec<usize>,
    /// New details, without store identity
    pub additions: Vec<Detail>,
    /// `(old index, replacement)`; the replacement keeps the old identity
    pub modifications: Vec<(usize, Detail)>,
}

impl DetailDelta {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty() && self.modifications.is_empty()
    }
}

fn bucket_by_kind(details: &[Detail], indices: &[usize]) -> BTreeMap<DetailKind, Vec<usize>> {
    let mut buckets: BTreeMap<DetailKind, Vec<usize>> = BTreeMap::new();
    for &i in indices {
        buckets.entry(details[i].kind).or_default().push(i);
    }
    buckets
}

/// Turn naive removals/additions into modifications where a removal and an
/// addition of the same kind can be paired. Pairs scoring 0 are treated as
/// unmodified.
pub fn improve_delta(prev: &[Detail], curr: &[Detail], naive: &FallbackDelta) -> DetailDelta {
    let removal_buckets = bucket_by_kind(prev, &naive.removals);
    let mut addition_buckets = bucket_by_kind(curr, &naive.additions);

    let mut delta = DetailDelta::default();
    let mut added: Vec<usize> = Vec::new();

    for (kind, removal_idx) in &removal_buckets {
        let addition_idx = addition_buckets.remove(kind).unwrap_or_default();
        let removals: Vec<&Detail> = removal_idx.iter().map(|&i| &prev[i]).collect();
        let additions: Vec<&Detail> = addition_idx.iter().map(|&j| &curr[j]).collect();

        let matching = match_details(&removals, &additions);
        for (r, a, score) in matching.pairs {
            if score == 0 {
                continue;
            }
            let old = removal_idx[r];
            delta
                .modifications
                .push((old, merge_modification(&prev[old], &curr[addition_idx[a]])));
        }
        delta
            .removals
            .extend(matching.unmatched_removals.iter().map(|&r| removal_idx[r]));
        added.extend(matching.unmatched_additions.iter().map(|&a| addition_idx[a]));
    }

    // Kinds that were only added pass through unchanged.
    for indices in addition_buckets.into_values() {
        added.extend(indices);
    }

    added.sort_unstable();
    delta.additions = added
        .into_iter()
        .map(|j| Detail {
            id: None,
            ..curr[j].clone()
        })
        .collect();
    delta.removals.sort_unstable();
    delta.modifications.sort_by_key(|(i, _)| *i);
    delta
}

/// Compute the detail delta from `prev` to `curr`.
pub fn detail_delta(prev: &Record, curr: &Record) -> DetailDelta {
    let naive = fallback_delta(&prev.details, &curr.details);
    improve_delta(&prev.details, &curr.details, &naive)
}

/// Produce `curr`'s content on a copy of `prev`, keeping `prev`'s detail
/// identities wherever a detail was modified rather than replaced.
pub fn apply_delta(prev: &Record, curr: &Record) -> Record {
    let delta = detail_delta(prev, curr);
    if delta.is_empty() {
        return prev.clone();
    }

    let removed: BTreeSet<usize> = delta.removals.iter().copied().collect();
    let mut modified: BTreeMap<usize, Detail> = delta.modifications.into_iter().collect();

    let mut details = Vec::with_capacity(prev.details.len() + delta.additions.len());
    for (i, detail) in prev.details.iter().enumerate() {
        if removed.contains(&i) {
            continue;
        }
        match modified.remove(&i) {
            Some(replacement) => details.push(replacement),
            None => details.push(detail.clone()),
        }
    }
    details.extend(delta.additions);

    Record {
        id: prev.id.clone(),
        details,
    }
}
