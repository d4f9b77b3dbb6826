//! Confidence-based reconciliation of competing values for the same key.

use indexmap::IndexMap;

use crate::models::FieldValue;

/// Pick the better of two observations for one key.
///
/// A non-blank value always beats a blank one. Otherwise the strictly higher
/// confidence wins and ties keep `current`, so the first-seen value survives.
pub fn select_better(current: Option<FieldValue>, candidate: FieldValue) -> FieldValue {
    let Some(current) = current else {
        return candidate;
    };

    let current_blank = current.trimmed_value().is_none();
    let candidate_blank = candidate.trimmed_value().is_none();
    if current_blank != candidate_blank {
        return if candidate_blank { current } else { candidate };
    }

    if candidate.confidence.rank() > current.confidence.rank() {
        candidate
    } else {
        current
    }
}

/// Fold a sequence of observations into one value per key.
///
/// Keys keep the order in which they were first seen.
pub fn reconcile_by_key<I>(values: I) -> IndexMap<String, FieldValue>
where
    I: IntoIterator<Item = FieldValue>,
{
    let mut by_key: IndexMap<String, FieldValue> = IndexMap::new();
    for value in values {
        match by_key.get_mut(&value.key) {
            Some(slot) => *slot = select_better(Some(slot.clone()), value),
            None => {
                by_key.insert(value.key.clone(), value);
            }
        }
    }
    by_key
}
