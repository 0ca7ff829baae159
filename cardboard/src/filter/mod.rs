// Filter evaluator - per-field predicates over typed values

use crate::card::{Card, FieldValue};
use crate::schema::{FieldDefinition, FieldId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Active filters keyed by the field they constrain. Entries are ANDed.
pub type FilterMap = BTreeMap<FieldId, FilterType>;

/// A predicate over one field's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterType {
    /// Case-insensitive substring. An empty needle matches nothing.
    TextContains { text: String },
    /// Inclusive bounds; a missing bound is unbounded on that side.
    NumberRange {
        low: Option<f64>,
        high: Option<f64>,
    },
    /// Inclusive bounds compared at calendar-day granularity (UTC).
    DateRange {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    /// Membership for a selection, non-empty intersection for tags.
    SelectionContains { options: BTreeSet<String> },
    IsNotEmpty,
}

impl FilterType {
    pub fn text_contains(text: impl Into<String>) -> Self {
        FilterType::TextContains { text: text.into() }
    }

    pub fn number_range(low: Option<f64>, high: Option<f64>) -> Self {
        FilterType::NumberRange { low, high }
    }

    pub fn date_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        FilterType::DateRange { start, end }
    }

    pub fn selection(options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        FilterType::SelectionContains {
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FilterType::TextContains { .. } => "text_contains",
            FilterType::NumberRange { .. } => "number_range",
            FilterType::DateRange { .. } => "date_range",
            FilterType::SelectionContains { .. } => "selection_contains",
            FilterType::IsNotEmpty => "is_not_empty",
        }
    }
}

/// Decide whether a (possibly absent) value satisfies `filter`.
///
/// Absent values only ever satisfy nothing; variant pairings that are not
/// defined (a number range against text, say) are a non-match, never an error.
pub fn matches(value: Option<&FieldValue>, filter: &FilterType) -> bool {
    let Some(value) = value else {
        return false;
    };

    match (filter, value) {
        (FilterType::IsNotEmpty, FieldValue::Url(url)) => url.is_some(),
        (FilterType::IsNotEmpty, _) => true,

        (FilterType::TextContains { text }, FieldValue::Text(value)) => {
            !text.is_empty() && contains_ignore_case(value, text)
        }

        (FilterType::NumberRange { low, high }, FieldValue::Number(n)) => {
            low.map_or(true, |low| *n >= low) && high.map_or(true, |high| *n <= high)
        }

        (FilterType::DateRange { start, end }, FieldValue::Date(date)) => {
            let day = date.date_naive();
            start.map_or(true, |s| day >= s.date_naive())
                && end.map_or(true, |e| day <= e.date_naive())
        }

        (FilterType::SelectionContains { options }, FieldValue::Selection(Some(option))) => {
            options.contains(option)
        }
        (FilterType::SelectionContains { options }, FieldValue::MultiSelection(tags)) => {
            tags.iter().any(|t| options.contains(t))
        }

        _ => false,
    }
}

/// A card matches a filter mapping iff it matches every entry.
pub fn card_matches(card: &Card, filters: &FilterMap) -> bool {
    filters
        .iter()
        .all(|(field, filter)| matches(card.value(field), filter))
}

/// Drop filters whose field no longer exists in the project.
/// A dangling filter contributes nothing rather than excluding every card.
pub fn prune_dangling(filters: &FilterMap, definitions: &[FieldDefinition]) -> FilterMap {
    filters
        .iter()
        .filter(|(field, _)| {
            let known = definitions.iter().any(|d| d.id == **field);
            if !known {
                log::debug!("Ignoring filter on unknown field {field}");
            }
            known
        })
        .map(|(field, filter)| (*field, filter.clone()))
        .collect()
}

/// Normalize free-text search: blank input means "no search".
pub fn normalize_search(text: &str) -> Option<&str> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Free-text search against the card title only.
pub fn title_matches(card: &Card, search: &str) -> bool {
    match normalize_search(search) {
        Some(needle) => contains_ignore_case(&card.title, needle),
        None => true,
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
