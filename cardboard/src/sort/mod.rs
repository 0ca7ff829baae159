// Sort comparator - ordering by one user-chosen field

use crate::card::{Card, FieldValue};
use crate::schema::{FieldDefinition, FieldId, FieldType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

/// The single active sort of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortRule {
    pub field_id: FieldId,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortRule {
    pub fn ascending(field_id: FieldId) -> Self {
        SortRule {
            field_id,
            direction: SortDirection::Ascending,
        }
    }
}

/// Order two present values of a field of type `field_type`.
///
/// Values with an orderable payload compare by that payload; tags all compare
/// equal to each other. A value that has nothing to order by (a selection
/// without a chosen option, an empty url, a variant that does not match the
/// field type) sorts after every orderable value and equal to its own kind,
/// which keeps the ordering total for a stable sort.
pub fn compare_values(a: &FieldValue, b: &FieldValue, field_type: FieldType) -> Ordering {
    match (sort_key(a, field_type), sort_key(b, field_type)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Orderable payload of a value, borrowed.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortKey<'a> {
    Text(&'a str),
    Number(TotalF64),
    Date(&'a DateTime<Utc>),
    Boolean(bool),
    Tags,
}

/// `f64` ordered by `total_cmp`, so NaN has a fixed place.
struct TotalF64(f64);

impl PartialEq for TotalF64 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn sort_key(value: &FieldValue, field_type: FieldType) -> Option<SortKey<'_>> {
    if value.field_type() != field_type {
        return None;
    }
    match value {
        FieldValue::Text(text) => Some(SortKey::Text(text)),
        FieldValue::Number(n) => Some(SortKey::Number(TotalF64(*n))),
        FieldValue::Date(date) => Some(SortKey::Date(date)),
        FieldValue::Boolean(b) => Some(SortKey::Boolean(*b)),
        FieldValue::Selection(option) => option.as_deref().map(SortKey::Text),
        FieldValue::Url(url) => url.as_deref().map(SortKey::Text),
        FieldValue::MultiSelection(_) => Some(SortKey::Tags),
    }
}

/// Full comparator: absent values go last whatever the direction, preceded
/// by values with nothing to order by. The direction only flips the order of
/// two orderable values.
pub fn compare(
    a: Option<&FieldValue>,
    b: Option<&FieldValue>,
    field_type: FieldType,
    direction: SortDirection,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (sort_key(a, field_type), sort_key(b, field_type)) {
            (Some(x), Some(y)) => match direction {
                SortDirection::Ascending => x.cmp(&y),
                SortDirection::Descending => x.cmp(&y).reverse(),
            },
            _ => compare_values(a, b, field_type),
        },
    }
}

/// Strict "sorts before" predicate derived from [`compare`].
pub fn less_than(
    a: Option<&FieldValue>,
    b: Option<&FieldValue>,
    field_type: FieldType,
    direction: SortDirection,
) -> bool {
    compare(a, b, field_type, direction) == Ordering::Less
}

/// Stable in-place sort by `rule`. A rule pointing at an unknown field
/// leaves the order untouched.
pub fn sort_cards(cards: &mut [Card], rule: &SortRule, definitions: &[FieldDefinition]) {
    let Some(definition) = definitions.iter().find(|d| d.id == rule.field_id) else {
        log::debug!("Sort field {} not defined, keeping order", rule.field_id);
        return;
    };
    let field_type = definition.field_type;
    cards.sort_by(|a, b| {
        compare(
            a.value(&rule.field_id),
            b.value(&rule.field_id),
            field_type,
            rule.direction,
        )
    });
}
