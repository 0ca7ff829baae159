// Grouping engine - board buckets for a chosen grouping field

use crate::card::{Card, FieldValue};
use crate::schema::{FieldDefinition, FieldId, FieldType};
use chrono::{DateTime, Datelike, Utc};
use std::collections::{BTreeSet, HashMap};

/// Cards partitioned into ordered buckets for one grouping field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub field_id: Option<FieldId>,
    /// Bucket keys in display order.
    pub keys: Vec<String>,
    buckets: HashMap<String, Vec<Card>>,
}

impl Grouping {
    /// Members of `key`, in the order of the input card list.
    pub fn cards_in(&self, key: &str) -> &[Card] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Month/year bucket label for a date value, e.g. "August 2025".
pub fn month_label(date: &DateTime<Utc>) -> String {
    date.format("%B %Y").to_string()
}

/// Ordered group keys for `definition` over `cards`.
///
/// Selection types use the configured options in stored order, whether or
/// not any card uses them. Dates use the distinct month/year buckets present,
/// oldest first. Other types are not groupable and yield no keys.
pub fn group_keys(definition: &FieldDefinition, cards: &[Card]) -> Vec<String> {
    match definition.field_type {
        FieldType::Selection | FieldType::MultiSelection => definition.option_list().to_vec(),
        FieldType::Date => {
            let months: BTreeSet<(i32, u32)> = cards
                .iter()
                .filter_map(|card| match card.value(&definition.id) {
                    Some(FieldValue::Date(date)) => Some((date.year(), date.month())),
                    _ => None,
                })
                .collect();
            months
                .into_iter()
                .filter_map(|(year, month)| {
                    chrono::NaiveDate::from_ymd_opt(year, month, 1)
                        .map(|d| d.format("%B %Y").to_string())
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Every bucket key a card's value places it in. Tags yield one key each.
pub fn keys_for_card(definition: &FieldDefinition, card: &Card) -> Vec<String> {
    match card.value(&definition.id) {
        Some(FieldValue::Selection(Some(option))) if definition.field_type == FieldType::Selection => {
            vec![option.clone()]
        }
        Some(FieldValue::MultiSelection(tags)) if definition.field_type == FieldType::MultiSelection => {
            let mut seen = BTreeSet::new();
            tags.iter()
                .filter(|t| seen.insert(t.as_str()))
                .cloned()
                .collect()
        }
        Some(FieldValue::Date(date)) if definition.field_type == FieldType::Date => {
            vec![month_label(date)]
        }
        _ => Vec::new(),
    }
}

/// Partition `cards` by `definition`. Cards without a value, or whose value
/// matches none of the keys, appear in no bucket.
pub fn group_cards(definition: &FieldDefinition, cards: &[Card]) -> Grouping {
    let keys = group_keys(definition, cards);
    let mut buckets: HashMap<String, Vec<Card>> =
        keys.iter().map(|k| (k.clone(), Vec::new())).collect();

    for card in cards {
        for key in keys_for_card(definition, card) {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.push(card.clone());
            }
        }
    }

    Grouping {
        field_id: Some(definition.id),
        keys,
        buckets,
    }
}
