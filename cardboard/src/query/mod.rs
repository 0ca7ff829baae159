//! Query compiler.
//!
//! Turns a (project, search text, filter mapping) triple into either an
//! in-memory predicate over materialized cards or a SQL predicate the card
//! store evaluates itself. Filter kinds the store cannot evaluate are kept
//! as a residual in-memory pass, so no clause is ever dropped.

use crate::card::Card;
use crate::error::Result;
use crate::filter::{self, FilterMap, FilterType};
use crate::schema::{FieldDefinition, FieldId, ProjectId};
use crate::sort::{self, SortRule};
use crate::store::CardStore;
use chrono::NaiveDate;
use rusqlite::types::Value;
use std::collections::BTreeSet;

/// The reference evaluation path: search on titles, then field filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryQuery {
    search: Option<String>,
    filters: FilterMap,
}

impl InMemoryQuery {
    /// Compile against the project's definitions. Filters on unknown
    /// fields are dropped here, before any card is looked at.
    pub fn compile(search: &str, filters: &FilterMap, definitions: &[FieldDefinition]) -> Self {
        InMemoryQuery {
            search: filter::normalize_search(search).map(str::to_string),
            filters: filter::prune_dangling(filters, definitions),
        }
    }

    fn residual(filters: FilterMap) -> Self {
        InMemoryQuery {
            search: None,
            filters,
        }
    }

    pub fn filters(&self) -> &FilterMap {
        &self.filters
    }

    pub fn matches(&self, card: &Card) -> bool {
        if let Some(search) = &self.search {
            if !filter::title_matches(card, search) {
                return false;
            }
        }
        filter::card_matches(card, &self.filters)
    }

    /// Matching cards in their original relative order.
    pub fn apply(&self, cards: &[Card]) -> Vec<Card> {
        cards.iter().filter(|c| self.matches(c)).cloned().collect()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.search.is_none() && self.filters.is_empty()
    }
}

/// One boolean clause in the store's predicate language.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreClause {
    Project(ProjectId),
    /// Lowercased needle, matched against the stored lowercased title.
    TitleContains(String),
    Selection {
        field: FieldId,
        options: BTreeSet<String>,
    },
    NumberRange {
        field: FieldId,
        low: Option<f64>,
        high: Option<f64>,
    },
    DateRange {
        field: FieldId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

impl StoreClause {
    /// Translate a field filter, or give it back when the store has no
    /// native form for it.
    fn from_filter(field: FieldId, filter: &FilterType) -> Option<Self> {
        match filter {
            FilterType::SelectionContains { options } => Some(StoreClause::Selection {
                field,
                options: options.clone(),
            }),
            FilterType::NumberRange { low, high } => Some(StoreClause::NumberRange {
                field,
                low: *low,
                high: *high,
            }),
            FilterType::DateRange { start, end } => Some(StoreClause::DateRange {
                field,
                start: start.map(|d| d.date_naive()),
                end: end.map(|d| d.date_naive()),
            }),
            FilterType::TextContains { .. } | FilterType::IsNotEmpty => None,
        }
    }

    /// Render as SQL over `cards c`, appending positional parameters.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            StoreClause::Project(id) => {
                params.push(Value::Text(id.to_string()));
                "c.project_id = ?".to_string()
            }
            StoreClause::TitleContains(needle) => {
                params.push(Value::Text(needle.clone()));
                "instr(c.title_folded, ?) > 0".to_string()
            }
            StoreClause::Selection { field, options } => {
                if options.is_empty() {
                    return "0".to_string();
                }
                params.push(Value::Text(field.to_string()));
                let single = placeholders(options, params);
                let multi = placeholders(options, params);
                format!(
                    "EXISTS (SELECT 1 FROM card_values v WHERE v.card_id = c.id AND v.field_id = ? \
                     AND ((v.kind = 'selection' AND v.selection_value IN ({single})) \
                     OR (v.kind = 'multi_selection' AND EXISTS \
                     (SELECT 1 FROM json_each(v.multi_value) j WHERE j.value IN ({multi})))))"
                )
            }
            StoreClause::NumberRange { field, low, high } => {
                params.push(Value::Text(field.to_string()));
                let mut sql = String::from(
                    "EXISTS (SELECT 1 FROM card_values v WHERE v.card_id = c.id AND v.field_id = ? \
                     AND v.kind = 'number'",
                );
                if let Some(low) = low {
                    params.push(Value::Real(*low));
                    sql.push_str(" AND v.number_value >= ?");
                }
                if let Some(high) = high {
                    params.push(Value::Real(*high));
                    sql.push_str(" AND v.number_value <= ?");
                }
                sql.push(')');
                sql
            }
            StoreClause::DateRange { field, start, end } => {
                params.push(Value::Text(field.to_string()));
                let mut sql = String::from(
                    "EXISTS (SELECT 1 FROM card_values v WHERE v.card_id = c.id AND v.field_id = ? \
                     AND v.kind = 'date'",
                );
                if let Some(start) = start {
                    params.push(Value::Text(day_key(start)));
                    sql.push_str(" AND v.day_value >= ?");
                }
                if let Some(end) = end {
                    params.push(Value::Text(day_key(end)));
                    sql.push_str(" AND v.day_value <= ?");
                }
                sql.push(')');
                sql
            }
        }
    }
}

fn placeholders(options: &BTreeSet<String>, params: &mut Vec<Value>) -> String {
    params.extend(options.iter().map(|o| Value::Text(o.clone())));
    vec!["?"; options.len()].join(", ")
}

/// Day key as stored in `card_values.day_value`.
pub(crate) fn day_key(day: &NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// A store-pushable conjunction plus the filters left for a post-pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StorePredicate {
    pub clauses: Vec<StoreClause>,
    residual: InMemoryQuery,
}

impl StorePredicate {
    pub fn compile(
        project_id: ProjectId,
        search: &str,
        filters: &FilterMap,
        definitions: &[FieldDefinition],
    ) -> Self {
        let mut clauses = vec![StoreClause::Project(project_id)];

        if let Some(search) = filter::normalize_search(search) {
            clauses.push(StoreClause::TitleContains(search.to_lowercase()));
        }

        let mut residual = FilterMap::new();
        for (field, filter) in filter::prune_dangling(filters, definitions) {
            match StoreClause::from_filter(field, &filter) {
                Some(clause) => clauses.push(clause),
                None => {
                    residual.insert(field, filter);
                }
            }
        }

        StorePredicate {
            clauses,
            residual: InMemoryQuery::residual(residual),
        }
    }

    /// Only the project scope: every card of the project.
    pub fn project(project_id: ProjectId) -> Self {
        StorePredicate {
            clauses: vec![StoreClause::Project(project_id)],
            residual: InMemoryQuery::default(),
        }
    }

    /// The conjunction as a SQL boolean expression with its parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| clause.to_sql(&mut params))
            .collect();
        let sql = if parts.is_empty() {
            "1".to_string()
        } else {
            parts.join(" AND ")
        };
        (sql, params)
    }

    /// Filters the store cannot evaluate; applied after the fetch.
    pub fn residual_filters(&self) -> &FilterMap {
        self.residual.filters()
    }

    pub fn apply_residual(&self, cards: Vec<Card>) -> Vec<Card> {
        if self.residual.is_unconstrained() {
            return cards;
        }
        cards.into_iter().filter(|c| self.residual.matches(c)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDescriptor {
    pub column: SortColumn,
    pub ascending: bool,
}

/// Store-level ordering. Always title ascending: the store does not see
/// typed field order, so the active rule is re-applied in memory afterwards.
pub fn compile_sort(_rule: Option<&SortRule>) -> Vec<SortDescriptor> {
    vec![SortDescriptor {
        column: SortColumn::Title,
        ascending: true,
    }]
}

/// Filter and sort materialized cards entirely in memory.
pub fn run_in_memory(
    cards: &[Card],
    search: &str,
    filters: &FilterMap,
    sort_rule: Option<&SortRule>,
    definitions: &[FieldDefinition],
) -> Vec<Card> {
    let query = InMemoryQuery::compile(search, filters, definitions);
    let mut result = query.apply(cards);
    if let Some(rule) = sort_rule {
        sort::sort_cards(&mut result, rule, definitions);
    }
    result
}

/// Push the predicate into `store`, finish residual filters in memory,
/// then apply the active sort rule on top of the store's title order.
pub fn run_store(
    store: &dyn CardStore,
    project_id: ProjectId,
    search: &str,
    filters: &FilterMap,
    sort_rule: Option<&SortRule>,
    definitions: &[FieldDefinition],
) -> Result<Vec<Card>> {
    let predicate = StorePredicate::compile(project_id, search, filters, definitions);
    let fetched = store.fetch(&predicate, &compile_sort(sort_rule))?;
    let mut result = predicate.apply_residual(fetched);
    if let Some(rule) = sort_rule {
        sort::sort_cards(&mut result, rule, definitions);
    }
    Ok(result)
}
