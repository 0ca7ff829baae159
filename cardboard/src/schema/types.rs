use crate::sort::SortDirection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type ProjectId = Uuid;
pub type FieldId = Uuid;

/// The closed set of column types a project can define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Date,
    Url,
    Selection,
    MultiSelection,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Url => "url",
            FieldType::Selection => "selection",
            FieldType::MultiSelection => "multi_selection",
        }
    }

    /// Whether a board can be grouped by fields of this type.
    pub fn is_groupable(&self) -> bool {
        matches!(
            self,
            FieldType::Selection | FieldType::MultiSelection | FieldType::Date
        )
    }

    pub fn has_options(&self) -> bool {
        matches!(self, FieldType::Selection | FieldType::MultiSelection)
    }
}

/// A user-defined typed column owned by one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: FieldId,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Allowed values, in display order. Only meaningful for selection types.
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            id: Uuid::new_v4(),
            name: name.into(),
            field_type,
            options: None,
        }
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    /// The configured options, or an empty slice when none are set.
    pub fn option_list(&self) -> &[String] {
        self.options.as_deref().unwrap_or(&[])
    }
}

/// How a named view lays its cards out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    #[default]
    Board,
    Table,
}

/// Top-level project configuration parsed from a YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub views: Vec<ViewConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

/// A named view preset. Field references are by display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    #[serde(default)]
    pub display: DisplayKind,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub sort: Option<SortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Which execution strategy the orchestrator uses to evaluate filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    #[default]
    InMemory,
    Store,
}

/// Tuning for the live recomputation loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub strategy: QueryStrategy,
}

fn default_debounce_ms() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            debounce_ms: default_debounce_ms(),
            strategy: QueryStrategy::default(),
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
