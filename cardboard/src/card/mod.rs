// Typed value model - field values, cards, and the project that owns them

use crate::error::{EngineError, Result};
use crate::schema::{FieldDefinition, FieldId, FieldType, ProjectConfig, ProjectId};
use crate::sort::SortRule;
use crate::view::ViewMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type CardId = Uuid;

/// A typed datum stored on a card for one field definition.
/// The active variant must match the definition's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Url(Option<String>),
    Selection(Option<String>),
    MultiSelection(Vec<String>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Number(_) => FieldType::Number,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Url(_) => FieldType::Url,
            FieldValue::Selection(_) => FieldType::Selection,
            FieldValue::MultiSelection(_) => FieldType::MultiSelection,
        }
    }

    /// The value a freshly added property starts with.
    pub fn default_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Text => FieldValue::Text(String::new()),
            FieldType::Number => FieldValue::Number(0.0),
            FieldType::Boolean => FieldValue::Boolean(false),
            FieldType::Date => FieldValue::Date(Utc::now()),
            FieldType::Url => FieldValue::Url(None),
            FieldType::Selection => FieldValue::Selection(None),
            FieldType::MultiSelection => FieldValue::MultiSelection(Vec::new()),
        }
    }

    /// Shorthand for a selection holding `option`.
    pub fn selection(option: impl Into<String>) -> Self {
        FieldValue::Selection(Some(option.into()))
    }

    pub fn tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        FieldValue::MultiSelection(tags.into_iter().map(Into::into).collect())
    }
}

/// A card: a title plus a sparse map of values keyed by field id.
/// A missing key means "no value", which is distinct from an empty value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub title: String,
    #[serde(default)]
    pub values: BTreeMap<FieldId, FieldValue>,
}

impl Card {
    pub fn new(title: impl Into<String>) -> Self {
        Card {
            id: Uuid::new_v4(),
            title: title.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, field: FieldId, value: FieldValue) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn value(&self, field: &FieldId) -> Option<&FieldValue> {
        self.values.get(field)
    }
}

/// A project owns its field definitions, cards and named views.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    pub cards: Vec<Card>,
    pub views: Vec<ViewMode>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Project {
            id: Uuid::new_v4(),
            name: name.into(),
            fields: Vec::new(),
            cards: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Build a project from its YAML configuration, assigning fresh ids and
    /// resolving field names used by views.
    pub fn from_config(config: &ProjectConfig) -> Result<Self> {
        let mut project = Project::new(config.name.clone());

        for field in &config.fields {
            if project.field_by_name(&field.name).is_some() {
                return Err(EngineError::Config(format!(
                    "Field '{}' is defined twice",
                    field.name
                )));
            }
            if let Some(options) = &field.options {
                if let Some((i, option)) = options
                    .iter()
                    .enumerate()
                    .find(|&(i, option)| options[..i].contains(option))
                {
                    return Err(EngineError::Config(format!(
                        "Field '{}' lists option '{option}' twice (entry {})",
                        field.name,
                        i + 1
                    )));
                }
            }
            let mut definition = FieldDefinition::new(field.name.clone(), field.field_type);
            definition.options = field.options.clone();
            project.fields.push(definition);
        }

        for view in &config.views {
            let grouping = match &view.group_by {
                Some(name) => Some(project.resolve_field_name(&view.name, name)?),
                None => None,
            };
            let mut mode = ViewMode::new(view.name.clone(), view.display, grouping);
            if let Some(sort) = &view.sort {
                let field_id = project.resolve_field_name(&view.name, &sort.field)?;
                mode.set_sort_rule(Some(&SortRule {
                    field_id,
                    direction: sort.direction,
                }))?;
            }
            project.views.push(mode);
        }

        Ok(project)
    }

    fn resolve_field_name(&self, view: &str, name: &str) -> Result<FieldId> {
        self.field_by_name(name).map(|f| f.id).ok_or_else(|| {
            EngineError::Config(format!("View '{view}' references unknown field '{name}'"))
        })
    }

    pub fn field(&self, id: &FieldId) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.id == *id)
    }

    pub fn field_mut(&mut self, id: &FieldId) -> Option<&mut FieldDefinition> {
        self.fields.iter_mut().find(|f| f.id == *id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn card(&self, id: &CardId) -> Option<&Card> {
        self.cards.iter().find(|c| c.id == *id)
    }

    pub fn card_mut(&mut self, id: &CardId) -> Option<&mut Card> {
        self.cards.iter_mut().find(|c| c.id == *id)
    }

    /// Fields a board can be grouped by, in definition order.
    pub fn groupable_fields(&self) -> Vec<&FieldDefinition> {
        self.fields
            .iter()
            .filter(|f| f.field_type.is_groupable())
            .collect()
    }

    /// Whether any card still holds a value for `field`.
    pub fn is_field_referenced(&self, field: &FieldId) -> bool {
        self.cards.iter().any(|c| c.values.contains_key(field))
    }
}
