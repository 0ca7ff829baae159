use crate::card::{Card, FieldValue};
use crate::error::{EngineError, Result};
use crate::schema::FieldDefinition;

/// Result of validating a card or a single value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Turn collected errors into a rejection, logging any warnings.
    pub fn into_result(self, subject: &str) -> Result<()> {
        for warning in &self.warnings {
            log::warn!("{subject}: {warning}");
        }
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(format!("{subject}: {}", self.errors.join("; "))))
        }
    }

    fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check one value against its field definition.
///
/// A variant that does not match the field type is an error. Options outside
/// the configured list are only warnings: filters and grouping tolerate them.
pub fn validate_value(definition: &FieldDefinition, value: &FieldValue) -> ValidationResult {
    let mut result = ValidationResult::default();

    if value.field_type() != definition.field_type {
        result.errors.push(format!(
            "Field '{}' expects {}, got {}",
            definition.name,
            definition.field_type.as_str(),
            value.field_type().as_str()
        ));
        return result;
    }

    let options = definition.option_list();
    let unknown = |option: &String| !options.contains(option);
    match value {
        FieldValue::Selection(Some(option)) if unknown(option) => {
            result.warnings.push(format!(
                "Field '{}' has no option '{option}'",
                definition.name
            ));
        }
        FieldValue::MultiSelection(tags) => {
            for tag in tags.iter().filter(|t| unknown(*t)) {
                result.warnings.push(format!(
                    "Field '{}' has no option '{tag}'",
                    definition.name
                ));
            }
        }
        FieldValue::Number(n) if !n.is_finite() => {
            result.errors.push(format!(
                "Field '{}' must be a finite number",
                definition.name
            ));
        }
        _ => {}
    }

    result
}

/// Check every value on a card. Values keyed by unknown fields are warnings.
pub fn validate_card(card: &Card, definitions: &[FieldDefinition]) -> ValidationResult {
    let mut result = ValidationResult::default();
    for (field_id, value) in &card.values {
        match definitions.iter().find(|d| d.id == *field_id) {
            Some(definition) => result.merge(validate_value(definition, value)),
            None => result
                .warnings
                .push(format!("Value for unknown field {field_id}")),
        }
    }
    result
}
