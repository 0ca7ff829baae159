pub mod schema;
pub mod card;
pub mod filter;
pub mod sort;
pub mod grouping;
pub mod query;
pub mod store;
pub mod validation;
pub mod view;
pub mod worker;
pub mod engine;
pub mod error;

pub use card::{Card, CardId, FieldValue, Project};
pub use engine::BoardEngine;
pub use error::{EngineError, Result};
pub use filter::{FilterMap, FilterType};
pub use schema::{FieldDefinition, FieldId, FieldType};
pub use sort::{SortDirection, SortRule};
pub use store::{CardStore, SqliteStore};
pub use view::ViewMode;
