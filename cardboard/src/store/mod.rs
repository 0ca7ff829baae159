mod sqlite;

pub use sqlite::SqliteStore;

use crate::card::{Card, CardId, Project};
use crate::error::Result;
use crate::query::{SortDescriptor, StorePredicate};
use crate::schema::{FieldDefinition, FieldId, ProjectId};
use crate::view::{ViewId, ViewMode};

/// A persisted card store that can evaluate compiled predicates natively.
///
/// Writes are staged until [`CardStore::save`]; reads on the same store see
/// staged writes. Implementations guard their own connection, so a store can
/// be shared between the orchestrator and its recompute worker.
pub trait CardStore: Send + Sync {
    /// Cards matching the pushed-down clauses, ordered by `sort`
    /// (insertion order when `sort` is empty). Residual filters are the
    /// caller's job.
    fn fetch(&self, predicate: &StorePredicate, sort: &[SortDescriptor]) -> Result<Vec<Card>>;

    /// Insert or replace a card. A replaced card keeps its position.
    fn insert(&self, project_id: ProjectId, card: &Card) -> Result<()>;

    fn delete(&self, card_id: &CardId) -> Result<()>;

    fn put_field(&self, project_id: ProjectId, definition: &FieldDefinition) -> Result<()>;

    fn delete_field(&self, field_id: &FieldId) -> Result<()>;

    fn put_view(&self, project_id: ProjectId, view: &ViewMode) -> Result<()>;

    fn delete_view(&self, view_id: &ViewId) -> Result<()>;

    /// Write a whole project: its row, definitions, cards and views.
    fn put_project(&self, project: &Project) -> Result<()>;

    fn load_project(&self, project_id: ProjectId) -> Result<Project>;

    /// Commit staged writes.
    fn save(&self) -> Result<()>;

    /// Drop staged writes.
    fn discard(&self) -> Result<()>;
}
