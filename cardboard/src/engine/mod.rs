// View state orchestrator - live configuration, mutations and named views

use crate::card::{Card, CardId, FieldValue, Project};
use crate::error::{EngineError, Result};
use crate::filter::{FilterMap, FilterType};
use crate::schema::{
    DisplayKind, EngineConfig, FieldDefinition, FieldId, FieldType, ProjectConfig, ProjectId,
    QueryStrategy,
};
use crate::sort::SortRule;
use crate::store::CardStore;
use crate::validation;
use crate::view::{ViewId, ViewMode};
use crate::worker::{self, RecomputeWorker, ResultSlot, Snapshot};
use std::sync::Arc;
use std::time::Duration;

/// Title given to cards created through [`BoardEngine::create_quick_card`].
pub const QUICK_CARD_TITLE: &str = "New Task";

/// Owns a project and the live view configuration over it.
///
/// Configuration setters only record the change and queue a debounced
/// recomputation; results are read back through [`BoardEngine::visible_cards`]
/// and the grouping accessors, which always show the last published result.
/// With a store attached, every mutation is written and saved to the store
/// before it is applied in memory, so a failed save leaves nothing changed.
pub struct BoardEngine {
    project: Project,
    config: EngineConfig,
    store: Option<Arc<dyn CardStore>>,
    search_text: String,
    filters: FilterMap,
    sort: Option<SortRule>,
    grouping_field: Option<FieldId>,
    selected_view: Option<ViewId>,
    slot: Arc<ResultSlot>,
    worker: RecomputeWorker,
}

impl BoardEngine {
    /// An engine evaluating everything in memory, with no persistence.
    pub fn new(project: Project, config: EngineConfig) -> Result<Self> {
        Self::build(project, config, None)
    }

    /// Build the project from its YAML configuration.
    pub fn from_config(config: &ProjectConfig) -> Result<Self> {
        let project = Project::from_config(config)?;
        Self::new(project, config.engine.clone())
    }

    /// Write `project` into `store` and keep it in sync from then on.
    pub fn with_store(project: Project, config: EngineConfig, store: Arc<dyn CardStore>) -> Result<Self> {
        for card in &project.cards {
            validation::validate_card(card, &project.fields)
                .into_result(&format!("Card '{}'", card.title))?;
        }
        if let Err(e) = store.put_project(&project).and_then(|()| store.save()) {
            let _ = store.discard();
            return Err(e);
        }
        Self::build(project, config, Some(store))
    }

    /// Load a previously stored project.
    pub fn open(store: Arc<dyn CardStore>, project_id: ProjectId, config: EngineConfig) -> Result<Self> {
        let project = store.load_project(project_id)?;
        Self::build(project, config, Some(store))
    }

    fn build(project: Project, config: EngineConfig, store: Option<Arc<dyn CardStore>>) -> Result<Self> {
        if config.strategy == QueryStrategy::Store && store.is_none() {
            return Err(EngineError::Config(
                "The store query strategy needs a card store".into(),
            ));
        }

        let slot = Arc::new(ResultSlot::new());
        let worker = RecomputeWorker::spawn(config.debounce(), store.clone(), Arc::clone(&slot))?;

        let mut engine = BoardEngine {
            project,
            config,
            store,
            search_text: String::new(),
            filters: FilterMap::new(),
            sort: None,
            grouping_field: None,
            selected_view: None,
            slot,
            worker,
        };

        match engine.project.views.first().map(|v| v.id) {
            Some(view_id) => engine.load_view(&view_id)?,
            None => {
                engine.grouping_field = engine.project.groupable_fields().first().map(|f| f.id);
            }
        }

        engine.recompute_now()?;
        Ok(engine)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    pub fn filters(&self) -> &FilterMap {
        &self.filters
    }

    pub fn sort_rule(&self) -> Option<&SortRule> {
        self.sort.as_ref()
    }

    pub fn grouping_field(&self) -> Option<FieldId> {
        self.grouping_field
    }

    /// Fields a board can be grouped by: selection, multi-selection and date.
    pub fn groupable_fields(&self) -> Vec<&FieldDefinition> {
        self.project.groupable_fields()
    }

    // ── Results ──────────────────────────────────────────────────────

    /// The current filtered and sorted cards.
    pub fn visible_cards(&self) -> Vec<Card> {
        self.slot.read(|view| view.cards.clone())
    }

    pub fn group_keys(&self) -> Vec<String> {
        self.slot.read(|view| view.grouping.keys.clone())
    }

    pub fn cards_in_group(&self, key: &str) -> Vec<Card> {
        self.slot.read(|view| view.grouping.cards_in(key).to_vec())
    }

    /// Newest generation requested so far.
    pub fn generation(&self) -> u64 {
        self.slot.requested()
    }

    /// Generation of the result currently shown.
    pub fn published_generation(&self) -> u64 {
        self.slot.published_generation()
    }

    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        self.slot.wait_until_settled(timeout)
    }

    pub fn recompute_count(&self) -> usize {
        self.slot.recompute_count()
    }

    /// Why the newest recomputation failed, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.slot.last_error()
    }

    // ── Recomputation ────────────────────────────────────────────────

    fn snapshot(&self) -> Snapshot {
        let cards = match self.config.strategy {
            QueryStrategy::InMemory => self.project.cards.clone(),
            QueryStrategy::Store => Vec::new(),
        };
        Snapshot {
            generation: self.slot.next_generation(),
            project_id: self.project.id,
            cards,
            definitions: self.project.fields.clone(),
            search: self.search_text.clone(),
            filters: self.filters.clone(),
            sort: self.sort,
            grouping_field: self.grouping_field,
            strategy: self.config.strategy,
        }
    }

    fn schedule(&self) -> Result<()> {
        self.worker.schedule(self.snapshot())
    }

    /// Recompute on the calling thread, skipping the debounce. Subject to the
    /// same generation rule as background results.
    pub fn recompute_now(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.slot.count_recompute();
        let outcome = {
            let _gate = self.slot.hold_store();
            worker::compute(&snapshot, self.store.as_deref())
        };
        match outcome {
            Ok(view) => {
                self.slot.publish(snapshot.generation, Ok(view));
                Ok(())
            }
            Err(e) => {
                self.slot
                    .publish(snapshot.generation, Err(EngineError::Store(e.to_string())));
                Err(e)
            }
        }
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Set or clear the filter on `field`.
    pub fn set_filter(&mut self, field: FieldId, filter: Option<FilterType>) -> Result<()> {
        match filter {
            Some(filter) => {
                self.filters.insert(field, filter);
            }
            None => {
                self.filters.remove(&field);
            }
        }
        self.schedule()
    }

    pub fn clear_all_filters(&mut self) -> Result<()> {
        self.filters.clear();
        self.schedule()
    }

    /// Sort by `field`. Reselecting the active field flips its direction;
    /// any other field starts ascending.
    pub fn set_sort(&mut self, field: FieldId) -> Result<()> {
        self.sort = Some(match self.sort {
            Some(rule) if rule.field_id == field => SortRule {
                field_id: field,
                direction: rule.direction.toggled(),
            },
            _ => SortRule::ascending(field),
        });
        self.schedule()
    }

    pub fn clear_sort(&mut self) -> Result<()> {
        self.sort = None;
        self.schedule()
    }

    pub fn set_grouping_field(&mut self, field: Option<FieldId>) -> Result<()> {
        self.grouping_field = field;
        self.schedule()
    }

    pub fn set_search_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.search_text = text.into();
        self.schedule()
    }

    // ── Project Mutations ────────────────────────────────────────────

    /// Run `write` against the store and save. On failure the staged writes
    /// are rolled back and the error is returned for the caller to retry.
    ///
    /// Recomputations wait until the write is saved or rolled back, so none
    /// of them reads a staged row.
    fn persist(&self, write: impl FnOnce(&dyn CardStore) -> Result<()>) -> Result<()> {
        let Some(store) = self.store.as_deref() else {
            return Ok(());
        };
        let gate = self.slot.hold_store();
        let outcome = write(store).and_then(|()| store.save());
        if let Err(e) = &outcome {
            log::warn!("Store write failed, nothing was changed: {e}");
            if let Err(rollback) = store.discard() {
                log::warn!("Rolling back the failed write also failed: {rollback}");
            }
            drop(gate);
            // Replace anything computed against the rolled-back state
            if let Err(stopped) = self.schedule() {
                log::warn!("Could not refresh after the failed write: {stopped}");
            }
        }
        outcome
    }

    fn require_card(&self, card_id: &CardId) -> Result<&Card> {
        self.project
            .card(card_id)
            .ok_or_else(|| EngineError::not_found("Card", card_id))
    }

    fn require_field(&self, field_id: &FieldId) -> Result<&FieldDefinition> {
        self.project
            .field(field_id)
            .ok_or_else(|| EngineError::not_found("Field", field_id))
    }

    /// Persist and apply an edited copy of a card.
    fn replace_card(&mut self, updated: Card) -> Result<()> {
        let project_id = self.project.id;
        self.persist(|store| store.insert(project_id, &updated))?;
        if let Some(card) = self.project.card_mut(&updated.id) {
            *card = updated;
        }
        self.schedule()
    }

    fn replace_field(&mut self, updated: FieldDefinition) -> Result<()> {
        let project_id = self.project.id;
        self.persist(|store| store.put_field(project_id, &updated))?;
        if let Some(field) = self.project.field_mut(&updated.id) {
            *field = updated;
        }
        self.schedule()
    }

    /// Append an empty card.
    pub fn new_card(&mut self, title: impl Into<String>) -> Result<CardId> {
        let card = Card::new(title);
        let card_id = card.id;
        self.add_card(card)?;
        Ok(card_id)
    }

    pub fn add_card(&mut self, card: Card) -> Result<()> {
        if self.project.card(&card.id).is_some() {
            return Err(EngineError::Validation(format!(
                "Card {} already exists",
                card.id
            )));
        }
        validation::validate_card(&card, &self.project.fields)
            .into_result(&format!("Card '{}'", card.title))?;

        let project_id = self.project.id;
        self.persist(|store| store.insert(project_id, &card))?;
        log::debug!("Added card '{}'", card.title);
        self.project.cards.push(card);
        self.schedule()
    }

    pub fn delete_card(&mut self, card_id: &CardId) -> Result<()> {
        let index = self
            .project
            .cards
            .iter()
            .position(|c| c.id == *card_id)
            .ok_or_else(|| EngineError::not_found("Card", card_id))?;
        self.persist(|store| store.delete(card_id))?;
        self.project.cards.remove(index);
        self.schedule()
    }

    /// The value that places a card in `group_key` of the grouping field.
    /// Only selection and multi-selection groups can be targeted.
    fn group_value(&self, group_key: &str) -> Option<(FieldId, FieldValue)> {
        let field = self.grouping_field.and_then(|id| self.project.field(&id))?;
        let value = match field.field_type {
            FieldType::Selection => FieldValue::selection(group_key),
            FieldType::MultiSelection => FieldValue::tags([group_key]),
            _ => return None,
        };
        Some((field.id, value))
    }

    /// Add a card that lands in `group_key`. Returns `None` when the current
    /// grouping field cannot hold such a value.
    pub fn create_quick_card(&mut self, group_key: &str) -> Result<Option<CardId>> {
        let Some((field, value)) = self.group_value(group_key) else {
            log::debug!("Grouping field cannot place a card in '{group_key}'");
            return Ok(None);
        };
        let card = Card::new(QUICK_CARD_TITLE).with_value(field, value);
        let card_id = card.id;
        self.add_card(card)?;
        Ok(Some(card_id))
    }

    /// Reassign a card to `group_key` of the current grouping field.
    pub fn move_card_to_group(&mut self, card_id: &CardId, group_key: &str) -> Result<()> {
        let mut updated = self.require_card(card_id)?.clone();
        let Some((field, value)) = self.group_value(group_key) else {
            return Ok(());
        };
        updated.values.insert(field, value);
        self.replace_card(updated)
    }

    /// Set one value, rejecting variants that do not match the field type.
    pub fn update_property(&mut self, card_id: &CardId, field_id: &FieldId, value: FieldValue) -> Result<()> {
        let definition = self.require_field(field_id)?;
        validation::validate_value(definition, &value)
            .into_result(&format!("Field '{}'", definition.name))?;

        let mut updated = self.require_card(card_id)?.clone();
        updated.values.insert(*field_id, value);
        self.replace_card(updated)
    }

    /// Give a card the default value for `definition`, registering the
    /// definition with the project first if it is new.
    pub fn add_property(&mut self, card_id: &CardId, definition: FieldDefinition) -> Result<()> {
        let mut updated = self.require_card(card_id)?.clone();
        let existing = self.project.field(&definition.id).map(|f| f.field_type);
        let field_type = existing.unwrap_or(definition.field_type);
        updated
            .values
            .insert(definition.id, FieldValue::default_for(field_type));

        let project_id = self.project.id;
        self.persist(|store| {
            if existing.is_none() {
                store.put_field(project_id, &definition)?;
            }
            store.insert(project_id, &updated)
        })?;

        if existing.is_none() {
            log::debug!("Registered field '{}'", definition.name);
            self.project.fields.push(definition);
        }
        if let Some(card) = self.project.card_mut(card_id) {
            *card = updated;
        }
        self.schedule()
    }

    /// Remove a value from a card. A definition no card uses any more is
    /// deleted along with it.
    pub fn remove_property(&mut self, card_id: &CardId, field_id: &FieldId) -> Result<()> {
        let mut updated = self.require_card(card_id)?.clone();
        if updated.values.remove(field_id).is_none() {
            return Ok(());
        }
        let orphaned = !self
            .project
            .cards
            .iter()
            .any(|c| c.id != *card_id && c.values.contains_key(field_id));

        let project_id = self.project.id;
        self.persist(|store| {
            store.insert(project_id, &updated)?;
            if orphaned {
                store.delete_field(field_id)?;
            }
            Ok(())
        })?;

        if let Some(card) = self.project.card_mut(card_id) {
            *card = updated;
        }
        if orphaned {
            log::debug!("Field {field_id} is no longer used, removing its definition");
            self.project.fields.retain(|f| f.id != *field_id);
        }
        self.schedule()
    }

    pub fn rename_property(&mut self, field_id: &FieldId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::Validation("Field name cannot be empty".into()));
        }
        let mut updated = self.require_field(field_id)?.clone();
        updated.name = name;
        self.replace_field(updated)
    }

    /// Append an option to a selection or multi-selection field. Adding an
    /// option that already exists does nothing.
    pub fn add_selection_option(&mut self, field_id: &FieldId, option: impl Into<String>) -> Result<()> {
        let option = option.into();
        let mut updated = self.require_field(field_id)?.clone();
        if !updated.field_type.has_options() {
            return Err(EngineError::Validation(format!(
                "Field '{}' of type {} has no options",
                updated.name,
                updated.field_type.as_str()
            )));
        }
        let options = updated.options.get_or_insert_with(Vec::new);
        if options.contains(&option) {
            return Ok(());
        }
        options.push(option);
        self.replace_field(updated)
    }

    /// Find a definition by exact name, or create it.
    pub fn find_or_create_definition(
        &mut self,
        name: &str,
        field_type: FieldType,
        options: Option<Vec<String>>,
    ) -> Result<FieldId> {
        if let Some(existing) = self.project.field_by_name(name) {
            return Ok(existing.id);
        }
        let mut definition = FieldDefinition::new(name, field_type);
        definition.options = options;
        let field_id = definition.id;

        let project_id = self.project.id;
        self.persist(|store| store.put_field(project_id, &definition))?;
        self.project.fields.push(definition);
        self.schedule()?;
        Ok(field_id)
    }

    // ── Named Views ──────────────────────────────────────────────────

    pub fn views(&self) -> &[ViewMode] {
        &self.project.views
    }

    pub fn selected_view(&self) -> Option<&ViewMode> {
        let view_id = self.selected_view?;
        self.project.views.iter().find(|v| v.id == view_id)
    }

    fn find_view(&self, view_id: &ViewId) -> Result<&ViewMode> {
        self.project
            .views
            .iter()
            .find(|v| v.id == *view_id)
            .ok_or_else(|| EngineError::not_found("View", view_id))
    }

    fn load_view(&mut self, view_id: &ViewId) -> Result<()> {
        let view = self.find_view(view_id)?;
        let filters = view.filters();
        let sort = view.sort_rule();
        let grouping = view.grouping_field;
        log::debug!("Loading view '{}'", view.name);

        self.filters = filters;
        self.sort = sort;
        self.grouping_field = grouping;
        self.selected_view = Some(*view_id);
        Ok(())
    }

    /// Store the current filters and sort as a new view. Selection is left
    /// as it is.
    pub fn save_new_view(
        &mut self,
        name: impl Into<String>,
        display: DisplayKind,
        grouping_field: Option<FieldId>,
    ) -> Result<ViewId> {
        let mut view = ViewMode::new(name, display, grouping_field);
        view.set_filters(&self.filters)?;
        view.set_sort_rule(self.sort.as_ref())?;

        let project_id = self.project.id;
        self.persist(|store| store.put_view(project_id, &view))?;
        log::info!("Saved view '{}'", view.name);
        let view_id = view.id;
        self.project.views.push(view);
        Ok(view_id)
    }

    /// Make `view_id` the live configuration.
    pub fn select_view(&mut self, view_id: &ViewId) -> Result<()> {
        self.load_view(view_id)?;
        self.schedule()
    }

    /// Write the live configuration back into the selected view.
    pub fn save_current_view(&mut self) -> Result<()> {
        let Some(view_id) = self.selected_view else {
            log::debug!("No view selected, nothing to save");
            return Ok(());
        };
        let mut view = self.find_view(&view_id)?.clone();
        view.set_filters(&self.filters)?;
        view.set_sort_rule(self.sort.as_ref())?;
        view.grouping_field = self.grouping_field;

        let project_id = self.project.id;
        self.persist(|store| store.put_view(project_id, &view))?;
        log::info!("Updated view '{}'", view.name);
        if let Some(slot) = self.project.views.iter_mut().find(|v| v.id == view_id) {
            *slot = view;
        }
        Ok(())
    }

    /// Delete a view. Deleting the selected view clears the selection.
    pub fn delete_view(&mut self, view_id: &ViewId) -> Result<()> {
        let index = self
            .project
            .views
            .iter()
            .position(|v| v.id == *view_id)
            .ok_or_else(|| EngineError::not_found("View", view_id))?;
        self.persist(|store| store.delete_view(view_id))?;

        let removed = self.project.views.remove(index);
        if self.selected_view == Some(*view_id) {
            self.selected_view = None;
        }
        log::info!("Deleted view '{}'", removed.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{SortDescriptor, StorePredicate};
    use crate::schema::parse_config_str;
    use crate::sort::SortDirection;
    use crate::store::SqliteStore;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    const SETTLE: Duration = Duration::from_secs(5);

    struct Fields {
        status: FieldId,
        tags: FieldId,
        due: FieldId,
        points: FieldId,
    }

    fn fixture() -> (Project, Fields) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut project = Project::new("Tracker");
        let status = FieldDefinition::new("Status", FieldType::Selection)
            .with_options(["Not Started", "In Progress", "Done"]);
        let tags = FieldDefinition::new("Tags", FieldType::MultiSelection)
            .with_options(["UI", "Backend", "Bug"]);
        let due = FieldDefinition::new("Due Date", FieldType::Date);
        let points = FieldDefinition::new("Story Points", FieldType::Number);
        let fields = Fields {
            status: status.id,
            tags: tags.id,
            due: due.id,
            points: points.id,
        };
        project.fields = vec![status, tags, due, points];

        let at = |m, d| Utc.with_ymd_and_hms(2025, m, d, 12, 0, 0).unwrap();
        project.cards = vec![
            Card::new("First Card")
                .with_value(fields.status, FieldValue::selection("In Progress"))
                .with_value(fields.tags, FieldValue::tags(["UI", "Bug"]))
                .with_value(fields.due, FieldValue::Date(at(8, 13)))
                .with_value(fields.points, FieldValue::Number(8.0)),
            Card::new("Second Card")
                .with_value(fields.status, FieldValue::selection("Not Started"))
                .with_value(fields.tags, FieldValue::tags(["Backend"]))
                .with_value(fields.due, FieldValue::Date(at(10, 22)))
                .with_value(fields.points, FieldValue::Number(3.0)),
            Card::new("Third Special Card")
                .with_value(fields.status, FieldValue::selection("Done"))
                .with_value(fields.tags, FieldValue::tags(["UI"]))
                .with_value(fields.due, FieldValue::Date(at(4, 9)))
                .with_value(fields.points, FieldValue::Number(5.0)),
        ];
        (project, fields)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            debounce_ms: 20,
            strategy: QueryStrategy::InMemory,
        }
    }

    fn store_config() -> EngineConfig {
        EngineConfig {
            debounce_ms: 20,
            strategy: QueryStrategy::Store,
        }
    }

    fn settled(engine: &BoardEngine) -> Vec<String> {
        assert!(engine.wait_until_settled(SETTLE), "engine did not settle");
        titles(&engine.visible_cards())
    }

    fn titles(cards: &[Card]) -> Vec<String> {
        cards.iter().map(|c| c.title.clone()).collect()
    }

    /// Wraps a real store and fails on demand.
    struct FlakyStore {
        inner: SqliteStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        slow_inserts: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            FlakyStore {
                inner: SqliteStore::open_in_memory().unwrap(),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                slow_inserts: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                Err(EngineError::Store("simulated failure".into()))
            } else {
                Ok(())
            }
        }
    }

    impl CardStore for FlakyStore {
        fn fetch(&self, predicate: &StorePredicate, sort: &[SortDescriptor]) -> Result<Vec<Card>> {
            Self::check(&self.fail_reads)?;
            self.inner.fetch(predicate, sort)
        }

        fn insert(&self, project_id: ProjectId, card: &Card) -> Result<()> {
            self.inner.insert(project_id, card)?;
            if self.slow_inserts.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(150));
            }
            Ok(())
        }

        fn delete(&self, card_id: &CardId) -> Result<()> {
            self.inner.delete(card_id)
        }

        fn put_field(&self, project_id: ProjectId, definition: &FieldDefinition) -> Result<()> {
            self.inner.put_field(project_id, definition)
        }

        fn delete_field(&self, field_id: &FieldId) -> Result<()> {
            self.inner.delete_field(field_id)
        }

        fn put_view(&self, project_id: ProjectId, view: &ViewMode) -> Result<()> {
            self.inner.put_view(project_id, view)
        }

        fn delete_view(&self, view_id: &ViewId) -> Result<()> {
            self.inner.delete_view(view_id)
        }

        fn put_project(&self, project: &Project) -> Result<()> {
            self.inner.put_project(project)
        }

        fn load_project(&self, project_id: ProjectId) -> Result<Project> {
            self.inner.load_project(project_id)
        }

        fn save(&self) -> Result<()> {
            Self::check(&self.fail_writes)?;
            self.inner.save()
        }

        fn discard(&self) -> Result<()> {
            self.inner.discard()
        }
    }

    #[test]
    fn test_initial_state() {
        let (project, fields) = fixture();
        let engine = BoardEngine::new(project, config()).unwrap();

        assert_eq!(engine.grouping_field(), Some(fields.status));
        assert_eq!(
            titles(&engine.visible_cards()),
            vec!["First Card", "Second Card", "Third Special Card"]
        );
        assert_eq!(engine.group_keys(), vec!["Not Started", "In Progress", "Done"]);
        assert_eq!(titles(&engine.cards_in_group("Done")), vec!["Third Special Card"]);
        assert_eq!(engine.published_generation(), engine.generation());
    }

    #[test]
    fn test_filter_and_search() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine
            .set_filter(fields.status, Some(FilterType::selection(["Done"])))
            .unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);

        engine.clear_all_filters().unwrap();
        engine
            .set_filter(fields.tags, Some(FilterType::selection(["Bug"])))
            .unwrap();
        assert_eq!(settled(&engine), vec!["First Card"]);

        engine.set_filter(fields.tags, None).unwrap();
        engine.set_search_text("Special").unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);

        engine.set_search_text("   ").unwrap();
        assert_eq!(settled(&engine).len(), 3);
    }

    #[test]
    fn test_set_sort_toggles_direction() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine.set_sort(fields.points).unwrap();
        assert_eq!(
            settled(&engine),
            vec!["Second Card", "Third Special Card", "First Card"]
        );

        engine.set_sort(fields.points).unwrap();
        assert_eq!(engine.sort_rule().unwrap().direction, SortDirection::Descending);
        assert_eq!(
            settled(&engine),
            vec!["First Card", "Third Special Card", "Second Card"]
        );

        engine.set_sort(fields.due).unwrap();
        assert_eq!(engine.sort_rule().unwrap().direction, SortDirection::Ascending);
        assert_eq!(
            settled(&engine),
            vec!["Third Special Card", "First Card", "Second Card"]
        );

        engine.clear_sort().unwrap();
        assert_eq!(
            settled(&engine),
            vec!["First Card", "Second Card", "Third Special Card"]
        );
    }

    #[test]
    fn test_burst_of_edits_recomputes_once() {
        let (project, _) = fixture();
        let config = EngineConfig {
            debounce_ms: 100,
            strategy: QueryStrategy::InMemory,
        };
        let mut engine = BoardEngine::new(project, config).unwrap();
        let before = engine.recompute_count();

        for text in ["S", "Sp", "Spe", "Spec", "Speci", "Specia", "Special"] {
            engine.set_search_text(text).unwrap();
        }

        assert_eq!(settled(&engine), vec!["Third Special Card"]);
        assert_eq!(engine.recompute_count(), before + 1);
        assert_eq!(engine.published_generation(), engine.generation());
    }

    #[test]
    fn test_grouping_by_date_and_tags() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine.set_grouping_field(Some(fields.due)).unwrap();
        settled(&engine);
        assert_eq!(
            engine.group_keys(),
            vec!["April 2025", "August 2025", "October 2025"]
        );

        engine.set_grouping_field(Some(fields.tags)).unwrap();
        settled(&engine);
        assert_eq!(
            titles(&engine.cards_in_group("UI")),
            vec!["First Card", "Third Special Card"]
        );

        engine.set_grouping_field(None).unwrap();
        settled(&engine);
        assert!(engine.group_keys().is_empty());
    }

    #[test]
    fn test_dangling_configuration_is_ignored() {
        let (project, _) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        let missing = Uuid::new_v4();
        engine.set_filter(missing, Some(FilterType::IsNotEmpty)).unwrap();
        engine.set_sort(missing).unwrap();
        engine.set_grouping_field(Some(missing)).unwrap();

        assert_eq!(settled(&engine).len(), 3);
        assert!(engine.group_keys().is_empty());
        assert_eq!(engine.last_error(), None);
    }

    #[test]
    fn test_card_mutation_recomputes() {
        let (project, fields) = fixture();
        let first = project.cards[0].id;
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine
            .set_filter(fields.status, Some(FilterType::selection(["Done"])))
            .unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);

        engine
            .update_property(&first, &fields.status, FieldValue::selection("Done"))
            .unwrap();
        assert_eq!(settled(&engine), vec!["First Card", "Third Special Card"]);

        engine.delete_card(&first).unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);
        assert!(matches!(
            engine.delete_card(&first),
            Err(EngineError::NotFound { kind: "Card", .. })
        ));
    }

    #[test]
    fn test_update_property_rejects_type_mismatch() {
        let (project, fields) = fixture();
        let first = project.cards[0].id;
        let mut engine = BoardEngine::new(project, config()).unwrap();

        let err = engine
            .update_property(&first, &fields.points, FieldValue::Text("eight".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            engine.project().cards[0].value(&fields.points),
            Some(&FieldValue::Number(8.0))
        );

        let err = engine
            .update_property(&first, &Uuid::new_v4(), FieldValue::Boolean(true))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "Field", .. }));
    }

    #[test]
    fn test_quick_card_lands_in_group() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        let card_id = engine.create_quick_card("Done").unwrap().unwrap();
        settled(&engine);
        let done = engine.cards_in_group("Done");
        assert_eq!(done.last().map(|c| c.id), Some(card_id));
        assert_eq!(done.last().unwrap().title, QUICK_CARD_TITLE);

        engine.set_grouping_field(Some(fields.tags)).unwrap();
        let tagged = engine.create_quick_card("Backend").unwrap().unwrap();
        assert_eq!(
            engine.project().card(&tagged).unwrap().value(&fields.tags),
            Some(&FieldValue::tags(["Backend"]))
        );

        engine.set_grouping_field(Some(fields.due)).unwrap();
        assert_eq!(engine.create_quick_card("April 2025").unwrap(), None);
        assert_eq!(engine.project().cards.len(), 5);
    }

    #[test]
    fn test_move_card_to_group() {
        let (project, fields) = fixture();
        let second = project.cards[1].id;
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine.move_card_to_group(&second, "Done").unwrap();
        settled(&engine);
        assert_eq!(
            titles(&engine.cards_in_group("Done")),
            vec!["Second Card", "Third Special Card"]
        );
        assert!(engine.cards_in_group("Not Started").is_empty());

        // Date groups are not a drop target
        engine.set_grouping_field(Some(fields.due)).unwrap();
        engine.move_card_to_group(&second, "April 2025").unwrap();
        assert_eq!(
            engine.project().card(&second).unwrap().value(&fields.status),
            Some(&FieldValue::selection("Done"))
        );
    }

    #[test]
    fn test_add_and_remove_property_collects_orphans() {
        let (project, _) = fixture();
        let first = project.cards[0].id;
        let second = project.cards[1].id;
        let mut engine = BoardEngine::new(project, config()).unwrap();

        let estimate = FieldDefinition::new("Estimate", FieldType::Number);
        let estimate_id = estimate.id;
        engine.add_property(&first, estimate.clone()).unwrap();
        engine.add_property(&second, estimate).unwrap();
        assert_eq!(engine.project().fields.len(), 5);
        assert_eq!(
            engine.project().card(&first).unwrap().value(&estimate_id),
            Some(&FieldValue::Number(0.0))
        );

        engine.remove_property(&first, &estimate_id).unwrap();
        assert!(engine.project().field(&estimate_id).is_some());

        engine.remove_property(&second, &estimate_id).unwrap();
        assert!(engine.project().field(&estimate_id).is_none());
        assert!(!engine.project().is_field_referenced(&estimate_id));
    }

    #[test]
    fn test_field_edits() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();

        engine.add_selection_option(&fields.status, "Blocked").unwrap();
        engine.add_selection_option(&fields.status, "Blocked").unwrap();
        settled(&engine);
        assert_eq!(
            engine.group_keys(),
            vec!["Not Started", "In Progress", "Done", "Blocked"]
        );
        assert!(matches!(
            engine.add_selection_option(&fields.points, "High"),
            Err(EngineError::Validation(_))
        ));

        engine.rename_property(&fields.status, "State").unwrap();
        assert_eq!(engine.project().field(&fields.status).unwrap().name, "State");
        assert!(engine.rename_property(&fields.status, " ").is_err());

        let found = engine
            .find_or_create_definition("State", FieldType::Selection, None)
            .unwrap();
        assert_eq!(found, fields.status);
        let created = engine
            .find_or_create_definition("Priority", FieldType::Selection, Some(vec!["High".into()]))
            .unwrap();
        assert_eq!(engine.project().field(&created).unwrap().option_list(), ["High"]);
        assert_eq!(engine.groupable_fields().len(), 4);
    }

    #[test]
    fn test_views_save_select_delete() {
        let (project, fields) = fixture();
        let mut engine = BoardEngine::new(project, config()).unwrap();
        assert!(engine.selected_view().is_none());

        engine
            .set_filter(fields.status, Some(FilterType::selection(["Done"])))
            .unwrap();
        engine.set_sort(fields.points).unwrap();
        let done_view = engine
            .save_new_view("Done", DisplayKind::Table, Some(fields.tags))
            .unwrap();
        let other_view = engine.save_new_view("Other", DisplayKind::Board, None).unwrap();
        assert!(engine.selected_view().is_none());

        engine.clear_all_filters().unwrap();
        engine.clear_sort().unwrap();
        assert_eq!(settled(&engine).len(), 3);

        engine.select_view(&done_view).unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);
        assert_eq!(engine.grouping_field(), Some(fields.tags));
        assert_eq!(engine.sort_rule(), Some(&SortRule::ascending(fields.points)));

        // Saving writes the live configuration back into the selected view
        engine.set_search_text("nothing matches").unwrap();
        engine.set_filter(fields.status, None).unwrap();
        engine.save_current_view().unwrap();
        assert!(engine.selected_view().unwrap().filters().is_empty());

        engine.delete_view(&other_view).unwrap();
        assert_eq!(engine.selected_view().map(|v| v.id), Some(done_view));
        engine.delete_view(&done_view).unwrap();
        assert!(engine.selected_view().is_none());
        assert!(engine.views().is_empty());
        assert_eq!(engine.project().cards.len(), 3);
    }

    #[test]
    fn test_first_view_selected_on_start() {
        let config = parse_config_str(
            r#"
name: Tracker
fields:
  - { name: Status, type: selection, options: [Todo, Done] }
  - { name: Due, type: date }
  - { name: Points, type: number }
views:
  - { name: By due, group_by: Due, sort: { field: Points, direction: descending } }
  - { name: Board, group_by: Status }
engine:
  debounce_ms: 20
"#,
        )
        .unwrap();
        let engine = BoardEngine::from_config(&config).unwrap();

        assert_eq!(engine.selected_view().unwrap().name, "By due");
        let due = engine.project().field_by_name("Due").unwrap().id;
        assert_eq!(engine.grouping_field(), Some(due));
        assert_eq!(
            engine.sort_rule().map(|r| r.direction),
            Some(SortDirection::Descending)
        );
    }

    #[test]
    fn test_corrupt_view_blob_degrades() {
        let (mut project, fields) = fixture();
        let mut view = ViewMode::new("Broken", DisplayKind::Board, Some(fields.status));
        view.filters_blob = Some("{\"version\":1,\"filters\":".into());
        view.sort_blob = Some("not json".into());
        project.views.push(view);

        let engine = BoardEngine::new(project, config()).unwrap();
        assert!(engine.filters().is_empty());
        assert_eq!(engine.sort_rule(), None);
        assert_eq!(engine.visible_cards().len(), 3);
    }

    #[test]
    fn test_store_strategy_needs_store() {
        let (project, _) = fixture();
        let err = BoardEngine::new(project, store_config()).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_store_strategy_matches_in_memory() {
        let (project, fields) = fixture();
        let store: Arc<dyn CardStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut pushed = BoardEngine::with_store(project.clone(), store_config(), store).unwrap();
        let mut memory = BoardEngine::new(project, config()).unwrap();

        let filter = FilterType::number_range(Some(4.0), None);
        for engine in [&mut pushed, &mut memory] {
            engine.set_filter(fields.points, Some(filter.clone())).unwrap();
            engine.set_sort(fields.points).unwrap();
        }
        assert_eq!(settled(&pushed), settled(&memory));
        assert_eq!(settled(&pushed), vec!["Third Special Card", "First Card"]);
        assert_eq!(pushed.group_keys(), memory.group_keys());
    }

    #[test]
    fn test_store_unsorted_order_is_title_order() {
        let (mut project, _) = fixture();
        project.cards.reverse();
        let store: Arc<dyn CardStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = BoardEngine::with_store(project, store_config(), store).unwrap();
        assert_eq!(
            titles(&engine.visible_cards()),
            vec!["First Card", "Second Card", "Third Special Card"]
        );
    }

    #[test]
    fn test_store_mutations_persist() {
        let (project, fields) = fixture();
        let project_id = project.id;
        let store: Arc<dyn CardStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        {
            let mut engine =
                BoardEngine::with_store(project, store_config(), Arc::clone(&store)).unwrap();
            let card_id = engine.create_quick_card("Done").unwrap().unwrap();
            engine
                .update_property(&card_id, &fields.points, FieldValue::Number(13.0))
                .unwrap();
            engine.save_new_view("Saved", DisplayKind::Board, None).unwrap();
            assert_eq!(settled(&engine).len(), 4);
        }

        let engine = BoardEngine::open(Arc::clone(&store), project_id, store_config()).unwrap();
        assert_eq!(engine.project().cards.len(), 4);
        assert_eq!(engine.selected_view().unwrap().name, "Saved");
        let quick = engine
            .project()
            .cards
            .iter()
            .find(|c| c.title == QUICK_CARD_TITLE)
            .unwrap();
        assert_eq!(quick.value(&fields.points), Some(&FieldValue::Number(13.0)));
    }

    #[test]
    fn test_store_read_failure_keeps_last_result() {
        let (project, fields) = fixture();
        let store = Arc::new(FlakyStore::new());
        let mut engine =
            BoardEngine::with_store(project, store_config(), Arc::clone(&store) as Arc<dyn CardStore>)
                .unwrap();
        assert_eq!(engine.visible_cards().len(), 3);

        store.fail_reads.store(true, Ordering::SeqCst);
        engine
            .set_filter(fields.status, Some(FilterType::selection(["Done"])))
            .unwrap();
        assert_eq!(settled(&engine).len(), 3);
        assert!(engine.last_error().unwrap().contains("simulated failure"));

        store.fail_reads.store(false, Ordering::SeqCst);
        engine.set_search_text("card").unwrap();
        assert_eq!(settled(&engine), vec!["Third Special Card"]);
        assert_eq!(engine.last_error(), None);
    }

    #[test]
    fn test_store_save_failure_changes_nothing() {
        let (project, fields) = fixture();
        let first = project.cards[0].id;
        let store = Arc::new(FlakyStore::new());
        let mut engine =
            BoardEngine::with_store(project, store_config(), Arc::clone(&store) as Arc<dyn CardStore>)
                .unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(engine.new_card("Lost").is_err());
        assert!(engine
            .update_property(&first, &fields.points, FieldValue::Number(1.0))
            .is_err());
        assert_eq!(engine.project().cards.len(), 3);
        assert_eq!(
            engine.project().card(&first).unwrap().value(&fields.points),
            Some(&FieldValue::Number(8.0))
        );

        // Retrying once the store recovers succeeds
        store.fail_writes.store(false, Ordering::SeqCst);
        engine.new_card("Kept").unwrap();
        assert_eq!(settled(&engine).len(), 4);
    }

    #[test]
    fn test_failed_save_never_shows_rolled_back_card() {
        let (project, _) = fixture();
        let store = Arc::new(FlakyStore::new());
        let mut engine =
            BoardEngine::with_store(project, store_config(), Arc::clone(&store) as Arc<dyn CardStore>)
                .unwrap();
        let before = settled(&engine);

        store.slow_inserts.store(true, Ordering::SeqCst);
        store.fail_writes.store(true, Ordering::SeqCst);
        // Queue a recomputation that comes due while the insert is staged
        engine.set_search_text("").unwrap();
        assert!(engine.new_card("Phantom").is_err());

        assert_eq!(settled(&engine), before);
        assert_eq!(engine.project().cards.len(), 3);
    }

    #[test]
    fn test_with_store_rejects_non_finite_numbers() {
        let (mut project, fields) = fixture();
        let project_id = project.id;
        project.cards[1]
            .values
            .insert(fields.points, FieldValue::Number(f64::NAN));
        let store: Arc<dyn CardStore> = Arc::new(SqliteStore::open_in_memory().unwrap());

        for config in [config(), store_config()] {
            let err = BoardEngine::with_store(project.clone(), config, Arc::clone(&store))
                .err()
                .unwrap();
            assert!(matches!(err, EngineError::Validation(_)));
        }
        // Nothing was written
        assert!(matches!(
            store.load_project(project_id),
            Err(EngineError::NotFound { .. })
        ));
    }
}
