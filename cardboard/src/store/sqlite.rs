use super::CardStore;
use crate::card::{Card, CardId, FieldValue, Project};
use crate::error::{EngineError, Result};
use crate::query::{self, SortColumn, SortDescriptor, StorePredicate};
use crate::schema::{FieldDefinition, FieldId, ProjectId};
use crate::view::{ViewId, ViewMode};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// SQLite-backed card store.
///
/// Values are kept in typed columns so pushed-down clauses compare numbers,
/// days and options natively; the canonical JSON of each value is what gets
/// read back.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS field_definitions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                field_type TEXT NOT NULL,
                options_json TEXT,
                position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cards (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                title TEXT NOT NULL,
                title_folded TEXT NOT NULL,
                position INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cards_project ON cards(project_id);

            CREATE TABLE IF NOT EXISTS card_values (
                card_id TEXT NOT NULL,
                field_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                text_value TEXT,
                number_value REAL,
                bool_value INTEGER,
                date_value TEXT,
                day_value TEXT,
                url_value TEXT,
                selection_value TEXT,
                multi_value TEXT,
                value_json TEXT NOT NULL,
                PRIMARY KEY (card_id, field_id)
            );

            CREATE INDEX IF NOT EXISTS idx_card_values_field ON card_values(field_id);

            CREATE TABLE IF NOT EXISTS views (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                display TEXT NOT NULL,
                grouping_field_id TEXT,
                filters_blob TEXT,
                sort_blob TEXT,
                position INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Whether writes are staged and waiting for [`CardStore::save`].
    pub fn has_pending_writes(&self) -> bool {
        !self.conn().is_autocommit()
    }
}

/// Start the staging transaction unless one is already open.
fn begin_write(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        conn.execute_batch("BEGIN")?;
    }
    Ok(())
}

// ── Value Columns ────────────────────────────────────────────────────

/// One `card_values` row, split into its typed columns.
struct ValueRow {
    kind: &'static str,
    text: Option<String>,
    number: Option<f64>,
    boolean: Option<bool>,
    date: Option<String>,
    day: Option<String>,
    url: Option<String>,
    selection: Option<String>,
    multi: Option<String>,
    json: String,
}

impl ValueRow {
    fn from_value(value: &FieldValue) -> Result<Self> {
        if let FieldValue::Number(n) = value {
            if !n.is_finite() {
                return Err(EngineError::Validation(format!(
                    "Cannot store non-finite number {n}"
                )));
            }
        }
        let mut row = ValueRow {
            kind: value.field_type().as_str(),
            text: None,
            number: None,
            boolean: None,
            date: None,
            day: None,
            url: None,
            selection: None,
            multi: None,
            json: serde_json::to_string(value)?,
        };
        match value {
            FieldValue::Text(text) => row.text = Some(text.clone()),
            FieldValue::Number(n) => row.number = Some(*n),
            FieldValue::Boolean(b) => row.boolean = Some(*b),
            FieldValue::Date(date) => {
                row.date = Some(date.to_rfc3339());
                row.day = Some(query::day_key(&date.date_naive()));
            }
            FieldValue::Url(url) => row.url = url.clone(),
            FieldValue::Selection(option) => row.selection = option.clone(),
            FieldValue::MultiSelection(tags) => row.multi = Some(serde_json::to_string(tags)?),
        }
        Ok(row)
    }
}

fn write_card(conn: &Connection, project_id: ProjectId, card: &Card) -> Result<()> {
    let card_id = card.id.to_string();
    conn.execute(
        "INSERT INTO cards (id, project_id, title, title_folded, position)
         VALUES (?1, ?2, ?3, ?4,
                 (SELECT COALESCE(MAX(position) + 1, 0) FROM cards WHERE project_id = ?2))
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, title_folded = excluded.title_folded",
        params![card_id, project_id.to_string(), card.title, card.title.to_lowercase()],
    )?;
    conn.execute("DELETE FROM card_values WHERE card_id = ?1", params![card_id])?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO card_values (card_id, field_id, kind, text_value, number_value, bool_value,
                                  date_value, day_value, url_value, selection_value, multi_value,
                                  value_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for (field_id, value) in &card.values {
        let row = ValueRow::from_value(value)?;
        stmt.execute(params![
            card_id,
            field_id.to_string(),
            row.kind,
            row.text,
            row.number,
            row.boolean,
            row.date,
            row.day,
            row.url,
            row.selection,
            row.multi,
            row.json,
        ])?;
    }
    Ok(())
}

fn write_field(conn: &Connection, project_id: ProjectId, definition: &FieldDefinition) -> Result<()> {
    let options_json = match &definition.options {
        Some(options) => Some(serde_json::to_string(options)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO field_definitions (id, project_id, name, field_type, options_json, position)
         VALUES (?1, ?2, ?3, ?4, ?5,
                 (SELECT COALESCE(MAX(position) + 1, 0) FROM field_definitions WHERE project_id = ?2))
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, field_type = excluded.field_type,
                                       options_json = excluded.options_json",
        params![
            definition.id.to_string(),
            project_id.to_string(),
            definition.name,
            definition.field_type.as_str(),
            options_json,
        ],
    )?;
    Ok(())
}

fn write_view(conn: &Connection, project_id: ProjectId, view: &ViewMode) -> Result<()> {
    conn.execute(
        "INSERT INTO views (id, project_id, name, display, grouping_field_id, filters_blob,
                            sort_blob, position)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                 (SELECT COALESCE(MAX(position) + 1, 0) FROM views WHERE project_id = ?2))
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, display = excluded.display,
                                       grouping_field_id = excluded.grouping_field_id,
                                       filters_blob = excluded.filters_blob,
                                       sort_blob = excluded.sort_blob",
        params![
            view.id.to_string(),
            project_id.to_string(),
            view.name,
            enum_text(&view.display)?,
            view.grouping_field.map(|f| f.to_string()),
            view.filters_blob,
            view.sort_blob,
        ],
    )?;
    Ok(())
}

// ── Row Decoding ─────────────────────────────────────────────────────

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::Store(format!("Invalid id '{raw}': {e}")))
}

/// Serialize a unit enum to its bare serde name.
fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

fn render_order(sort: &[SortDescriptor]) -> String {
    let mut terms: Vec<String> = sort
        .iter()
        .map(|descriptor| {
            let column = match descriptor.column {
                SortColumn::Title => "c.title",
            };
            let direction = if descriptor.ascending { "ASC" } else { "DESC" };
            format!("{column} {direction}")
        })
        .collect();
    terms.push("c.position ASC".to_string());
    terms.join(", ")
}

fn fetch_cards(conn: &Connection, predicate: &StorePredicate, sort: &[SortDescriptor]) -> Result<Vec<Card>> {
    let (where_sql, params) = predicate.to_sql();
    let sql = format!(
        "SELECT c.id, c.title FROM cards c WHERE {where_sql} ORDER BY {}",
        render_order(sort)
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut cards = Vec::new();
    for row in rows {
        let (id, title) = row?;
        let mut card = Card::new(title);
        card.id = parse_id(&id)?;
        cards.push(card);
    }

    let mut values = conn.prepare_cached(
        "SELECT field_id, value_json FROM card_values WHERE card_id = ?1",
    )?;
    for card in &mut cards {
        let rows = values.query_map(params![card.id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (field_id, json) = row?;
            let value: FieldValue = serde_json::from_str(&json)?;
            card.values.insert(parse_id(&field_id)?, value);
        }
    }
    Ok(cards)
}

fn load_fields(conn: &Connection, project_id: ProjectId) -> Result<Vec<FieldDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, field_type, options_json FROM field_definitions
         WHERE project_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![project_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut fields = Vec::new();
    for row in rows {
        let (id, name, field_type, options_json) = row?;
        let mut definition = FieldDefinition::new(name, parse_enum(&field_type)?);
        definition.id = parse_id(&id)?;
        definition.options = match options_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        fields.push(definition);
    }
    Ok(fields)
}

fn load_views(conn: &Connection, project_id: ProjectId) -> Result<Vec<ViewMode>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, display, grouping_field_id, filters_blob, sort_blob FROM views
         WHERE project_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![project_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut views = Vec::new();
    for row in rows {
        let (id, name, display, grouping, filters_blob, sort_blob) = row?;
        let grouping = match grouping {
            Some(raw) => Some(parse_id(&raw)?),
            None => None,
        };
        let mut view = ViewMode::new(name, parse_enum(&display)?, grouping);
        view.id = parse_id(&id)?;
        view.filters_blob = filters_blob;
        view.sort_blob = sort_blob;
        views.push(view);
    }
    Ok(views)
}

impl CardStore for SqliteStore {
    // ── Cards ────────────────────────────────────────────────────────

    fn fetch(&self, predicate: &StorePredicate, sort: &[SortDescriptor]) -> Result<Vec<Card>> {
        let conn = self.conn();
        fetch_cards(&conn, predicate, sort)
    }

    fn insert(&self, project_id: ProjectId, card: &Card) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        write_card(&conn, project_id, card)
    }

    fn delete(&self, card_id: &CardId) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        let id = card_id.to_string();
        conn.execute("DELETE FROM card_values WHERE card_id = ?1", params![id])?;
        conn.execute("DELETE FROM cards WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Field Definitions ────────────────────────────────────────────

    fn put_field(&self, project_id: ProjectId, definition: &FieldDefinition) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        write_field(&conn, project_id, definition)
    }

    fn delete_field(&self, field_id: &FieldId) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        let id = field_id.to_string();
        conn.execute("DELETE FROM card_values WHERE field_id = ?1", params![id])?;
        conn.execute("DELETE FROM field_definitions WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Views ────────────────────────────────────────────────────────

    fn put_view(&self, project_id: ProjectId, view: &ViewMode) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        write_view(&conn, project_id, view)
    }

    fn delete_view(&self, view_id: &ViewId) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        conn.execute("DELETE FROM views WHERE id = ?1", params![view_id.to_string()])?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────

    fn put_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn();
        begin_write(&conn)?;
        let id = project.id.to_string();
        conn.execute(
            "INSERT OR REPLACE INTO projects (id, name) VALUES (?1, ?2)",
            params![id, project.name],
        )?;
        conn.execute(
            "DELETE FROM card_values WHERE card_id IN (SELECT id FROM cards WHERE project_id = ?1)",
            params![id],
        )?;
        conn.execute("DELETE FROM cards WHERE project_id = ?1", params![id])?;
        conn.execute("DELETE FROM field_definitions WHERE project_id = ?1", params![id])?;
        conn.execute("DELETE FROM views WHERE project_id = ?1", params![id])?;

        for definition in &project.fields {
            write_field(&conn, project.id, definition)?;
        }
        for card in &project.cards {
            write_card(&conn, project.id, card)?;
        }
        for view in &project.views {
            write_view(&conn, project.id, view)?;
        }
        Ok(())
    }

    fn load_project(&self, project_id: ProjectId) -> Result<Project> {
        let conn = self.conn();
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM projects WHERE id = ?1",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let name = name.ok_or_else(|| EngineError::not_found("Project", project_id))?;

        let mut project = Project::new(name);
        project.id = project_id;
        project.fields = load_fields(&conn, project_id)?;
        project.cards = fetch_cards(&conn, &StorePredicate::project(project_id), &[])?;
        project.views = load_views(&conn, project_id)?;
        Ok(project)
    }

    // ── Transaction Support ──────────────────────────────────────────

    fn save(&self) -> Result<()> {
        let conn = self.conn();
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
            log::debug!("Committed staged card store writes");
        }
        Ok(())
    }

    fn discard(&self) -> Result<()> {
        let conn = self.conn();
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
            log::debug!("Rolled back staged card store writes");
        }
        Ok(())
    }
}
