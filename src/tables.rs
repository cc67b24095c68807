// ABOUTME: Ordered table descriptors for the learning application schema
// ABOUTME: Keeps parents before children so foreign keys resolve during copy

use anyhow::{bail, Result};
use serde::Serialize;

/// Tables in foreign-key order: every table appears after the tables it references.
pub const DEFAULT_TABLE_ORDER: &[&str] = &[
    "users",
    "topics",
    "audibles",
    "flashcards",
    "quiz_questions",
    "user_progress",
    "user_flashcards",
    "user_quiz_scores",
    "user_streaks",
    "user_achievements",
    "storage_objects",
];

/// Column used as the upsert conflict key when a table does not override it.
pub const DEFAULT_CONFLICT_KEY: &str = "id";

/// A table to migrate and its position in the dependency order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub rank: usize,
    pub conflict_key: Vec<String>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, rank: usize) -> Self {
        Self {
            name: name.into(),
            rank,
            conflict_key: vec![DEFAULT_CONFLICT_KEY.to_string()],
        }
    }

    pub fn with_conflict_key(mut self, columns: Vec<String>) -> Self {
        if !columns.is_empty() {
            self.conflict_key = columns;
        }
        self
    }
}

/// The fixed table list of the learning application, ranked by position
pub fn default_tables() -> Vec<TableDescriptor> {
    DEFAULT_TABLE_ORDER
        .iter()
        .enumerate()
        .map(|(rank, name)| TableDescriptor::new(*name, rank))
        .collect()
}

/// Build descriptors from an explicit ordered list of `(name, conflict_key)` pairs
///
/// The order given is taken as the dependency order. Names are validated and
/// duplicates rejected.
pub fn tables_from_order(entries: Vec<(String, Vec<String>)>) -> Result<Vec<TableDescriptor>> {
    let mut tables: Vec<TableDescriptor> = Vec::with_capacity(entries.len());

    for (rank, (name, conflict_key)) in entries.into_iter().enumerate() {
        validate_table_name(&name)?;
        for column in &conflict_key {
            validate_table_name(column)?;
        }
        if tables.iter().any(|t| t.name == name) {
            bail!("Table '{}' is listed more than once", name);
        }
        tables.push(TableDescriptor::new(name, rank).with_conflict_key(conflict_key));
    }

    if tables.is_empty() {
        bail!("Table list cannot be empty");
    }

    Ok(tables)
}

/// Narrow the ordered table list without ever reordering it
///
/// `include` keeps only the named tables; `exclude` drops the named tables.
/// Naming a table that is not in the list is a configuration error. Ranks are
/// preserved from the full list.
///
/// # Examples
///
/// ```
/// # use pg_table_migrator::tables::{default_tables, select_tables};
/// let all = default_tables();
/// let include = vec!["flashcards".to_string(), "users".to_string()];
/// let picked = select_tables(&all, Some(include.as_slice()), None).unwrap();
/// let names: Vec<_> = picked.iter().map(|t| t.name.as_str()).collect();
/// assert_eq!(names, vec!["users", "flashcards"]);
/// ```
pub fn select_tables(
    all: &[TableDescriptor],
    include: Option<&[String]>,
    exclude: Option<&[String]>,
) -> Result<Vec<TableDescriptor>> {
    for name in include.unwrap_or_default().iter().chain(exclude.unwrap_or_default()) {
        if !all.iter().any(|t| &t.name == name) {
            bail!(
                "Unknown table '{}'. Known tables: {}",
                name,
                all.iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    let selected: Vec<TableDescriptor> = all
        .iter()
        .filter(|t| include.map_or(true, |names| names.contains(&t.name)))
        .filter(|t| !exclude.map_or(false, |names| names.contains(&t.name)))
        .cloned()
        .collect();

    if selected.is_empty() {
        bail!("Table selection is empty; nothing to migrate");
    }

    Ok(selected)
}

/// Validate a table or column name before it is spliced into SQL or a REST path
///
/// Only ASCII letters, digits and underscores are accepted, 1 to 63 characters.
///
/// # Examples
///
/// ```
/// # use pg_table_migrator::tables::validate_table_name;
/// assert!(validate_table_name("user_quiz_scores").is_ok());
/// assert!(validate_table_name("users; DROP TABLE users;").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Table name cannot be empty");
    }

    if name.len() > 63 {
        bail!("Table name too long (max 63 characters): {}", name);
    }

    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_')
    {
        bail!(
            "Invalid table name '{}': contains invalid character '{}'. \
             Only alphanumeric characters and underscores are allowed.",
            crate::utils::sanitize_identifier(name),
            ch.escape_default()
        );
    }

    Ok(())
}
