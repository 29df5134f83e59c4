//! Transaction primitives over declared collections.
//!
//! A `Tx` wraps one open SQLite transaction and exposes record-level
//! operations (get/put/add/delete) plus lazy cursors over the primary key or
//! any declared index. It never commits itself; `Database::transaction`
//! commits when the caller's closure returns `Ok`.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use tabsplit_core::error::{Result, TabsplitError};

use crate::db::sql_err;
use crate::schema::{self, extract_path, CollectionDef, Document};

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// A value an index can be positioned on.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Int(i64),
    Real(f64),
    Text(String),
}

impl IndexKey {
    fn to_sql(&self) -> SqlValue {
        match self {
            IndexKey::Int(v) => SqlValue::Integer(*v),
            IndexKey::Real(v) => SqlValue::Real(*v),
            IndexKey::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Int(value)
    }
}

impl From<u64> for IndexKey {
    fn from(value: u64) -> Self {
        IndexKey::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for IndexKey {
    fn from(value: bool) -> Self {
        IndexKey::Int(i64::from(value))
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Text(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Text(value)
    }
}

/// Timestamps are indexed as epoch milliseconds.
impl From<DateTime<Utc>> for IndexKey {
    fn from(value: DateTime<Utc>) -> Self {
        IndexKey::Int(value.timestamp_millis())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Bound {
    key: IndexKey,
    open: bool,
}

/// Bounds a cursor walk. Bounds are inclusive unless built with `below`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(key: impl Into<IndexKey>) -> Self {
        let key = key.into();
        Self {
            lower: Some(Bound {
                key: key.clone(),
                open: false,
            }),
            upper: Some(Bound { key, open: false }),
        }
    }

    pub fn at_least(key: impl Into<IndexKey>) -> Self {
        Self {
            lower: Some(Bound {
                key: key.into(),
                open: false,
            }),
            upper: None,
        }
    }

    pub fn at_most(key: impl Into<IndexKey>) -> Self {
        Self {
            lower: None,
            upper: Some(Bound {
                key: key.into(),
                open: false,
            }),
        }
    }

    pub fn below(key: impl Into<IndexKey>) -> Self {
        Self {
            lower: None,
            upper: Some(Bound {
                key: key.into(),
                open: true,
            }),
        }
    }

    pub fn between(lower: impl Into<IndexKey>, upper: impl Into<IndexKey>) -> Self {
        Self {
            lower: Some(Bound {
                key: lower.into(),
                open: false,
            }),
            upper: Some(Bound {
                key: upper.into(),
                open: false,
            }),
        }
    }
}

/// Walk order of a cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending.
    #[default]
    Next,
    /// Descending.
    Prev,
}

impl Direction {
    fn sql(self) -> &'static str {
        match self {
            Direction::Next => "ASC",
            Direction::Prev => "DESC",
        }
    }
}

/// What a cursor walks over and how.
#[derive(Debug, Clone)]
pub struct CursorSpec {
    /// `None` walks the primary key.
    pub index: Option<&'static str>,
    pub range: KeyRange,
    pub direction: Direction,
    /// Skip reading binary payloads (records come back with empty payloads).
    pub load_payload: bool,
}

impl Default for CursorSpec {
    fn default() -> Self {
        Self {
            index: None,
            range: KeyRange::all(),
            direction: Direction::Next,
            load_payload: true,
        }
    }
}

impl CursorSpec {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn on(index: &'static str) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn without_payload(mut self) -> Self {
        self.load_payload = false;
        self
    }
}

/// Returned by cursor visitors to continue or end the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    Continue,
    Stop,
}

/// Operations inside one open transaction, limited to its declared scope.
pub struct Tx<'c> {
    conn: &'c Connection,
    mode: TxMode,
    scope: Vec<&'static str>,
}

impl<'c> Tx<'c> {
    pub(crate) fn new(conn: &'c Connection, mode: TxMode, scope: Vec<&'static str>) -> Self {
        Self { conn, mode, scope }
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Fetch one record by primary key.
    pub fn get<D: Document>(&self, key: &str) -> Result<Option<D>> {
        let def = self.resolve::<D>(false)?;
        let sql = format!("SELECT doc, payload FROM {} WHERE key = ?1", def.name);
        let row: Option<(String, Option<Vec<u8>>)> = self
            .conn
            .prepare_cached(&sql)
            .map_err(sql_err("Failed to prepare get"))?
            .query_row([key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(sql_err("Failed to read record"))?;

        row.map(|(doc, payload)| decode::<D>(def, &doc, payload))
            .transpose()
    }

    /// Whether a record with this key exists, without decoding it.
    pub fn contains<D: Document>(&self, key: &str) -> Result<bool> {
        let def = self.resolve::<D>(false)?;
        let found = self
            .conn
            .prepare_cached(&format!("SELECT 1 FROM {} WHERE key = ?1", def.name))
            .map_err(sql_err("Failed to prepare lookup"))?
            .exists([key])
            .map_err(sql_err("Failed to look up record"))?;
        Ok(found)
    }

    /// Insert or overwrite a record.
    pub fn put<D: Document>(&self, doc: &D) -> Result<()> {
        self.write(doc, true).map(|_| ())
    }

    /// Insert a record if its key is free. Returns `false` when the key
    /// already exists; the stored record is left untouched.
    pub fn add<D: Document>(&self, doc: &D) -> Result<bool> {
        self.write(doc, false)
    }

    /// Delete a record by key. Returns whether it existed.
    pub fn delete<D: Document>(&self, key: &str) -> Result<bool> {
        let def = self.resolve::<D>(true)?;
        for ix in def.multi_entry_indexes() {
            self.conn
                .execute(
                    &format!("DELETE FROM {} WHERE key = ?1", def.side_table(ix)),
                    [key],
                )
                .map_err(sql_err("Failed to delete index entries"))?;
        }
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE key = ?1", def.name), [key])
            .map_err(sql_err("Failed to delete record"))?;
        Ok(removed > 0)
    }

    /// Number of records in the collection.
    pub fn count<D: Document>(&self) -> Result<u64> {
        let def = self.resolve::<D>(false)?;
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", def.name), [], |row| {
                row.get(0)
            })
            .map_err(sql_err("Failed to count records"))?;
        Ok(count.max(0) as u64)
    }

    /// Remove every record of the collection. Returns how many were removed.
    pub fn clear<D: Document>(&self) -> Result<u64> {
        let def = self.resolve::<D>(true)?;
        for ix in def.multi_entry_indexes() {
            self.conn
                .execute(&format!("DELETE FROM {}", def.side_table(ix)), [])
                .map_err(sql_err("Failed to clear index entries"))?;
        }
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {}", def.name), [])
            .map_err(sql_err("Failed to clear collection"))?;
        Ok(removed as u64)
    }

    /// Walk records in index order, calling `visit` for each until it
    /// returns `CursorStep::Stop` or the range is exhausted.
    ///
    /// Records whose indexed field is missing are not part of the index.
    /// Multi-entry indexes visit a record once per matching element.
    pub fn cursor<D, F>(&self, spec: &CursorSpec, mut visit: F) -> Result<()>
    where
        D: Document,
        F: FnMut(D) -> Result<CursorStep>,
    {
        let def = self.resolve::<D>(false)?;
        let (sql, params) = cursor_query(def, spec, false)?;
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(sql_err("Failed to open cursor"))?;
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(sql_err("Failed to open cursor"))?;

        while let Some(row) = rows.next().map_err(sql_err("Failed to advance cursor"))? {
            let doc: String = row.get(1).map_err(sql_err("Failed to read cursor row"))?;
            let payload: Option<Vec<u8>> =
                row.get(2).map_err(sql_err("Failed to read cursor row"))?;
            let record = decode::<D>(def, &doc, payload)?;
            if visit(record)? == CursorStep::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Collect every record a cursor would visit.
    pub fn collect<D: Document>(&self, spec: &CursorSpec) -> Result<Vec<D>> {
        let mut out = Vec::new();
        self.cursor(spec, |record: D| {
            out.push(record);
            Ok(CursorStep::Continue)
        })?;
        Ok(out)
    }

    /// Primary keys in cursor order, without decoding documents.
    pub fn keys<D: Document>(&self, spec: &CursorSpec) -> Result<Vec<String>> {
        let def = self.resolve::<D>(false)?;
        let (sql, params) = cursor_query(def, spec, true)?;
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(sql_err("Failed to open key cursor"))?;
        let keys = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))
            .map_err(sql_err("Failed to open key cursor"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_err("Failed to advance key cursor"))?;
        Ok(keys)
    }

    /// Bytes currently allocated by the database file.
    pub fn database_size(&self) -> Result<u64> {
        let pages: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .map_err(sql_err("Failed to read page count"))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(sql_err("Failed to read page size"))?;
        Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
    }

    fn resolve<D: Document>(&self, write: bool) -> Result<&'static CollectionDef> {
        if !self.scope.contains(&D::COLLECTION) {
            return Err(TabsplitError::Storage(format!(
                "Collection `{}` is not part of this transaction",
                D::COLLECTION
            )));
        }
        if write && self.mode == TxMode::ReadOnly {
            return Err(TabsplitError::Storage(format!(
                "Cannot write to `{}` in a read-only transaction",
                D::COLLECTION
            )));
        }
        schema::collection(D::COLLECTION)
    }

    fn write<D: Document>(&self, doc: &D, overwrite: bool) -> Result<bool> {
        let def = self.resolve::<D>(true)?;
        let key = doc.key();
        if key.is_empty() {
            return Err(TabsplitError::InvalidData(format!(
                "Record in `{}` has an empty key",
                def.name
            )));
        }

        let value = serde_json::to_value(doc)?;
        let body = value.to_string();
        let payload = if def.has_payload { doc.payload() } else { None };

        let mut columns = vec!["key".to_string(), "doc".to_string(), "payload".to_string()];
        let mut index_values = Vec::new();
        for ix in def.column_indexes() {
            columns.push(def.column(ix));
            index_values.push(
                extract_path(&value, ix.key_path)
                    .and_then(scalar)
                    .unwrap_or(SqlValue::Null),
            );
        }

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let on_conflict = if overwrite {
            let assignments = columns[1..]
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {}", assignments)
        } else {
            "DO NOTHING".to_string()
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) {}",
            def.name,
            columns.join(", "),
            placeholders,
            on_conflict
        );

        let mut params: Vec<&dyn ToSql> = vec![&key, &body, &payload];
        params.extend(index_values.iter().map(|v| v as &dyn ToSql));

        let changed = self
            .conn
            .prepare_cached(&sql)
            .map_err(sql_err("Failed to prepare write"))?
            .execute(params.as_slice())
            .map_err(sql_err("Failed to write record"))?;
        if changed == 0 {
            return Ok(false);
        }

        for ix in def.multi_entry_indexes() {
            let table = def.side_table(ix);
            self.conn
                .execute(&format!("DELETE FROM {} WHERE key = ?1", table), [key])
                .map_err(sql_err("Failed to reset index entries"))?;
            if let Some(Value::Array(items)) = extract_path(&value, ix.key_path) {
                let mut stmt = self
                    .conn
                    .prepare_cached(&format!(
                        "INSERT OR IGNORE INTO {} (key, value) VALUES (?1, ?2)",
                        table
                    ))
                    .map_err(sql_err("Failed to prepare index write"))?;
                for entry in items.iter().filter_map(scalar) {
                    stmt.execute(rusqlite::params![key, entry])
                        .map_err(sql_err("Failed to write index entry"))?;
                }
            }
        }
        Ok(true)
    }
}

/// Index representation of a JSON scalar. Non-scalars are not indexable.
pub(crate) fn scalar(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        _ => None,
    }
}

fn decode<D: Document>(def: &CollectionDef, doc: &str, payload: Option<Vec<u8>>) -> Result<D> {
    let mut record: D = serde_json::from_str(doc).map_err(|e| {
        TabsplitError::Serialization(format!("Corrupt document in `{}`: {}", def.name, e))
    })?;
    if let Some(payload) = payload {
        record.attach_payload(payload);
    }
    Ok(record)
}

fn cursor_query(
    def: &CollectionDef,
    spec: &CursorSpec,
    keys_only: bool,
) -> Result<(String, Vec<SqlValue>)> {
    let (from, column) = match spec.index {
        None => (format!("{} t", def.name), "t.key".to_string()),
        Some(name) => {
            let ix = def.index(name).ok_or_else(|| {
                TabsplitError::Storage(format!(
                    "Collection `{}` has no index `{}`",
                    def.name, name
                ))
            })?;
            if ix.multi_entry {
                (
                    format!("{} t JOIN {} m ON m.key = t.key", def.name, def.side_table(ix)),
                    "m.value".to_string(),
                )
            } else {
                (format!("{} t", def.name), format!("t.{}", def.column(ix)))
            }
        }
    };

    let select = if keys_only {
        "t.key"
    } else if spec.load_payload && def.has_payload {
        "t.key, t.doc, t.payload"
    } else {
        "t.key, t.doc, NULL"
    };

    let mut clauses = vec![format!("{} IS NOT NULL", column)];
    let mut params = Vec::new();
    if let Some(bound) = &spec.range.lower {
        params.push(bound.key.to_sql());
        let op = if bound.open { ">" } else { ">=" };
        clauses.push(format!("{} {} ?{}", column, op, params.len()));
    }
    if let Some(bound) = &spec.range.upper {
        params.push(bound.key.to_sql());
        let op = if bound.open { "<" } else { "<=" };
        clauses.push(format!("{} {} ?{}", column, op, params.len()));
    }

    let dir = spec.direction.sql();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} {dir}, t.key {dir}",
        select,
        from,
        clauses.join(" AND "),
        column
    );
    Ok((sql, params))
}
