//! In-memory driver for testing stages without a database server.
//!
//! [`MemoryDatabase`] holds tables behind a shared lock; every clone sees the
//! same data. [`MemoryDriver`] opens connections to it through the regular
//! [`Driver`] interface and [`MemoryDataSourceFactory`] does the same through
//! the [`DataSource`] capability used by authentication variants.
//!
//! Connections understand a small SQL subset:
//!
//! - `CREATE TABLE t (col TYPE, ...)` and `DROP TABLE [IF EXISTS] t`
//! - `INSERT INTO t [(cols)] VALUES (...), (...)`
//! - `SELECT cols|* FROM t [WHERE a = 'v' AND ...]`, including `1 = 0` probes
//! - `DELETE FROM t [WHERE ...]`
//! - existence checks against `information_schema.tables`, `user_tables`
//!   and `all_tables`
//!
//! # Example
//!
//! ```rust,ignore
//! let db = MemoryDatabase::new();
//! db.create_table("t", vec![ColumnDescriptor::new("id", SqlType::INTEGER)]);
//! db.insert("t", vec![Value::Int32(1)])?;
//!
//! let driver = MemoryDriver::with_database(db.clone());
//! let conn = driver.connect("jdbc:memory://test", &Properties::new()).await?;
//! let rows = conn.query("SELECT id FROM t").await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::{DataSource, DataSourceFactory};
use crate::connection::Connection;
use crate::descriptor::{Properties, SensitiveString};
use crate::driver::{Driver, DriverClass};
use crate::error::{Error, Result};
use crate::record::TypedValue;
use crate::types::{ColumnDescriptor, ResultSet, Row, SqlType, Value};

const CATALOG_TABLES: [&str; 3] = ["information_schema.tables", "user_tables", "all_tables"];

// ============================================================================
// Memory Database
// ============================================================================

/// A table held in memory
#[derive(Debug, Clone)]
pub struct MemoryTable {
    /// Table name as created
    pub name: String,
    /// Column metadata in declaration order
    pub columns: Vec<ColumnDescriptor>,
    /// Rows, one value per column
    pub rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, MemoryTable>,
    connect_failure: Option<String>,
    statement_failures: Vec<(String, String)>,
    connections_opened: usize,
    open_connections: usize,
    statements: Vec<String>,
    last_properties: Option<Properties>,
}

impl State {
    fn table(&self, name: &str) -> Option<&MemoryTable> {
        table_key(name).and_then(|k| self.tables.get(&k))
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut MemoryTable> {
        let key = table_key(name)?;
        self.tables.get_mut(&key)
    }
}

/// Shared in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a table
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDescriptor>) {
        let table = MemoryTable {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        };
        let key = table_key(name).unwrap_or_else(|| name.to_lowercase());
        self.state.lock().tables.insert(key, table);
    }

    /// Insert a row; values are coerced to the column types
    pub fn insert(&self, name: &str, values: Vec<Value>) -> Result<()> {
        let mut state = self.state.lock();
        let table = state
            .table_mut(name)
            .ok_or_else(|| Error::schema(format!("Table '{}' does not exist", name)))?;
        if values.len() != table.columns.len() {
            return Err(Error::schema(format!(
                "Table '{}' has {} columns, got {} values",
                name,
                table.columns.len(),
                values.len()
            )));
        }
        let row = table
            .columns
            .iter()
            .zip(values)
            .map(|(c, v)| TypedValue::new(v, c.sql_type).bind_value())
            .collect::<Result<Vec<_>>>()?;
        table.rows.push(row);
        Ok(())
    }

    /// Whether a table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().table(name).is_some()
    }

    /// Copy of a table's rows
    pub fn rows(&self, name: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .table(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of rows in a table
    pub fn row_count(&self, name: &str) -> usize {
        self.state.lock().table(name).map_or(0, |t| t.rows.len())
    }

    /// Make every following connection attempt fail
    pub fn fail_on_connect(&self, message: impl Into<String>) -> &Self {
        self.state.lock().connect_failure = Some(message.into());
        self
    }

    /// Make statements containing `pattern` (ignoring case) fail
    pub fn fail_statements_containing(
        &self,
        pattern: impl Into<String>,
        message: impl Into<String>,
    ) -> &Self {
        self.state
            .lock()
            .statement_failures
            .push((pattern.into().to_lowercase(), message.into()));
        self
    }

    /// Number of connections opened so far
    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    /// Number of connections not yet closed or dropped
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Every statement issued, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Properties passed with the most recent connection
    pub fn last_properties(&self) -> Option<Properties> {
        self.state.lock().last_properties.clone()
    }

    fn open(&self, properties: &Properties) -> Result<MemoryConnection> {
        let mut state = self.state.lock();
        if let Some(message) = &state.connect_failure {
            return Err(Error::connection(message.clone()));
        }
        state.connections_opened += 1;
        state.open_connections += 1;
        state.last_properties = Some(properties.clone());
        Ok(MemoryConnection {
            db: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn run(&self, sql: &str) -> Result<Outcome> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());

        let lowered = sql.to_lowercase();
        if let Some((_, message)) = state
            .statement_failures
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
        {
            return Err(Error::statement(message.clone(), sql));
        }

        let mut affected = 0;
        let mut last = Outcome::Count(0);
        for part in split_top_level(sql, b';') {
            if part.trim().is_empty() {
                continue;
            }
            last = execute(&mut state, part.trim(), sql)?;
            if let Outcome::Count(n) = last {
                affected += n;
            }
        }
        Ok(match last {
            Outcome::Count(_) => Outcome::Count(affected),
            rows => rows,
        })
    }
}

// ============================================================================
// Memory Driver
// ============================================================================

/// Driver opening connections to a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    db: MemoryDatabase,
    url_prefix: String,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Driver over a fresh database, accepting `jdbc:memory:` URLs
    pub fn new() -> Self {
        Self::with_database(MemoryDatabase::new())
    }

    /// Driver over an existing database
    pub fn with_database(db: MemoryDatabase) -> Self {
        Self {
            db,
            url_prefix: "jdbc:memory:".to_string(),
        }
    }

    /// Accept a different URL prefix, e.g. `jdbc:mysql:`
    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = prefix.into();
        self
    }

    /// The backing database
    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with(&self.url_prefix)
    }

    async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>> {
        if !self.accepts_url(url) {
            return Err(Error::connection(format!("Unsupported URL {}", url)));
        }
        Ok(Box::new(self.db.open(properties)?))
    }
}

/// Loadable class wrapping a [`MemoryDriver`]
#[derive(Debug, Clone)]
pub struct MemoryDriverClass {
    driver: MemoryDriver,
    class_name: String,
    failure: Option<String>,
    instantiations: Arc<AtomicUsize>,
}

impl MemoryDriverClass {
    /// Class producing clones of `driver`
    pub fn new(driver: MemoryDriver) -> Self {
        Self {
            driver,
            class_name: "io.rivven.memory.Driver".to_string(),
            failure: None,
            instantiations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the class name
    pub fn with_class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = name.into();
        self
    }

    /// Make instantiation fail
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Number of successful instantiations
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

impl DriverClass for MemoryDriverClass {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn instantiate(&self) -> Result<Arc<dyn Driver>> {
        if let Some(message) = &self.failure {
            return Err(Error::driver_load(self.class_name.clone(), message.clone()));
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.driver.clone()))
    }
}

// ============================================================================
// Memory Data Source
// ============================================================================

/// Settings applied to a [`MemoryDataSource`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DataSourceSettings {
    pub server_name: Option<String>,
    pub port: Option<u16>,
    pub database_name: Option<String>,
    pub authentication: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub msi_client_id: Option<String>,
}

/// Data source recording its settings when a connection is requested
#[derive(Debug)]
pub struct MemoryDataSource {
    db: MemoryDatabase,
    settings: DataSourceSettings,
    last: Arc<Mutex<Option<DataSourceSettings>>>,
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn set_server_name(&mut self, host: &str) {
        self.settings.server_name = Some(host.to_string());
    }

    fn set_port_number(&mut self, port: u16) {
        self.settings.port = Some(port);
    }

    fn set_database_name(&mut self, database: &str) {
        self.settings.database_name = Some(database.to_string());
    }

    fn set_authentication(&mut self, mode: &str) {
        self.settings.authentication = Some(mode.to_string());
    }

    fn set_user(&mut self, user: &str) {
        self.settings.user = Some(user.to_string());
    }

    fn set_password(&mut self, password: &SensitiveString) {
        self.settings.password = Some(password.expose_secret().to_string());
    }

    fn set_msi_client_id(&mut self, client_id: &str) {
        self.settings.msi_client_id = Some(client_id.to_string());
    }

    async fn get_connection(&self) -> Result<Box<dyn Connection>> {
        *self.last.lock() = Some(self.settings.clone());
        let mut properties = Properties::new();
        if let Some(mode) = &self.settings.authentication {
            properties.insert("authentication", mode.clone());
        }
        Ok(Box::new(self.db.open(&properties)?))
    }
}

/// Factory for [`MemoryDataSource`]s over one database
#[derive(Debug, Clone)]
pub struct MemoryDataSourceFactory {
    db: MemoryDatabase,
    last: Arc<Mutex<Option<DataSourceSettings>>>,
}

impl MemoryDataSourceFactory {
    /// Factory over `db`
    pub fn new(db: MemoryDatabase) -> Self {
        Self {
            db,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Settings of the most recent connection request
    pub fn last_settings(&self) -> Option<DataSourceSettings> {
        self.last.lock().clone()
    }
}

impl DataSourceFactory for MemoryDataSourceFactory {
    fn class_name(&self) -> &str {
        "io.rivven.memory.DataSource"
    }

    fn create(&self) -> Result<Box<dyn DataSource>> {
        Ok(Box::new(MemoryDataSource {
            db: self.db.clone(),
            settings: DataSourceSettings::default(),
            last: Arc::clone(&self.last),
        }))
    }
}

// ============================================================================
// Memory Connection
// ============================================================================

/// Connection to a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self, sql: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::statement("Connection is closed", sql));
        }
        Ok(())
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.db.state.lock();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        self.ensure_open(sql)?;
        match self.db.run(sql)? {
            Outcome::Rows(result) => Ok(result),
            Outcome::Count(_) => Err(Error::statement("Statement did not return a result set", sql)),
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open(sql)?;
        match self.db.run(sql)? {
            Outcome::Rows(result) => Ok(result.len() as u64),
            Outcome::Count(n) => Ok(n),
        }
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }
}

// ============================================================================
// Statement interpreter
// ============================================================================

enum Outcome {
    Rows(ResultSet),
    Count(u64),
}

fn execute(state: &mut State, sql: &str, original: &str) -> Result<Outcome> {
    if let Some(rest) = strip_keyword(sql, "SELECT") {
        select(state, rest, original).map(Outcome::Rows)
    } else if let Some(rest) = strip_keyword(sql, "INSERT") {
        let rest = strip_keyword(rest, "INTO").ok_or_else(|| syntax(original))?;
        insert(state, rest, original).map(Outcome::Count)
    } else if let Some(rest) = strip_keyword(sql, "DELETE") {
        let rest = strip_keyword(rest, "FROM").ok_or_else(|| syntax(original))?;
        delete(state, rest, original).map(Outcome::Count)
    } else if let Some(rest) = strip_keyword(sql, "CREATE") {
        let rest = strip_keyword(rest, "TABLE").ok_or_else(|| syntax(original))?;
        create(state, rest, original).map(|_| Outcome::Count(0))
    } else if let Some(rest) = strip_keyword(sql, "DROP") {
        let rest = strip_keyword(rest, "TABLE").ok_or_else(|| syntax(original))?;
        drop_table(state, rest, original).map(|_| Outcome::Count(0))
    } else {
        Err(Error::statement("Unsupported statement", original))
    }
}

fn select(state: &State, rest: &str, sql: &str) -> Result<ResultSet> {
    let from = find_keyword(rest, "FROM").ok_or_else(|| syntax(sql))?;
    let items = split_top_level(&rest[..from], b',');
    let (table_name, filter) = split_where(&rest[from + 4..]);

    if CATALOG_TABLES.contains(&unquote_path(table_name).as_str()) {
        return catalog_lookup(state, filter, sql);
    }

    let table = state
        .table(table_name)
        .ok_or_else(|| missing_table(table_name, sql))?;
    let matcher = Filter::parse(filter, table, sql)?;

    let mut columns = Vec::new();
    let mut sources = Vec::new();
    for item in items {
        let item = item.trim();
        if item == "*" {
            for (i, c) in table.columns.iter().enumerate() {
                columns.push(c.clone());
                sources.push(Projection::Column(i));
            }
        } else if let Some(literal) = parse_literal(item) {
            columns.push(ColumnDescriptor::new(item, literal.natural_type()));
            sources.push(Projection::Literal(literal));
        } else {
            let name = unquote(item);
            let index = table.column_index(&name).ok_or_else(|| {
                Error::statement(format!("Unknown column '{}' in field list", name), sql)
            })?;
            let mut column = table.columns[index].clone();
            column.name = name;
            columns.push(column);
            sources.push(Projection::Column(index));
        }
    }

    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    let rows = table
        .rows
        .iter()
        .filter(|row| matcher.matches(row))
        .map(|row| {
            let values = sources
                .iter()
                .map(|p| match p {
                    Projection::Column(i) => row[*i].clone(),
                    Projection::Literal(v) => v.clone(),
                })
                .collect();
            Row::new(names.clone(), values)
        })
        .collect();

    Ok(ResultSet::new(columns, rows))
}

fn catalog_lookup(state: &State, filter: Option<&str>, sql: &str) -> Result<ResultSet> {
    let mut wanted = None;
    for condition in filter.map(split_conditions).unwrap_or_default() {
        let (lhs, rhs) = split_condition(condition, sql)?;
        if unquote(lhs).eq_ignore_ascii_case("table_name") {
            wanted = parse_literal(rhs).and_then(|v| v.as_string());
        }
    }
    let wanted = wanted.ok_or_else(|| Error::statement("Catalog query needs a table_name", sql))?;

    let columns = vec![ColumnDescriptor::new("1", SqlType::INTEGER)];
    let rows = if state.table(&wanted).is_some() {
        vec![Row::new(vec!["1".to_string()], vec![Value::Int32(1)])]
    } else {
        Vec::new()
    };
    Ok(ResultSet::new(columns, rows))
}

fn insert(state: &mut State, rest: &str, sql: &str) -> Result<u64> {
    let values_at = find_keyword(rest, "VALUES").ok_or_else(|| syntax(sql))?;
    let head = rest[..values_at].trim();
    let (table_name, listed) = match head.find('(') {
        Some(open) => {
            let inner = head[open + 1..].trim_end().trim_end_matches(')');
            let names: Vec<String> = split_top_level(inner, b',').into_iter().map(unquote).collect();
            (head[..open].trim(), Some(names))
        }
        None => (head, None),
    };

    let table = state
        .table_mut(table_name)
        .ok_or_else(|| missing_table(table_name, sql))?;

    let targets: Vec<usize> = match &listed {
        Some(names) => names
            .iter()
            .map(|n| {
                table.column_index(n).ok_or_else(|| {
                    Error::statement(format!("Unknown column '{}' in field list", n), sql)
                })
            })
            .collect::<Result<_>>()?,
        None => (0..table.columns.len()).collect(),
    };

    let mut inserted = 0;
    for tuple in split_top_level(&rest[values_at + 6..], b',') {
        let tuple = tuple.trim();
        let inner = tuple
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(|| syntax(sql))?;
        let literals = split_top_level(inner, b',');
        if literals.len() != targets.len() {
            return Err(Error::statement("Column count doesn't match value count", sql));
        }

        let mut row = vec![Value::Null; table.columns.len()];
        for (&index, literal) in targets.iter().zip(literals) {
            let value = parse_literal(literal).ok_or_else(|| syntax(sql))?;
            row[index] = TypedValue::new(value, table.columns[index].sql_type)
                .bind_value()
                .map_err(|e| Error::statement_with_source("Invalid value", sql, e))?;
        }
        table.rows.push(row);
        inserted += 1;
    }
    Ok(inserted)
}

fn delete(state: &mut State, rest: &str, sql: &str) -> Result<u64> {
    let (table_name, filter) = split_where(rest);
    let table = state
        .table_mut(table_name)
        .ok_or_else(|| missing_table(table_name, sql))?;
    let matcher = Filter::parse(filter, table, sql)?;
    let before = table.rows.len();
    table.rows.retain(|row| !matcher.matches(row));
    Ok((before - table.rows.len()) as u64)
}

fn create(state: &mut State, rest: &str, sql: &str) -> Result<()> {
    let (rest, if_not_exists) = match strip_keyword(rest, "IF") {
        Some(r) => (
            strip_keyword(r, "NOT")
                .and_then(|r| strip_keyword(r, "EXISTS"))
                .ok_or_else(|| syntax(sql))?,
            true,
        ),
        None => (rest, false),
    };
    let open = rest.find('(').ok_or_else(|| syntax(sql))?;
    let close = rest.rfind(')').ok_or_else(|| syntax(sql))?;
    let name = unquote_path(&rest[..open]);

    if state.table(&name).is_some() {
        return if if_not_exists {
            Ok(())
        } else {
            Err(Error::statement(format!("Table '{}' already exists", name), sql))
        };
    }

    let mut columns = Vec::new();
    for definition in split_top_level(&rest[open + 1..close], b',') {
        let mut tokens = definition.split_whitespace();
        let Some(column) = tokens.next() else {
            continue;
        };
        if ["PRIMARY", "CONSTRAINT", "UNIQUE", "KEY", "FOREIGN"]
            .iter()
            .any(|k| column.eq_ignore_ascii_case(k))
        {
            continue;
        }
        let type_name = tokens
            .take_while(|t| {
                !["NOT", "NULL", "PRIMARY", "DEFAULT", "UNIQUE", "REFERENCES"]
                    .iter()
                    .any(|k| t.eq_ignore_ascii_case(k))
            })
            .collect::<Vec<_>>()
            .join(" ");
        columns.push(
            ColumnDescriptor::new(unquote(column), SqlType::from_type_name(&type_name))
                .with_type_name(type_name),
        );
    }

    let key = table_key(&name).ok_or_else(|| syntax(sql))?;
    state.tables.insert(
        key,
        MemoryTable {
            name,
            columns,
            rows: Vec::new(),
        },
    );
    Ok(())
}

fn drop_table(state: &mut State, rest: &str, sql: &str) -> Result<()> {
    let (rest, if_exists) = match strip_keyword(rest, "IF") {
        Some(r) => (strip_keyword(r, "EXISTS").ok_or_else(|| syntax(sql))?, true),
        None => (rest, false),
    };
    let removed = table_key(rest).and_then(|k| state.tables.remove(&k));
    if removed.is_none() && !if_exists {
        return Err(missing_table(rest, sql));
    }
    Ok(())
}

enum Projection {
    Column(usize),
    Literal(Value),
}

enum Condition {
    Constant(bool),
    Equals(usize, Value),
}

struct Filter(Vec<Condition>);

impl Filter {
    fn parse(filter: Option<&str>, table: &MemoryTable, sql: &str) -> Result<Self> {
        let mut conditions = Vec::new();
        for condition in filter.map(split_conditions).unwrap_or_default() {
            let (lhs, rhs) = split_condition(condition, sql)?;
            let rhs = parse_literal(rhs).ok_or_else(|| syntax(sql))?;
            let parsed = match parse_literal(lhs) {
                Some(lhs) => Condition::Constant(literal_equals(&lhs, &rhs)),
                None => {
                    let name = unquote(lhs);
                    let index = table.column_index(&name).ok_or_else(|| {
                        Error::statement(format!("Unknown column '{}' in where clause", name), sql)
                    })?;
                    Condition::Equals(index, rhs)
                }
            };
            conditions.push(parsed);
        }
        Ok(Self(conditions))
    }

    fn matches(&self, row: &[Value]) -> bool {
        self.0.iter().all(|c| match c {
            Condition::Constant(b) => *b,
            Condition::Equals(i, v) => literal_equals(&row[*i], v),
        })
    }
}

fn literal_equals(value: &Value, literal: &Value) -> bool {
    if value.is_null() {
        return false;
    }
    match literal {
        Value::Null => false,
        Value::String(s) => value.as_string().as_deref() == Some(s.as_str()),
        Value::Bool(b) => value.as_bool() == Some(*b),
        other => matches!((value.as_f64(), other.as_f64()), (Some(a), Some(b)) if a == b),
    }
}

fn parse_literal(token: &str) -> Option<Value> {
    let t = token.trim();
    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
        return Some(Value::String(t[1..t.len() - 1].replace("''", "'")));
    }
    if t.eq_ignore_ascii_case("NULL") {
        return Some(Value::Null);
    }
    if t.eq_ignore_ascii_case("TRUE") || t.eq_ignore_ascii_case("FALSE") {
        return Some(Value::Bool(t.eq_ignore_ascii_case("TRUE")));
    }
    if !t.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
        return None;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Value::Int64(n));
    }
    t.parse::<f64>().ok().map(Value::Float64)
}

fn split_where(rest: &str) -> (&str, Option<&str>) {
    match find_keyword(rest, "WHERE") {
        Some(at) => (rest[..at].trim(), Some(rest[at + 5..].trim())),
        None => (rest.trim(), None),
    }
}

fn split_conditions(filter: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = filter;
    while let Some(at) = find_keyword(rest, "AND") {
        parts.push(rest[..at].trim());
        rest = &rest[at + 3..];
    }
    parts.push(rest.trim());
    parts
}

fn split_condition<'a>(condition: &'a str, sql: &str) -> Result<(&'a str, &'a str)> {
    let parts = split_top_level(condition, b'=');
    match parts.as_slice() {
        [lhs, rhs] => Ok((lhs.trim(), rhs.trim())),
        _ => Err(syntax(sql)),
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let sql = sql.trim_start();
    let head = sql.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &sql[keyword.len()..];
    match rest.as_bytes().first() {
        None => Some(rest),
        Some(b) if !is_word_byte(*b) => Some(rest.trim_start()),
        Some(_) => None,
    }
}

/// Byte offset of `keyword` outside string literals, on word boundaries
fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let upper = sql.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let kw = keyword.as_bytes();
    let mut in_quote = false;
    for i in 0..bytes.len() {
        if bytes[i] == b'\'' {
            in_quote = !in_quote;
            continue;
        }
        if in_quote || !bytes[i..].starts_with(kw) {
            continue;
        }
        let before = i == 0 || !is_word_byte(bytes[i - 1]);
        let after = bytes.get(i + kw.len()).map_or(true, |b| !is_word_byte(*b));
        if before && after {
            return Some(i);
        }
    }
    None
}

/// Split on `sep` outside string literals and parentheses
fn split_top_level(s: &str, sep: u8) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            _ if b == sep && !in_quote && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn unquote(identifier: &str) -> String {
    identifier
        .trim()
        .trim_matches(|c| matches!(c, '`' | '"' | '[' | ']'))
        .to_string()
}

fn unquote_path(name: &str) -> String {
    name.trim()
        .split('.')
        .map(unquote)
        .collect::<Vec<_>>()
        .join(".")
        .to_lowercase()
}

/// Lookup key: the unqualified table name, lower-cased
fn table_key(name: &str) -> Option<String> {
    unquote_path(name)
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn missing_table(name: &str, sql: &str) -> Error {
    Error::statement(format!("Table '{}' doesn't exist", name.trim()), sql)
}

fn syntax(sql: &str) -> Error {
    Error::statement("Syntax error", sql)
}
