//! Persistent store boundary
//!
//! Sessions talk to the account and character stores only through the
//! [`Database`] trait:
//! - `execute` for fire-and-forget writes
//! - `query` for small fixed-cost lookups
//! - `async_query` for anything that could stall a tick; the result is
//!   collected later through [`callback::QueryCallbacks`]
//!
//! Statements are a typed enum rather than SQL text; the store decides how
//! each one maps onto its schema.

pub mod callback;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::DatabaseError;

pub use callback::{query_channel, QueryFuture, QueryPromise};

/// Number of account data slots
pub const NUM_ACCOUNT_DATA_TYPES: usize = 8;

/// Number of tutorial flag words
pub const MAX_ACCOUNT_TUTORIAL_VALUES: usize = 8;

/// Statements the session layer issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Record a slow opcode handler for offline analysis
    InsSlowOpcode { account_id: u32, opcode: u16, elapsed_ms: u64 },
    UpdAccountOnline { account_id: u32, online: bool },
    UpdCharacterAccountOffline { account_id: u32 },
    RepAccountData { account_id: u32, data_type: u8, time: u64, data: String },
    RepPlayerAccountData { guid: u32, data_type: u8, time: u64, data: String },
    SelAccountData { account_id: u32 },
    SelPlayerAccountData { guid: u32 },
    SelTutorials { account_id: u32 },
    InsTutorials { account_id: u32, flags: [u32; MAX_ACCOUNT_TUTORIAL_VALUES] },
    UpdTutorials { account_id: u32, flags: [u32; MAX_ACCOUNT_TUTORIAL_VALUES] },
    SelCharEnum { account_id: u32 },
}

impl Statement {
    /// Stable statement name, used for logging and canned results
    pub fn name(&self) -> &'static str {
        match self {
            Statement::InsSlowOpcode { .. } => "INS_SLOW_OPCODE",
            Statement::UpdAccountOnline { .. } => "UPD_ACCOUNT_ONLINE",
            Statement::UpdCharacterAccountOffline { .. } => "UPD_ACCOUNT_ONLINE_CHARACTERS",
            Statement::RepAccountData { .. } => "REP_ACCOUNT_DATA",
            Statement::RepPlayerAccountData { .. } => "REP_PLAYER_ACCOUNT_DATA",
            Statement::SelAccountData { .. } => "SEL_ACCOUNT_DATA",
            Statement::SelPlayerAccountData { .. } => "SEL_PLAYER_ACCOUNT_DATA",
            Statement::SelTutorials { .. } => "SEL_TUTORIALS",
            Statement::InsTutorials { .. } => "INS_TUTORIALS",
            Statement::UpdTutorials { .. } => "UPD_TUTORIALS",
            Statement::SelCharEnum { .. } => "SEL_CHAR_ENUM",
        }
    }
}

/// One column value
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Field {
    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Field::UInt(v) => Some(*v),
            Field::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One result row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<Field>,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn get(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn u64_at(&self, index: usize) -> Result<u64, DatabaseError> {
        self.get(index)
            .and_then(Field::as_u64)
            .ok_or(DatabaseError::ColumnType { index, expected: "unsigned integer" })
    }

    pub fn u32_at(&self, index: usize) -> Result<u32, DatabaseError> {
        let value = self.u64_at(index)?;
        u32::try_from(value).map_err(|_| DatabaseError::ColumnType { index, expected: "u32" })
    }

    pub fn str_at(&self, index: usize) -> Result<&str, DatabaseError> {
        self.get(index)
            .and_then(Field::as_str)
            .ok_or(DatabaseError::ColumnType { index, expected: "text" })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Rows returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Statements committed together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    statements: Vec<Statement>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Store used by sessions
pub trait Database: Send + Sync {
    /// Queue a write; never blocks the caller
    fn execute(&self, statement: Statement);

    /// Run a small fixed-cost lookup synchronously
    fn query(&self, statement: Statement) -> Result<QueryResult, DatabaseError>;

    /// Start a lookup whose result is collected later
    fn async_query(&self, statement: Statement) -> QueryFuture;

    /// Commit statements atomically
    fn commit(&self, transaction: Transaction);
}

/// In-process store
///
/// Records every write and answers lookups from canned results keyed by
/// statement name. Used by the development server and by tests.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    executed: Mutex<Vec<Statement>>,
    results: Mutex<HashMap<&'static str, QueryResult>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every future lookup named `name` with `result`
    pub fn set_result(&self, name: &'static str, result: QueryResult) {
        self.results.lock().insert(name, result);
    }

    /// Writes seen so far, oldest first
    pub fn executed(&self) -> Vec<Statement> {
        self.executed.lock().clone()
    }

    fn canned(&self, statement: &Statement) -> QueryResult {
        self.results
            .lock()
            .get(statement.name())
            .cloned()
            .unwrap_or_default()
    }
}

impl Database for MemoryDatabase {
    fn execute(&self, statement: Statement) {
        debug!(statement = statement.name(), "Executing statement");
        self.executed.lock().push(statement);
    }

    fn query(&self, statement: Statement) -> Result<QueryResult, DatabaseError> {
        Ok(self.canned(&statement))
    }

    fn async_query(&self, statement: Statement) -> QueryFuture {
        let (promise, future) = query_channel();
        promise.fulfill(Ok(self.canned(&statement)));
        future
    }

    fn commit(&self, transaction: Transaction) {
        let mut executed = self.executed.lock();
        executed.extend(transaction.statements);
    }
}
