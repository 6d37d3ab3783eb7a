//! Scripted in-memory driver for unit tests.
//!
//! Records every statement it receives and answers by substring rules.
//! Later rules take precedence, and a rule may be limited to a number of
//! uses or to one database, so tests can script state transitions such as
//! a database coming online after a few polls.

use crate::catalog::ServerRecord;
use crate::core::{Row, SqlValue};
use crate::driver::{
    ColumnInfo, Connection, DatabaseHealth, DatabaseInfo, Driver, HealthReport, ServerHealth,
    TableInfo,
};
use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Answer {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    database: Option<String>,
    answer: Answer,
    remaining: Option<usize>,
}

/// One recorded statement.
#[derive(Debug, Clone)]
pub struct Executed {
    pub database: String,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    hooks: Vec<(String, Hook)>,
    executed: Vec<Executed>,
    failed_connects: Vec<String>,
    connects: usize,
}

impl State {
    fn answer(&mut self, database: &str, sql: &str) -> Option<Answer> {
        let rule = self.rules.iter_mut().rev().find(|r| {
            sql.contains(&r.pattern)
                && r.database.as_deref().map_or(true, |d| d.eq_ignore_ascii_case(database))
                && r.remaining != Some(0)
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.answer.clone())
    }
}

/// Mock [`Driver`] with shared, inspectable state.
#[derive(Clone)]
pub struct MockDriver {
    server: ServerRecord,
    state: Arc<Mutex<State>>,
}

impl MockDriver {
    pub fn new(server_id: i64) -> Self {
        Self::with_server(ServerRecord::mssql(server_id, "mock", "sa", "pw"))
    }

    pub fn with_server(server: ServerRecord) -> Self {
        Self {
            server,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn push(&self, pattern: &str, database: Option<&str>, answer: Answer, remaining: Option<usize>) {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            database: database.map(str::to_string),
            answer,
            remaining,
        });
    }

    /// Answer statements containing `pattern` with `rows`.
    pub fn on_query(&self, pattern: &str, rows: Vec<Row>) {
        self.push(pattern, None, Answer::Rows(rows), None);
    }

    /// Like [`Self::on_query`] but only for statements run in `database`.
    pub fn on_query_in(&self, database: &str, pattern: &str, rows: Vec<Row>) {
        self.push(pattern, Some(database), Answer::Rows(rows), None);
    }

    /// Answer only the next `times` matching statements.
    pub fn on_query_times(&self, pattern: &str, rows: Vec<Row>, times: usize) {
        self.push(pattern, None, Answer::Rows(rows), Some(times));
    }

    /// Affected-row count for matching non-queries.
    pub fn on_execute(&self, pattern: &str, affected: u64) {
        self.push(pattern, None, Answer::Affected(affected), None);
    }

    pub fn fail_on(&self, pattern: &str, message: &str) {
        self.push(pattern, None, Answer::Fail(message.to_string()), None);
    }

    pub fn fail_on_in(&self, database: &str, pattern: &str, message: &str) {
        self.push(pattern, Some(database), Answer::Fail(message.to_string()), None);
    }

    pub fn fail_once(&self, pattern: &str, message: &str) {
        self.push(pattern, None, Answer::Fail(message.to_string()), Some(1));
    }

    /// Call `hook` after every statement containing `pattern` is recorded.
    pub fn on_statement(&self, pattern: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .hooks
            .push((pattern.to_string(), Arc::new(hook)));
    }

    /// Refuse connections to `database`.
    pub fn fail_connect(&self, database: &str) {
        self.state
            .lock()
            .unwrap()
            .failed_connects
            .push(database.to_string());
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.sql).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.statements().iter().filter(|s| s.contains(pattern)).count()
    }

    /// Index of the first statement containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.statements().iter().position(|s| s.contains(pattern))
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn into_driver(self) -> Arc<dyn Driver> {
        Arc::new(self)
    }
}

/// Connection handed out by [`MockDriver`].
pub struct MockConnection {
    database: String,
    state: Arc<Mutex<State>>,
}

impl MockConnection {
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Answer>> {
        let (answer, hooks) = {
            let mut state = self.state.lock().unwrap();
            state.executed.push(Executed {
                database: self.database.clone(),
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            let hooks: Vec<Hook> = state
                .hooks
                .iter()
                .filter(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, hook)| hook.clone())
                .collect();
            (state.answer(&self.database, sql), hooks)
        };
        for hook in hooks {
            hook();
        }
        match answer {
            Some(Answer::Fail(message)) => Err(ProvisionError::execution(
                crate::driver::sql_context(sql),
                message,
            )),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match self.run(sql, params)? {
            Some(Answer::Rows(rows)) => Ok(rows),
            _ => Ok(Vec::new()),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self.run(sql, params)? {
            Some(Answer::Affected(n)) => Ok(n),
            Some(Answer::Rows(rows)) => Ok(rows.len() as u64),
            _ => Ok(0),
        }
    }

    async fn query_chunked(
        &mut self,
        sql: &str,
        chunk_size: usize,
        tx: mpsc::Sender<Vec<Row>>,
    ) -> Result<u64> {
        let rows = self.query(sql, &[]).await?;
        let mut sent = 0u64;
        for chunk in rows.chunks(chunk_size.max(1)) {
            if tx.send(chunk.to_vec()).await.is_err() {
                break;
            }
            sent += chunk.len() as u64;
        }
        Ok(sent)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn server(&self) -> &ServerRecord {
        &self.server
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock().unwrap();
        if state
            .failed_connects
            .iter()
            .any(|d| d.eq_ignore_ascii_case(database))
        {
            return Err(ProvisionError::connection("login failed", database));
        }
        state.connects += 1;
        Ok(Box::new(MockConnection {
            database: database.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn test_connection(&self) -> Result<String> {
        self.connect(self.server.system_db()).await?;
        Ok("Mock SQL Server".to_string())
    }

    async fn list_databases(&self, _prefix: Option<&str>) -> Result<Vec<DatabaseInfo>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, _database: &str) -> Result<Vec<TableInfo>> {
        Ok(Vec::new())
    }

    async fn list_columns(&self, _database: &str, _table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(Vec::new())
    }

    async fn get_size(&self, _database: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn check_server_health(&self) -> ServerHealth {
        ServerHealth {
            server_id: self.server.id,
            server_name: self.server.name.clone(),
            host: self.server.host.clone(),
            port: self.server.port(),
            checked_at: Utc::now(),
            report: HealthReport::default(),
        }
    }

    async fn check_database_health(&self, database: &str) -> DatabaseHealth {
        DatabaseHealth {
            db_name: database.to_string(),
            checked_at: Utc::now(),
            report: HealthReport::default(),
        }
    }
}

/// Single-column row, for scripting scalar answers.
pub fn scalar(column: &str, value: impl Into<SqlValue>) -> Row {
    Row::from_pairs([(column, value.into())])
}
