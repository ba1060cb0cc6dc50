use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::executor::{Connector, ExecError, SqlArg, SqlExecutor};

#[derive(Clone, Copy, Debug)]
pub enum Failure {
    /// An ordinary database error.
    Error,
    /// A timeout while the connection is still open.
    Timeout,
    /// A timeout after which the connection turns out to be closed.
    TimeoutOnClosed,
}

#[derive(Default)]
struct Journal {
    connects: Vec<String>,
    executions: Vec<(String, Vec<SqlArg>)>,
    queries: Vec<String>,
    closed: usize,
}

/// A connector whose executors record every statement and follow
/// a script of injected failures. Nothing is sent anywhere.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    journal: Arc<Mutex<Journal>>,
    refuse_connections: bool,
    latency: Duration,
    close_latency: Duration,
    // Keyed by the global execution index, counting from zero
    failures_at: HashMap<usize, Failure>,
    // Statements starting with the given prefix always fail
    failing_prefix: Option<String>,
    // Query results, keyed by statement prefix
    rows: Vec<(String, Vec<String>)>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every `close` take the given time.
    pub fn with_close_latency(mut self, latency: Duration) -> Self {
        self.close_latency = latency;
        self
    }

    pub fn fail_at(mut self, execution: usize, failure: Failure) -> Self {
        self.failures_at.insert(execution, failure);
        self
    }

    pub fn fail_statements_starting_with(mut self, prefix: &str) -> Self {
        self.failing_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_rows(mut self, prefix: &str, rows: Vec<String>) -> Self {
        self.rows.push((prefix.to_string(), rows));
        self
    }

    /// Texts of all statements which were executed, in order.
    pub fn statements(&self) -> Vec<String> {
        let journal = self.journal.lock();
        journal.executions.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn executions(&self) -> Vec<(String, Vec<SqlArg>)> {
        self.journal.lock().executions.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.journal.lock().queries.clone()
    }

    /// Databases connected to, in order.
    pub fn connects(&self) -> Vec<String> {
        self.journal.lock().connects.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.journal.lock().closed
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn SqlExecutor>> {
        anyhow::ensure!(!self.refuse_connections, "connection refused");
        self.journal.lock().connects.push(database.to_string());
        Ok(Box::new(ScriptedExecutor {
            script: self.clone(),
            closed: false,
        }))
    }
}

struct ScriptedExecutor {
    script: ScriptedConnector,
    closed: bool,
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<u64, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let index = {
            let mut journal = self.script.journal.lock();
            journal
                .executions
                .push((statement.to_string(), args.to_vec()));
            journal.executions.len() - 1
        };

        if self.script.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                _ = tokio::time::sleep(self.script.latency) => {}
            }
        }

        let prefix_failure = self
            .script
            .failing_prefix
            .as_deref()
            .is_some_and(|prefix| statement.starts_with(prefix))
            .then_some(Failure::Error);

        match self.script.failures_at.get(&index).copied().or(prefix_failure) {
            None => Ok(1),
            Some(Failure::Error) => Err(ExecError::Failed(anyhow::anyhow!("scripted failure"))),
            Some(Failure::Timeout) => Err(ExecError::Timeout),
            Some(Failure::TimeoutOnClosed) => {
                self.closed = true;
                Err(ExecError::Timeout)
            }
        }
    }

    async fn query(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        _args: &[SqlArg],
    ) -> Result<Vec<String>, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        self.script.journal.lock().queries.push(statement.to_string());
        let rows = self
            .script
            .rows
            .iter()
            .find(|(prefix, _)| statement.starts_with(prefix.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Ok(rows)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> Result<()> {
        if !self.script.close_latency.is_zero() {
            tokio::time::sleep(self.script.close_latency).await;
        }
        self.script.journal.lock().closed += 1;
        Ok(())
    }
}
