pub mod noop;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::configuration::Configuration;

pub use noop::NoOpConnector;
pub use postgres::PgConnector;

/// A single statement argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlArg {
    Int(i64),
    Text(String),
}

impl fmt::Display for SqlArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlArg::Int(v) => write!(f, "{v}"),
            SqlArg::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Formats a list of arguments the way they appear in error messages.
pub fn format_args(args: &[SqlArg]) -> String {
    let parts: Vec<String> = args.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

/// Why a statement execution failed.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The execution was abandoned because the cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,

    /// The execution did not finish in time.
    #[error("execution timed out")]
    Timeout,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A capability of sending statements over one connection.
///
/// Every agent exclusively owns one executor; executors are never shared.
#[async_trait]
pub trait SqlExecutor: Send {
    /// Executes the statement and returns the number of affected rows.
    ///
    /// The execution is abandoned as soon as `cancel` fires.
    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<u64, ExecError>;

    /// Runs a query and returns the first column of each row, rendered as text.
    ///
    /// Like `execute`, the query is abandoned as soon as `cancel` fires.
    async fn query(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<Vec<String>, ExecError>;

    /// Like `query`, but returns only the first row, if any.
    async fn query_row(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<Option<String>, ExecError> {
        Ok(self.query(cancel, statement, args).await?.into_iter().next())
    }

    /// Returns true if the underlying connection is already closed.
    fn is_closed(&self) -> bool;

    /// Releases the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens executors. Selected once at setup, depending on whether
/// the run is a dry run or not.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection to the given database and checks that it works.
    async fn connect(&self, database: &str) -> Result<Box<dyn SqlExecutor>>;

    /// True if executors opened by this connector do not perform any I/O.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Chooses the connector variant appropriate for the run.
pub fn make_connector(dsn: &str, config: &Configuration) -> Result<Arc<dyn Connector>> {
    if config.dry_run {
        Ok(Arc::new(NoOpConnector))
    } else {
        let connector =
            PgConnector::new(dsn)?.with_statement_timeout(config.statement_timeout);
        Ok(Arc::new(connector))
    }
}
