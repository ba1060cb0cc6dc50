use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::{format_args, Connector, ExecError, SqlArg, SqlExecutor};

/// Hands out executors which print statements instead of sending them.
pub struct NoOpConnector;

#[async_trait]
impl Connector for NoOpConnector {
    async fn connect(&self, _database: &str) -> Result<Box<dyn SqlExecutor>> {
        Ok(Box::new(NoOpExecutor))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// Used for dry runs. Never touches the network.
pub struct NoOpExecutor;

fn print_statement(statement: &str, args: &[SqlArg]) {
    eprintln!("{} {}", statement, format_args(args));
}

#[async_trait]
impl SqlExecutor for NoOpExecutor {
    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<u64, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        print_statement(statement, args);
        // Without I/O there is no await point; let timers and peers run
        tokio::task::yield_now().await;
        Ok(0)
    }

    async fn query(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<Vec<String>, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        print_statement(statement, args);
        Ok(Vec::new())
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
