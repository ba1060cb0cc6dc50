use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, Statement};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Connector, ExecError, SqlArg, SqlExecutor};

type Param = Box<dyn ToSql + Sync + Send>;

// How long a shutting down connection may take before it is torn down
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Opens real PostgreSQL connections.
pub struct PgConnector {
    config: Config,
    statement_timeout: Option<Duration>,
}

impl PgConnector {
    /// Accepts both key/value (`host=... user=...`) and URL connection strings.
    pub fn new(dsn: &str) -> Result<Self> {
        let config = Config::from_str(dsn).context("Invalid connection string")?;
        Ok(Self {
            config,
            statement_timeout: None,
        })
    }

    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn SqlExecutor>> {
        let mut config = self.config.clone();
        config.dbname(database);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to database {database}"))?;

        let connection = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "connection terminated with an error");
            }
        });

        client
            .simple_query("SELECT 1")
            .await
            .with_context(|| format!("Failed to ping database {database}"))?;

        Ok(Box::new(PgExecutor {
            client: Some(client),
            connection: Some(connection),
            statements: HashMap::new(),
            statement_timeout: self.statement_timeout,
        }))
    }
}

/// An executor backed by a single tokio-postgres connection.
pub struct PgExecutor {
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
    // Prepared statements, keyed by their text. Generated workloads use
    // only a handful of distinct statements.
    statements: HashMap<String, Statement>,
    statement_timeout: Option<Duration>,
}

impl PgExecutor {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("The connection was already released"))
    }

    async fn prepared(&mut self, statement: &str) -> Result<Statement, ExecError> {
        if let Some(prepared) = self.statements.get(statement) {
            return Ok(prepared.clone());
        }
        let prepared = self.client()?.prepare(statement).await.map_err(classify)?;
        self.statements
            .insert(statement.to_string(), prepared.clone());
        Ok(prepared)
    }

    async fn execute_inner(&mut self, statement: &str, args: &[SqlArg]) -> Result<u64, ExecError> {
        if args.is_empty() {
            // The simple protocol handles BEGIN/COMMIT and multi-statement strings
            let client = self.client()?;
            client.batch_execute(statement).await.map_err(classify)?;
            return Ok(0);
        }

        let prepared = self.prepared(statement).await?;
        let params = bind_params(args, prepared.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let client = self.client()?;
        client.execute(&prepared, &refs).await.map_err(classify)
    }

    async fn query_inner(&mut self, statement: &str, args: &[SqlArg]) -> Result<Vec<String>, ExecError> {
        if args.is_empty() {
            let messages = self.client()?.simple_query(statement).await.map_err(classify)?;
            let values = messages
                .into_iter()
                .filter_map(|msg| match msg {
                    SimpleQueryMessage::Row(row) => {
                        Some(row.get(0).unwrap_or_default().to_string())
                    }
                    _ => None,
                })
                .collect();
            return Ok(values);
        }

        let prepared = self.prepared(statement).await?;
        let params = bind_params(args, prepared.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client()?.query(&prepared, &refs).await.map_err(classify)?;

        let values = rows
            .iter()
            .map(|row| row.try_get::<_, Option<String>>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    // A request abandoned on the client side keeps running on the server,
    // and the connection cannot shut down until its response arrives
    async fn cancel_on_server(&self) {
        let Some(client) = &self.client else {
            return;
        };
        let cancel_token = client.cancel_token();
        let cancel = cancel_token.cancel_query(NoTls);
        match tokio::time::timeout(CLOSE_GRACE_PERIOD, cancel).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "failed to cancel the request on the server"),
            Err(_) => tracing::debug!("cancelling the request on the server timed out"),
        }
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<u64, ExecError> {
        let timeout = self.statement_timeout;
        let result = {
            let execution = self.execute_inner(statement, args);
            guard(cancel, timeout, execution).await
        };
        if matches!(result, Err(ExecError::Cancelled | ExecError::Timeout)) {
            self.cancel_on_server().await;
        }
        result
    }

    async fn query(
        &mut self,
        cancel: &CancellationToken,
        statement: &str,
        args: &[SqlArg],
    ) -> Result<Vec<String>, ExecError> {
        let timeout = self.statement_timeout;
        let result = {
            let query = self.query_inner(statement, args);
            guard(cancel, timeout, query).await
        };
        if matches!(result, Err(ExecError::Cancelled | ExecError::Timeout)) {
            self.cancel_on_server().await;
        }
        result
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().is_none_or(Client::is_closed)
    }

    async fn close(&mut self) -> Result<()> {
        self.statements.clear();
        // Dropping the last client lets the connection task finish
        drop(self.client.take());
        if let Some(mut connection) = self.connection.take() {
            match tokio::time::timeout(CLOSE_GRACE_PERIOD, &mut connection).await {
                Ok(result) => result.context("The connection task did not finish cleanly")?,
                Err(_) => {
                    tracing::debug!("the connection did not shut down in time, aborting it");
                    connection.abort();
                }
            }
        }
        Ok(())
    }
}

// Runs a request under the optional timeout, abandoning it when `cancel` fires
async fn guard<T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    request: impl Future<Output = Result<T, ExecError>>,
) -> Result<T, ExecError> {
    let request = async {
        match timeout {
            Some(t) => tokio::time::timeout(t, request)
                .await
                .unwrap_or(Err(ExecError::Timeout)),
            None => request.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
        result = request => result,
    }
}

fn classify(err: tokio_postgres::Error) -> ExecError {
    // statement_timeout set on the server side shows up as a cancelled query
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        return ExecError::Timeout;
    }
    ExecError::Failed(err.into())
}

// Converts the arguments to the types the server inferred for the parameters.
fn bind_params(args: &[SqlArg], types: &[Type]) -> Result<Vec<Param>> {
    anyhow::ensure!(
        args.len() == types.len(),
        "The statement expects {} arguments, but {} were provided",
        types.len(),
        args.len(),
    );

    args.iter()
        .zip(types)
        .map(|(arg, ty)| bind_param(arg, ty))
        .collect()
}

fn bind_param(arg: &SqlArg, ty: &Type) -> Result<Param> {
    let param: Param = match (arg, ty) {
        (SqlArg::Int(v), &Type::INT2) => Box::new(i16::try_from(*v)?),
        (SqlArg::Int(v), &Type::INT4) => Box::new(i32::try_from(*v)?),
        (SqlArg::Int(v), &Type::INT8) => Box::new(*v),
        (SqlArg::Int(v), _) => Box::new(v.to_string()),
        (SqlArg::Text(s), &Type::INT2) => Box::new(s.parse::<i16>()?),
        (SqlArg::Text(s), &Type::INT4) => Box::new(s.parse::<i32>()?),
        (SqlArg::Text(s), &Type::INT8) => Box::new(s.parse::<i64>()?),
        (SqlArg::Text(s), &Type::UUID) => Box::new(Uuid::parse_str(s)?),
        (SqlArg::Text(s), _) => Box::new(s.clone()),
    };
    Ok(param)
}
