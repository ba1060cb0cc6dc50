use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::configuration::{Configuration, AUTO_GENERATE_TABLE_NAME, MAINTENANCE_DATABASE};
use crate::error::BenchError;
use crate::executor::{format_args, Connector, ExecError, SqlArg, SqlExecutor};
use crate::recorder::{Recorder, Report};
use crate::workload::{new_rng, wall_clock_seed, SchemaStatements, WorkloadGenerator};

/// How often progress is sampled during the run.
pub const PROGRESS_PERIOD: Duration = Duration::from_secs(1);

/// A snapshot of a running benchmark.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub elapsed: Duration,
    /// Agents which have not finished yet.
    pub active_agents: usize,
    /// Measured executions so far.
    pub executions: u64,
    /// Executions per second since the previous snapshot.
    pub rate: f64,
}

/// Receives progress snapshots while the agents run.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &Progress);

    /// Called once, after the last snapshot.
    fn finish(&self) {}
}

// Everything the teardown needs, whatever phase the run stopped in
struct RunState {
    agents: Vec<Agent>,
    recorder: Option<Arc<Recorder>>,
    created_database: bool,
}

/// Drives a whole benchmark: setup, pre-population, the timed run
/// and teardown.
pub struct Task {
    config: Arc<Configuration>,
    connector: Arc<dyn Connector>,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl Task {
    pub fn new(config: Configuration, connector: Arc<dyn Connector>) -> Result<Self, BenchError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
            reporter: None,
        })
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Runs the benchmark to completion.
    ///
    /// When `interrupt` resolves, in-flight work is cancelled, teardown
    /// still happens and the run fails with `BenchError::Interrupted`.
    pub async fn run<I>(&self, interrupt: I) -> Result<Report, BenchError>
    where
        I: Future<Output = ()> + Send + 'static,
    {
        let root = CancellationToken::new();
        let interrupted = Arc::new(AtomicBool::new(false));

        let watcher = {
            let root = root.clone();
            let interrupted = Arc::clone(&interrupted);
            tokio::task::spawn(async move {
                tokio::select! {
                    _ = root.cancelled() => {}
                    _ = interrupt => {
                        warn!("interrupted, stopping");
                        interrupted.store(true, Ordering::SeqCst);
                        root.cancel();
                    }
                }
            })
        };

        let mut state = RunState {
            agents: (0..self.config.agents)
                .map(|id| Agent::new(id, Arc::clone(&self.config), Arc::clone(&self.connector)))
                .collect(),
            recorder: None,
            created_database: false,
        };

        let result = self.execute(&mut state, &root).await;

        self.teardown(&mut state).await;

        // Releases the watcher if the interrupt never came
        root.cancel();
        if let Err(err) = watcher.await {
            warn!(error = %err, "interrupt watcher failed");
        }

        if interrupted.load(Ordering::SeqCst) {
            return Err(BenchError::Interrupted);
        }
        result?;

        let recorder = state
            .recorder
            .context("the run finished without a recorder")?;
        let mut report = recorder.report();
        report.configuration = Some((*self.config).clone());
        Ok(report)
    }

    async fn execute(&self, state: &mut RunState, root: &CancellationToken) -> Result<(), BenchError> {
        info!(database = %self.config.database, "setting up the database");
        self.create_database(state, root).await?;
        check_interrupted(root)?;

        let mut conn = self.connect(&self.config.database).await?;
        let ids = self.setup_schema(conn.as_mut(), root).await;
        close_quietly(conn.as_mut()).await;
        let ids = ids?;
        check_interrupted(root)?;

        info!(agents = self.config.agents, "preparing agents");
        for agent in &mut state.agents {
            agent.prepare(root, &ids).await?;
            check_interrupted(root)?;
        }

        info!("starting the benchmark");
        self.run_agents(state, root).await?;
        check_interrupted(root)?;
        info!("benchmark finished");
        Ok(())
    }

    async fn connect(&self, database: &str) -> Result<Box<dyn SqlExecutor>, BenchError> {
        self.connector
            .connect(database)
            .await
            .with_context(|| format!("Failed to open/ping DB (database={database})"))
            .map_err(BenchError::Connection)
    }

    // A missing database is created even when reusing an existing one
    // was asked for; it is just never dropped then
    async fn create_database(&self, state: &mut RunState, root: &CancellationToken) -> Result<(), BenchError> {
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        let result = self.create_database_with(conn.as_mut(), root).await;
        close_quietly(conn.as_mut()).await;

        state.created_database = result? && !self.config.use_existing_database;
        Ok(())
    }

    // Returns true if the database was created by this run
    async fn create_database_with(
        &self,
        conn: &mut dyn SqlExecutor,
        root: &CancellationToken,
    ) -> Result<bool, BenchError> {
        let database = quote_identifier(&self.config.database);

        if self.config.drop_existing_database {
            info!(database = %self.config.database, "dropping the existing database");
            exec(conn, root, &format!("DROP DATABASE IF EXISTS {database}")).await?;
        }

        let existing = conn
            .query_row(
                root,
                "SELECT datname FROM pg_database WHERE datname = $1",
                &[SqlArg::Text(self.config.database.clone())],
            )
            .await
            .map_err(|err| statement_error(err, "Failed to look up the database".to_string()))?;

        if existing.is_some() {
            info!(database = %self.config.database, "using the existing database");
            return Ok(false);
        }

        exec(conn, root, &format!("CREATE DATABASE {database}")).await?;
        Ok(true)
    }

    // Creates the tables, pre-populates them and returns the ids the
    // agents should work on
    async fn setup_schema(
        &self,
        conn: &mut dyn SqlExecutor,
        root: &CancellationToken,
    ) -> Result<Vec<String>, BenchError> {
        if !self.config.creates.is_empty() {
            for stmt in &self.config.creates {
                exec(conn, root, stmt).await?;
            }
            return Ok(Vec::new());
        }

        let schema = SchemaStatements::new(&self.config.workload);
        exec(conn, root, &SchemaStatements::drop_table()).await?;
        exec(conn, root, &schema.create_table).await?;
        for stmt in &schema.create_indexes {
            exec(conn, root, stmt).await?;
        }

        self.prepopulate(root).await?;
        check_interrupted(root)?;

        if !self.config.workload.load_type.requires_ids() {
            return Ok(Vec::new());
        }
        if self.connector.is_dry_run() {
            // Nothing was inserted; hand out placeholders of the right count
            let count = self.config.pre_populated_rows as usize * self.config.agents;
            return Ok(vec![String::new(); count]);
        }

        let ids = conn
            .query(root, &format!("SELECT id::text FROM {AUTO_GENERATE_TABLE_NAME}"), &[])
            .await
            .map_err(|err| statement_error(err, "Failed to read the pre-populated ids".to_string()))?;
        debug!(count = ids.len(), "collected ids");
        Ok(ids)
    }

    async fn prepopulate(&self, root: &CancellationToken) -> Result<(), BenchError> {
        let rows = self.config.pre_populated_rows;
        if rows == 0 {
            return Ok(());
        }
        info!(rows, agents = self.config.agents, "pre-populating the table");

        let cancel = root.child_token();
        let workload = Arc::new(self.config.workload.clone());
        let futures = (0..self.config.agents).map(|id| {
            let connector = Arc::clone(&self.connector);
            let database = self.config.database.clone();
            let workload = Arc::clone(&workload);
            let cancel = cancel.clone();
            async move {
                let rng = new_rng(wall_clock_seed() ^ (id as u64).rotate_left(32));
                let generator = WorkloadGenerator::for_inserts(workload, rng);
                let result = insert_rows(connector, &database, generator, rows, &cancel).await;
                ((), result.map_err(|err| err.context(format!("Failed to pre-populate (agent id={id})"))))
            }
        });

        let (_, result) = fan_out(futures, &cancel).await;
        result.map_err(BenchError::Statement)
    }

    async fn run_agents(&self, state: &mut RunState, root: &CancellationToken) -> Result<(), BenchError> {
        let recorder = Arc::new(Recorder::start(self.config.agents * 3));
        state.recorder = Some(Arc::clone(&recorder));

        let cancel = root.child_token();
        let finished = Arc::new(AtomicUsize::new(0));

        let sampler = tokio::task::spawn(sample_progress(
            self.reporter.clone(),
            Arc::clone(&recorder),
            Arc::clone(&finished),
            self.config.agents,
            cancel.clone(),
        ));

        let deadline = self.config.max_duration.map(|duration| {
            let cancel = cancel.clone();
            tokio::task::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        info!(?duration, "maximum duration elapsed");
                        cancel.cancel();
                    }
                }
            })
        });

        let futures = std::mem::take(&mut state.agents).into_iter().map(|mut agent| {
            let recorder = Arc::clone(&recorder);
            let finished = Arc::clone(&finished);
            let cancel = cancel.clone();
            async move {
                let result = agent.run(&cancel, &recorder).await;
                finished.fetch_add(1, Ordering::Relaxed);
                (agent, result)
            }
        });

        let (mut agents, result) = fan_out(futures, &cancel).await;
        agents.sort_by_key(Agent::id);
        state.agents = agents;

        // Freezes the elapsed time before any connection is released
        recorder.close().await;

        // Stops the background tasks
        cancel.cancel();
        for handle in std::iter::once(sampler).chain(deadline) {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task failed");
            }
        }

        result.map_err(BenchError::Statement)
    }

    async fn teardown(&self, state: &mut RunState) {
        info!("tearing down");
        if let Some(recorder) = &state.recorder {
            recorder.close().await;
        }

        for agent in &mut state.agents {
            if let Err(err) = agent.close().await {
                warn!(error = %format!("{err:#}"), "failed to close an agent");
            }
        }

        if state.created_database && !self.config.no_drop_database {
            if let Err(err) = self.drop_database().await {
                warn!(error = %err, database = %self.config.database, "failed to drop the database");
            }
        }
    }

    async fn drop_database(&self) -> Result<(), BenchError> {
        info!(database = %self.config.database, "dropping the database");
        let mut conn = self.connect(MAINTENANCE_DATABASE).await?;
        // The run is over; teardown must not be cut short by the interrupt
        let never = CancellationToken::new();
        let stmt = format!("DROP DATABASE {}", quote_identifier(&self.config.database));
        let result = exec(conn.as_mut(), &never, &stmt).await;
        close_quietly(conn.as_mut()).await;
        result
    }
}

// Spawns the futures, waits for all of them and returns their outputs
// together with the first error. The first error cancels the rest.
async fn fan_out<T, F>(
    futures: impl IntoIterator<Item = F>,
    cancel: &CancellationToken,
) -> (Vec<T>, Result<()>)
where
    T: Send + 'static,
    F: Future<Output = (T, Result<()>)> + Send + 'static,
{
    let mut handles = futures
        .into_iter()
        .map(|fut| {
            let (fut, handle) = fut.remote_handle();
            tokio::task::spawn(fut);
            handle
        })
        .collect::<FuturesUnordered<_>>();

    let mut outputs = Vec::with_capacity(handles.len());
    let mut result: Result<()> = Ok(());

    while let Some((output, task_result)) = handles.next().await {
        outputs.push(output);
        if let Err(err) = task_result {
            if result.is_ok() {
                cancel.cancel();
                result = Err(err);
            } else {
                debug!(error = %format!("{err:#}"), "ignoring a subsequent failure");
            }
        }
    }

    (outputs, result)
}

async fn insert_rows(
    connector: Arc<dyn Connector>,
    database: &str,
    mut generator: WorkloadGenerator,
    rows: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut conn = connector
        .connect(database)
        .await
        .with_context(|| format!("Failed to open/ping DB (database={database})"))?;

    let mut result = Ok(());
    for _ in 0..rows {
        let (stmt, args) = generator.insert_statement();
        match conn.execute(cancel, &stmt, &args).await {
            Ok(_) => {}
            // Stopped by a failing peer or an interrupt
            Err(ExecError::Cancelled) => break,
            Err(err) => {
                result = Err(anyhow::Error::new(err).context(format!(
                    "Execute query error (query={stmt}, args={})",
                    format_args(&args)
                )));
                break;
            }
        }
    }

    close_quietly(conn.as_mut()).await;
    result
}

async fn sample_progress(
    reporter: Option<Arc<dyn ProgressReporter>>,
    recorder: Arc<Recorder>,
    finished: Arc<AtomicUsize>,
    agents: usize,
    cancel: CancellationToken,
) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(PROGRESS_PERIOD);
    // Skip the first tick, which is immediate
    ticker.tick().await;

    let mut previous = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let executions = recorder.count();
        let progress = Progress {
            elapsed: start.elapsed(),
            active_agents: agents.saturating_sub(finished.load(Ordering::Relaxed)),
            executions,
            rate: executions.saturating_sub(previous) as f64 / PROGRESS_PERIOD.as_secs_f64(),
        };
        previous = executions;

        match &reporter {
            Some(reporter) => reporter.report(&progress),
            None => debug!(?progress, "progress"),
        }
    }

    if let Some(reporter) = &reporter {
        reporter.finish();
    }
}

async fn exec(conn: &mut dyn SqlExecutor, cancel: &CancellationToken, stmt: &str) -> Result<(), BenchError> {
    conn.execute(cancel, stmt, &[])
        .await
        .map(|_| ())
        .map_err(|err| statement_error(err, format!("Failed to execute query (query={stmt})")))
}

// Only the root token reaches serial phases, so a cancellation there
// means the run was interrupted
fn statement_error(err: ExecError, context: String) -> BenchError {
    match err {
        ExecError::Cancelled => BenchError::Interrupted,
        err => BenchError::Statement(anyhow::Error::new(err).context(context)),
    }
}

async fn close_quietly(conn: &mut dyn SqlExecutor) {
    if let Err(err) = conn.close().await {
        warn!(error = %format!("{err:#}"), "failed to close a connection");
    }
}

fn check_interrupted(root: &CancellationToken) -> Result<(), BenchError> {
    if root.is_cancelled() {
        return Err(BenchError::Interrupted);
    }
    Ok(())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
