use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::configuration::Configuration;
use crate::error::BenchError;
use crate::executor::{format_args, Connector, ExecError, SqlExecutor};
use crate::recorder::{LatencySample, Recorder};
use crate::throttle::{throttle, Step};
use crate::workload::{new_rng, wall_clock_seed, WorkloadGenerator};

/// How often buffered samples are handed over to the recorder.
pub const RECORD_PERIOD: Duration = Duration::from_secs(1);

/// An independent workload driver with its own connection and generator.
pub struct Agent {
    id: usize,
    config: Arc<Configuration>,
    connector: Arc<dyn Connector>,
    executor: Option<Box<dyn SqlExecutor>>,
    generator: Option<WorkloadGenerator>,
}

impl Agent {
    pub fn new(id: usize, config: Arc<Configuration>, connector: Arc<dyn Connector>) -> Self {
        Self {
            id,
            config,
            connector,
            executor: None,
            generator: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Opens the connection, sets up the generator over a privately shuffled
    /// copy of `ids` and runs the init statements. An init statement in
    /// flight when `cancel` fires is abandoned.
    pub async fn prepare(
        &mut self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<(), BenchError> {
        let executor = self
            .connector
            .connect(&self.config.database)
            .await
            .with_context(|| {
                format!(
                    "Failed to open/ping DB (agent id={}, database={})",
                    self.id, self.config.database
                )
            })
            .map_err(BenchError::Connection)?;
        let executor = self.executor.insert(executor);

        let mut rng = new_rng(wall_clock_seed() ^ (self.id as u64).rotate_left(32));
        let mut ids = ids.to_vec();
        ids.shuffle(&mut rng);

        let workload = Arc::new(self.config.workload.clone());
        let generator = WorkloadGenerator::new(workload, ids, rng)
            .map_err(|err| {
                BenchError::Configuration(format!("{err:#} (agent id={})", self.id))
            })?;

        for stmt in generator.init_statements() {
            match executor.execute(cancel, &stmt, &[]).await {
                Ok(_) => {}
                Err(ExecError::Cancelled) => return Err(BenchError::Interrupted),
                Err(err) => {
                    let err = anyhow::Error::new(err).context(format!(
                        "Failed to execute initial query (agent id={}, query={})",
                        self.id, stmt
                    ));
                    return Err(BenchError::Statement(err));
                }
            }
        }

        self.generator = Some(generator);
        debug!(agent = self.id, "agent prepared");
        Ok(())
    }

    /// Executes statements until the query budget is exhausted, `cancel`
    /// fires, or a statement fails.
    pub async fn run(&mut self, cancel: &CancellationToken, recorder: &Recorder) -> Result<()> {
        let (executor, generator) = match (self.executor.as_mut(), self.generator.as_mut()) {
            (Some(executor), Some(generator)) => (executor, generator),
            _ => anyhow::bail!("Agent {} was not prepared", self.id),
        };

        let mut step = AgentStep {
            id: self.id,
            query_budget: self.config.queries_per_agent,
            executor,
            generator,
            cancel,
            recorder,
            samples: Vec::new(),
            next_flush: Instant::now() + RECORD_PERIOD,
        };

        let result = throttle(self.config.rate, &mut step).await;

        // Hand over whatever was measured since the last flush
        let samples = std::mem::take(&mut step.samples);
        if let Err(lost) = recorder.deliver(samples).await {
            debug!(agent = self.id, lost = lost.len(), "recorder closed before the final flush");
        }

        debug!(agent = self.id, "agent finished");
        result.with_context(|| format!("Failed to transact (agent id={})", self.id))
    }

    /// Releases the connection. An open transaction is abandoned.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut executor) = self.executor.take() {
            executor
                .close()
                .await
                .with_context(|| format!("Failed to close DB (agent id={})", self.id))?;
        }
        Ok(())
    }
}

struct AgentStep<'a> {
    id: usize,
    query_budget: u64,
    executor: &'a mut Box<dyn SqlExecutor>,
    generator: &'a mut WorkloadGenerator,
    cancel: &'a CancellationToken,
    recorder: &'a Recorder,
    samples: Vec<LatencySample>,
    next_flush: Instant,
}

impl AgentStep<'_> {
    fn flush_if_due(&mut self, now: Instant) {
        if now < self.next_flush {
            return;
        }
        self.next_flush += RECORD_PERIOD;
        if self.next_flush <= now {
            self.next_flush = now + RECORD_PERIOD;
        }

        let samples = std::mem::take(&mut self.samples);
        if let Err(rejected) = self.recorder.add(samples) {
            // The queue is full; keep the samples for the next window
            self.samples = rejected;
        }
    }

    // Failures caused by the run shutting down are not workload errors
    fn is_shutdown_artifact(&self, err: &ExecError) -> bool {
        match err {
            ExecError::Cancelled => true,
            ExecError::Timeout => self.executor.is_closed(),
            ExecError::Failed(_) => false,
        }
    }
}

#[async_trait]
impl Step for AgentStep<'_> {
    async fn step(&mut self, iteration: u64) -> Result<ControlFlow<()>> {
        if self.query_budget > 0 && iteration >= self.query_budget {
            return Ok(ControlFlow::Break(()));
        }
        if self.cancel.is_cancelled() {
            return Ok(ControlFlow::Break(()));
        }

        self.flush_if_due(Instant::now());

        let (stmt, args) = self.generator.next_statement();
        let start = Instant::now();
        let result = self.executor.execute(self.cancel, &stmt, &args).await;
        let end = Instant::now();

        match result {
            Ok(_) => {
                self.samples.push(LatencySample {
                    timestamp: end,
                    duration: end - start,
                });
            }
            Err(err) if self.is_shutdown_artifact(&err) => {
                debug!(agent = self.id, error = %err, "ignoring failure caused by shutdown");
            }
            Err(err) => {
                let args = format_args(&args);
                return Err(anyhow::Error::new(err)
                    .context(format!("Execute query error (query={stmt}, args={args})")));
            }
        }

        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{LoadType, WorkloadConfig};
    use crate::test_util::{Failure, ScriptedConnector};

    fn make_config(workload: WorkloadConfig, queries_per_agent: u64) -> Arc<Configuration> {
        Arc::new(Configuration {
            queries_per_agent,
            workload,
            ..Default::default()
        })
    }

    fn key_workload() -> WorkloadConfig {
        WorkloadConfig {
            load_type: LoadType::Key,
            int_columns: 1,
            char_columns: 0,
            ..Default::default()
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prepare_runs_init_statements() {
        let workload = WorkloadConfig {
            commit_rate: 2,
            pre_queries: vec!["SET work_mem = '64MB'".to_string()],
            ..key_workload()
        };
        let connector = Arc::new(ScriptedConnector::new());
        let mut agent = Agent::new(3, make_config(workload, 0), connector.clone());

        agent.prepare(&CancellationToken::new(), &ids(5)).await.unwrap();
        assert_eq!(
            connector.statements(),
            vec!["SET work_mem = '64MB'".to_string(), "BEGIN".to_string()]
        );
        agent.close().await.unwrap();
        assert_eq!(connector.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_is_cancellable() {
        let workload = WorkloadConfig {
            pre_queries: vec!["SELECT pg_sleep(3600)".to_string(), "SET x = 1".to_string()],
            ..key_workload()
        };
        let connector = Arc::new(ScriptedConnector::new().with_latency(Duration::from_secs(3600)));
        let mut agent = Agent::new(1, make_config(workload, 0), connector.clone());

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            }
        };

        let start = Instant::now();
        let agent_ids = ids(5);
        let (result, _) = tokio::join!(agent.prepare(&cancel, &agent_ids), canceller);
        assert!(matches!(result, Err(BenchError::Interrupted)));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        // The second init statement was never issued
        assert_eq!(connector.statements(), vec!["SELECT pg_sleep(3600)".to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_fails_on_connection_error() {
        let connector = Arc::new(ScriptedConnector::new().refuse_connections());
        let mut agent = Agent::new(7, make_config(key_workload(), 0), connector);

        let err = agent.prepare(&CancellationToken::new(), &ids(5)).await.unwrap_err();
        assert!(format!("{err:#}").contains("agent id=7"));
    }

    #[tokio::test]
    async fn test_run_respects_query_budget() {
        let connector = Arc::new(ScriptedConnector::new());
        let mut agent = Agent::new(0, make_config(key_workload(), 10), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        let cancel = CancellationToken::new();
        agent.run(&cancel, &recorder).await.unwrap();
        recorder.close().await;

        assert_eq!(connector.statements().len(), 10);
        assert_eq!(recorder.count(), 10);
    }

    #[tokio::test]
    async fn test_agent_visits_every_id_once() {
        let connector = Arc::new(ScriptedConnector::new());
        let mut agent = Agent::new(0, make_config(key_workload(), 50), connector.clone());
        let original = ids(50);
        agent.prepare(&CancellationToken::new(), &original).await.unwrap();

        let recorder = Recorder::start(8);
        agent.run(&CancellationToken::new(), &recorder).await.unwrap();
        recorder.close().await;

        // Every id is used exactly once, in the agent's own order
        let mut visited: Vec<String> = connector
            .executions()
            .into_iter()
            .map(|(_, args)| args[0].to_string().trim_matches('"').to_string())
            .collect();
        visited.sort_by_key(|id| id.parse::<u32>().unwrap_or(u32::MAX));
        assert_eq!(visited, original);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let connector = Arc::new(ScriptedConnector::new());
        let mut agent = Agent::new(0, make_config(key_workload(), 0), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        agent.run(&cancel, &recorder).await.unwrap();

        assert!(connector.statements().is_empty());
    }

    #[tokio::test]
    async fn test_statement_failure_aborts_run() {
        let connector = Arc::new(ScriptedConnector::new().fail_at(3, Failure::Error));
        let mut agent = Agent::new(5, make_config(key_workload(), 0), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        let err = agent
            .run(&CancellationToken::new(), &recorder)
            .await
            .unwrap_err();
        recorder.close().await;

        let message = format!("{err:#}");
        assert!(message.contains("agent id=5"), "{message}");
        assert!(message.contains("SELECT intcol1 FROM t1 WHERE id = $1"), "{message}");
        // The samples measured before the failure are still delivered
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_on_closed_connection_is_ignored() {
        let connector = Arc::new(ScriptedConnector::new().fail_at(2, Failure::TimeoutOnClosed));
        let mut agent = Agent::new(0, make_config(key_workload(), 5), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        agent.run(&CancellationToken::new(), &recorder).await.unwrap();
        recorder.close().await;

        // The timed out statement yields no sample
        assert_eq!(recorder.count(), 4);
    }

    #[tokio::test]
    async fn test_timeout_on_open_connection_fails() {
        let connector = Arc::new(ScriptedConnector::new().fail_at(2, Failure::Timeout));
        let mut agent = Agent::new(0, make_config(key_workload(), 5), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        assert!(agent.run(&CancellationToken::new(), &recorder).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_execution_is_not_an_error() {
        let connector = Arc::new(ScriptedConnector::new().with_latency(Duration::from_secs(60)));
        let mut agent = Agent::new(0, make_config(key_workload(), 0), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Recorder::start(8);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            }
        };

        let (result, _) = tokio::join!(agent.run(&cancel, &recorder), canceller);
        result.unwrap();
        recorder.close().await;
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_flushed_periodically() {
        let connector = Arc::new(ScriptedConnector::new().with_latency(Duration::from_millis(100)));
        let mut agent = Agent::new(0, make_config(key_workload(), 0), connector.clone());
        agent.prepare(&CancellationToken::new(), &ids(4)).await.unwrap();

        let recorder = Arc::new(Recorder::start(8));
        let cancel = CancellationToken::new();

        let observer = {
            let recorder = Arc::clone(&recorder);
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2550)).await;
                let seen = recorder.count();
                cancel.cancel();
                seen
            }
        };

        let (result, seen) = tokio::join!(agent.run(&cancel, &recorder), observer);
        result.unwrap();

        // Samples reach the recorder in one-second batches while running
        assert!((10..=20).contains(&seen), "{seen}");
        recorder.close().await;
        assert!(recorder.count() >= 25);
    }
}
