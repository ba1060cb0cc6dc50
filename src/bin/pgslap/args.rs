use std::time::Duration;

use clap::Parser;

use pgslap::configuration::{Configuration, LoadType, WorkloadConfig};
use pgslap::error::BenchError;

use crate::duration::parse_duration;

/// Load generator for PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "pgslap", version, about)]
pub(crate) struct PgslapArgs {
    /// Connection string, e.g. `postgres://user@localhost:5432`.
    /// The database part is ignored; see --database.
    #[arg(short = 'u', long, env = "PGSLAP_URL", default_value = "postgres://postgres@localhost:5432")]
    pub url: String,

    /// Database the benchmark runs against
    #[arg(long, default_value = "pgslap")]
    pub database: String,

    /// Number of agents
    #[arg(short = 'n', long, default_value_t = 1)]
    pub agents: usize,

    /// Rate limit per agent, in queries per second (0 = unlimited)
    #[arg(short = 'r', long, default_value_t = 0)]
    pub rate: u64,

    /// Maximum duration of the run, e.g. `60s` (0 = unlimited)
    #[arg(short = 't', long, value_parser = parse_duration, default_value = "0")]
    pub time: Duration,

    /// Number of queries each agent executes (0 = unlimited)
    #[arg(long = "number-queries-to-execute", default_value_t = 0)]
    pub queries: u64,

    /// Number of rows each agent inserts before the run
    #[arg(long = "number-pre-populated-data", default_value_t = 100)]
    pub pre_populated_rows: u64,

    /// Upper bound of a single statement's execution, e.g. `5s`
    #[arg(long, value_parser = parse_duration)]
    pub statement_timeout: Option<Duration>,

    /// Drop the database first if it already exists
    #[arg(long)]
    pub drop_existing_database: bool,

    /// Never drop the database; a missing one is still created
    #[arg(long)]
    pub use_existing_database: bool,

    /// Keep the database after the run
    #[arg(long)]
    pub no_drop_database: bool,

    /// DDL replacing the auto-generated schema (repeatable)
    #[arg(long = "create", value_name = "SQL")]
    pub creates: Vec<String>,

    /// Statement issued in a loop instead of the generated ones (repeatable)
    #[arg(long = "query", value_name = "SQL")]
    pub queries_sql: Vec<String>,

    /// Statement executed by every agent before the run (repeatable)
    #[arg(long = "pre-query", value_name = "SQL")]
    pub pre_queries: Vec<String>,

    /// Load type: mixed, update, write, key or read
    #[arg(short = 'l', long, default_value = "mixed")]
    pub load_type: String,

    /// Use a server-generated UUID as the primary key
    #[arg(long)]
    pub guid_primary: bool,

    /// Number of additional UUID columns with a UNIQUE constraint
    #[arg(long = "number-secondary-indexes", default_value_t = 0)]
    pub secondary_indexes: usize,

    /// Number of integer columns
    #[arg(short = 'y', long = "number-int-cols", default_value_t = 1)]
    pub int_columns: usize,

    /// Index the integer columns
    #[arg(long = "int-cols-index")]
    pub int_columns_indexed: bool,

    /// Number of character columns
    #[arg(short = 'x', long = "number-char-cols", default_value_t = 1)]
    pub char_columns: usize,

    /// Index the character columns
    #[arg(long = "char-cols-index")]
    pub char_columns_indexed: bool,

    /// Mixed mode: key selects per cycle
    #[arg(long = "mixed-sel-ratio", default_value_t = 1)]
    pub mixed_select_weight: usize,

    /// Mixed mode: inserts per cycle
    #[arg(long = "mixed-ins-ratio", default_value_t = 1)]
    pub mixed_insert_weight: usize,

    /// Commit every N statements (0 = autocommit)
    #[arg(long, default_value_t = 0)]
    pub commit_rate: usize,

    /// Print statements instead of executing them
    #[arg(long = "only-print")]
    pub dry_run: bool,

    /// Do not print progress while running
    #[arg(long)]
    pub no_progress: bool,
}

impl PgslapArgs {
    pub fn to_configuration(&self) -> Result<Configuration, BenchError> {
        let load_type: LoadType = self.load_type.parse().map_err(|_| {
            BenchError::Configuration(format!("unknown load type: {}", self.load_type))
        })?;

        let workload = WorkloadConfig {
            load_type,
            guid_primary: self.guid_primary,
            secondary_indexes: self.secondary_indexes,
            int_columns: self.int_columns,
            int_columns_indexed: self.int_columns_indexed,
            char_columns: self.char_columns,
            char_columns_indexed: self.char_columns_indexed,
            mixed_select_weight: self.mixed_select_weight,
            mixed_insert_weight: self.mixed_insert_weight,
            commit_rate: self.commit_rate,
            queries: self.queries_sql.clone(),
            pre_queries: self.pre_queries.clone(),
        };

        let config = Configuration {
            database: self.database.clone(),
            agents: self.agents,
            rate: self.rate,
            max_duration: (self.time > Duration::ZERO).then_some(self.time),
            queries_per_agent: self.queries,
            pre_populated_rows: self.pre_populated_rows,
            statement_timeout: self.statement_timeout,
            drop_existing_database: self.drop_existing_database,
            use_existing_database: self.use_existing_database,
            no_drop_database: self.no_drop_database,
            creates: self.creates.clone(),
            dry_run: self.dry_run,
            no_progress: self.no_progress,
            workload,
        };
        config.validate()?;
        Ok(config)
    }
}
