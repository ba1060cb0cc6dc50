use std::time::Duration;

use serde::Serialize;
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::error::BenchError;

/// The name of the table created by the auto-generated schema.
pub const AUTO_GENERATE_TABLE_NAME: &str = "t1";

/// The database used for CREATE/DROP DATABASE statements.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// The length of values generated for character columns.
pub const CHAR_COLUMN_LENGTH: usize = 128;

/// The kind of statements issued by the auto-generated workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display, IntoStaticStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    /// Key selects interleaved with inserts, according to the mixed weights.
    Mixed,
    /// Updates of random rows, selected by primary key.
    Update,
    /// Inserts of freshly generated rows.
    Write,
    /// Selects of single rows, by primary key.
    Key,
    /// Unfiltered selects over the whole table.
    Read,
}

impl LoadType {
    /// Whether statements of this load type reference pre-populated primary keys.
    pub fn requires_ids(self) -> bool {
        matches!(self, LoadType::Mixed | LoadType::Update | LoadType::Key)
    }
}

/// Describes the shape of the workload. Shared read-only by all agents.
#[derive(Clone, Debug, Serialize)]
pub struct WorkloadConfig {
    pub load_type: LoadType,

    /// If true, the primary key is a UUID generated by the server.
    /// Otherwise, it is a serial integer.
    pub guid_primary: bool,

    /// The number of additional UUID columns with a UNIQUE constraint.
    pub secondary_indexes: usize,

    pub int_columns: usize,
    pub int_columns_indexed: bool,
    pub char_columns: usize,
    pub char_columns_indexed: bool,

    /// Mixed mode: how many key selects per cycle.
    pub mixed_select_weight: usize,
    /// Mixed mode: how many inserts per cycle.
    pub mixed_insert_weight: usize,

    /// Wraps every `commit_rate` statements in an explicit transaction.
    /// Zero disables grouping.
    pub commit_rate: usize,

    /// When not empty, these statements are issued in a loop instead
    /// of the generated ones.
    #[serde(skip)]
    pub queries: Vec<String>,

    /// Statements executed once by every agent before the run starts.
    pub pre_queries: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            load_type: LoadType::Mixed,
            guid_primary: false,
            secondary_indexes: 0,
            int_columns: 1,
            int_columns_indexed: false,
            char_columns: 1,
            char_columns_indexed: false,
            mixed_select_weight: 1,
            mixed_insert_weight: 1,
            commit_rate: 0,
            queries: Vec::new(),
            pre_queries: Vec::new(),
        }
    }
}

/// Defines the configuration of a benchmark run.
#[derive(Clone, Debug, Serialize)]
pub struct Configuration {
    /// The database the benchmark runs against.
    pub database: String,

    /// The number of agents. Each agent owns a separate connection
    /// and sequentially executes its statements.
    ///
    /// Must not be zero.
    pub agents: usize,

    /// The maximum number of statements per second, per agent.
    /// If zero, there is no rate limit imposed.
    pub rate: u64,

    /// The maximum duration of the run. If `None`, the run lasts until
    /// every agent exhausts its query budget or is interrupted.
    #[serde(skip)]
    pub max_duration: Option<Duration>,

    /// The number of statements each agent executes. Zero means unlimited.
    pub queries_per_agent: u64,

    /// The number of rows each agent inserts before the run.
    pub pre_populated_rows: u64,

    /// Upper bound of a single statement's execution.
    #[serde(skip)]
    pub statement_timeout: Option<Duration>,

    pub drop_existing_database: bool,
    pub use_existing_database: bool,
    pub no_drop_database: bool,

    /// User-provided DDL which replaces the auto-generated schema.
    #[serde(skip)]
    pub creates: Vec<String>,

    /// Print statements instead of sending them to the database.
    #[serde(skip)]
    pub dry_run: bool,

    #[serde(skip)]
    pub no_progress: bool,

    pub workload: WorkloadConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            database: "pgslap".to_string(),
            agents: 1,
            rate: 0,
            max_duration: None,
            queries_per_agent: 0,
            pre_populated_rows: 100,
            statement_timeout: None,
            drop_existing_database: false,
            use_existing_database: false,
            no_drop_database: false,
            creates: Vec::new(),
            dry_run: false,
            no_progress: false,
            workload: WorkloadConfig::default(),
        }
    }
}

impl Configuration {
    /// Checks parameter combinations which cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |msg: String| Err(BenchError::Configuration(msg));

        if self.agents == 0 {
            return invalid("the number of agents must be positive".to_string());
        }
        if self.database.is_empty() {
            return invalid("the database name must not be empty".to_string());
        }

        let workload = &self.workload;
        if !workload.queries.is_empty() {
            // Generation is bypassed entirely
            return Ok(());
        }

        if workload.load_type == LoadType::Mixed
            && workload.mixed_select_weight + workload.mixed_insert_weight == 0
        {
            return invalid("mixed select and insert weights must not both be zero".to_string());
        }
        if workload.load_type == LoadType::Update
            && workload.int_columns + workload.char_columns == 0
        {
            return invalid("the update load type requires at least one column".to_string());
        }
        if workload.load_type.requires_ids()
            && self.creates.is_empty()
            && self.pre_populated_rows == 0
        {
            return invalid(format!(
                "the {} load type requires pre-populated rows",
                workload.load_type
            ));
        }

        Ok(())
    }
}
