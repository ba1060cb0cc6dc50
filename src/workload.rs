use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use crate::configuration::{LoadType, WorkloadConfig, AUTO_GENERATE_TABLE_NAME, CHAR_COLUMN_LENGTH};
use crate::executor::SqlArg;

/// A statement together with its arguments.
pub type Statement = (String, Vec<SqlArg>);

/// Returns a seed derived from the wall clock. Generators are not meant
/// to be reproducible across runs.
pub fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Produces the stream of statements executed by a single agent.
///
/// Besides the random stream, the generator keeps a few cursors:
/// the position in the shuffled id list, the position in the mixed
/// select/insert cycle, the position in the fixed statement list,
/// and the transaction grouping counters.
pub struct WorkloadGenerator {
    config: Arc<WorkloadConfig>,
    rng: Pcg64,

    ids: Vec<String>,
    id_idx: usize,
    mixed_idx: usize,
    query_idx: usize,

    // Statements issued since the last BEGIN
    commit_count: usize,
    // Set right after COMMIT, the next call must open a transaction
    begin_pending: bool,
}

impl WorkloadGenerator {
    /// Creates a generator which picks primary keys from `ids`, in order.
    /// The caller is expected to shuffle its private copy beforehand.
    pub fn new(config: Arc<WorkloadConfig>, ids: Vec<String>, rng: Pcg64) -> Result<Self> {
        anyhow::ensure!(
            !config.load_type.requires_ids() || !config.queries.is_empty() || !ids.is_empty(),
            "The {} load type requires a non-empty list of primary keys",
            config.load_type,
        );

        Ok(Self {
            config,
            rng,
            ids,
            id_idx: 0,
            mixed_idx: 0,
            query_idx: 0,
            commit_count: 0,
            begin_pending: false,
        })
    }

    /// A generator only used for producing inserts, e.g. during pre-population.
    pub fn for_inserts(config: Arc<WorkloadConfig>, rng: Pcg64) -> Self {
        Self {
            config,
            rng,
            ids: Vec::new(),
            id_idx: 0,
            mixed_idx: 0,
            query_idx: 0,
            commit_count: 0,
            begin_pending: false,
        }
    }

    /// Statements to be executed once, before the first call to `next`.
    pub fn init_statements(&self) -> Vec<String> {
        let mut stmts = self.config.pre_queries.clone();
        if self.config.commit_rate > 0 {
            stmts.push("BEGIN".to_string());
        }
        stmts
    }

    /// Returns the next statement to execute.
    pub fn next_statement(&mut self) -> Statement {
        let commit_rate = self.config.commit_rate;
        if commit_rate > 0 {
            if self.commit_count == commit_rate {
                self.commit_count = 0;
                self.begin_pending = true;
                return ("COMMIT".to_string(), Vec::new());
            }

            if self.begin_pending {
                self.begin_pending = false;
                return ("BEGIN".to_string(), Vec::new());
            }

            self.commit_count += 1;
        }

        if !self.config.queries.is_empty() {
            let query = self.config.queries[self.query_idx].clone();
            self.query_idx = (self.query_idx + 1) % self.config.queries.len();
            return (query, Vec::new());
        }

        match self.config.load_type {
            LoadType::Mixed => {
                let stmt = if self.mixed_idx < self.config.mixed_select_weight {
                    self.select_statement(true)
                } else {
                    self.insert_statement()
                };

                self.mixed_idx += 1;
                if self.mixed_idx >= self.config.mixed_select_weight + self.config.mixed_insert_weight
                {
                    self.mixed_idx = 0;
                }

                stmt
            }
            LoadType::Update => self.update_statement(),
            LoadType::Write => self.insert_statement(),
            LoadType::Key => self.select_statement(true),
            LoadType::Read => self.select_statement(false),
        }
    }

    /// Builds an INSERT populating every generated column. The primary key
    /// and the secondary unique columns are filled in by the server.
    pub fn insert_statement(&mut self) -> Statement {
        let config = Arc::clone(&self.config);
        let mut args = Vec::with_capacity(config.int_columns + config.char_columns);
        let mut stmt = format!("INSERT INTO {AUTO_GENERATE_TABLE_NAME} VALUES (DEFAULT");

        for _ in 0..config.secondary_indexes {
            stmt.push_str(",gen_random_uuid()");
        }

        let mut placeholder = 1;
        for _ in 0..config.int_columns {
            let _ = write!(stmt, ",${placeholder}");
            placeholder += 1;
            args.push(self.random_int());
        }
        for _ in 0..config.char_columns {
            let _ = write!(stmt, ",${placeholder}");
            placeholder += 1;
            args.push(self.random_text());
        }

        stmt.push(')');
        (stmt, args)
    }

    fn select_statement(&mut self, by_key: bool) -> Statement {
        let mut stmt = format!("SELECT {} FROM {AUTO_GENERATE_TABLE_NAME}", self.column_list());

        if by_key {
            stmt.push_str(" WHERE id = $1");
            (stmt, vec![SqlArg::Text(self.next_id())])
        } else {
            (stmt, Vec::new())
        }
    }

    fn update_statement(&mut self) -> Statement {
        let config = Arc::clone(&self.config);
        let mut assignments = Vec::with_capacity(config.int_columns + config.char_columns);
        let mut args = Vec::with_capacity(config.int_columns + config.char_columns + 1);

        for i in 1..=config.int_columns {
            assignments.push(format!("intcol{i} = ${}", args.len() + 1));
            args.push(self.random_int());
        }
        for i in 1..=config.char_columns {
            assignments.push(format!("charcol{i} = ${}", args.len() + 1));
            args.push(self.random_text());
        }

        let stmt = format!(
            "UPDATE {AUTO_GENERATE_TABLE_NAME} SET {} WHERE id = ${}",
            assignments.join(","),
            args.len() + 1,
        );
        args.push(SqlArg::Text(self.next_id()));
        (stmt, args)
    }

    fn column_list(&self) -> String {
        let ints = (1..=self.config.int_columns).map(|i| format!("intcol{i}"));
        let chars = (1..=self.config.char_columns).map(|i| format!("charcol{i}"));
        ints.chain(chars).collect::<Vec<_>>().join(",")
    }

    // Ids are visited in order and wrap around at the end of the list
    fn next_id(&mut self) -> String {
        if self.id_idx >= self.ids.len() {
            self.id_idx = 0;
        }
        let id = self.ids.get(self.id_idx).cloned().unwrap_or_default();
        self.id_idx += 1;
        id
    }

    fn random_int(&mut self) -> SqlArg {
        SqlArg::Int(self.rng.gen_range(0..=i64::from(i32::MAX)))
    }

    fn random_text(&mut self) -> SqlArg {
        let text = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(CHAR_COLUMN_LENGTH)
            .map(char::from)
            .collect();
        SqlArg::Text(text)
    }
}

/// Statements creating the auto-generated schema.
#[derive(Debug, PartialEq, Eq)]
pub struct SchemaStatements {
    pub create_table: String,
    pub create_indexes: Vec<String>,
}

impl SchemaStatements {
    /// Synthesizes the schema from the workload shape. Deterministic.
    pub fn new(config: &WorkloadConfig) -> Self {
        let mut create_table = format!("CREATE TABLE {AUTO_GENERATE_TABLE_NAME} (id ");
        let mut create_indexes = Vec::new();

        if config.guid_primary {
            create_table.push_str("uuid PRIMARY KEY DEFAULT gen_random_uuid()");
        } else {
            create_table.push_str("serial PRIMARY KEY");
        }

        for i in 1..=config.secondary_indexes {
            let _ = write!(create_table, ",id{i} uuid UNIQUE");
        }

        for i in 1..=config.int_columns {
            let _ = write!(create_table, ",intcol{i} int");
            if config.int_columns_indexed {
                create_indexes.push(format!(
                    "CREATE INDEX ON {AUTO_GENERATE_TABLE_NAME}(intcol{i})"
                ));
            }
        }

        for i in 1..=config.char_columns {
            let _ = write!(create_table, ",charcol{i} varchar({CHAR_COLUMN_LENGTH})");
            if config.char_columns_indexed {
                create_indexes.push(format!(
                    "CREATE INDEX ON {AUTO_GENERATE_TABLE_NAME}(charcol{i})"
                ));
            }
        }

        create_table.push(')');

        Self {
            create_table,
            create_indexes,
        }
    }

    /// Drops the auto-generated table, if it exists.
    pub fn drop_table() -> String {
        format!("DROP TABLE IF EXISTS {AUTO_GENERATE_TABLE_NAME}")
    }
}

/// Creates the private random stream of a generator.
pub fn new_rng(seed: u64) -> Pcg64 {
    Pcg64::seed_from_u64(seed)
}
