use crate::server::task::RetryPolicy;
use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use core::time::Duration;

/// Command line of the `tally-server` binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tally-server",
    version,
    about = "Per-parent sequence allocation with asynchronous, retrying persistence"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub args: CliArgs,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the pipeline until SIGINT/SIGTERM (default).
    Serve,
    /// Run one authoritative counter-cache sweep and exit.
    Reconcile,
    /// Republish durable entries into the search index and exit.
    Reindex {
        /// Clear the index first, dropping documents of deleted entries.
        #[arg(long, default_value_t = false)]
        full: bool,
        /// Resume after this entry id.
        #[arg(long, default_value_t = 0)]
        after: i64,
    },
    /// Report allocated numbers that never materialized as rows.
    Gaps {
        /// Missing numbers listed per counter; the count is always exact.
        #[arg(long, default_value_t = 20)]
        max_missing: usize,
    },
    /// Raise every counter to the highest number the durable store has seen.
    RebuildCounters,
    /// List dead-lettered tasks, or re-submit one.
    DeadLetters {
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Re-submit the dead letter with this id under its original number.
        #[arg(long, conflicts_with = "release")]
        requeue: Option<i64>,
        /// Return a requeued letter whose task was lost to `dead`.
        #[arg(long)]
        release: Option<i64>,
    },
}

/// Where allocation counters live.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    /// In-process atomics, rebuilt from the durable store at every start.
    /// Only safe for a single instance: numbers in flight at a crash, and
    /// numbers handed out by another process, are invisible to it.
    Memory,
    /// Row-locked counters in the durable store, on their own connection.
    Sql,
    /// Redis `INCR` (requires the `redis` feature).
    Redis,
}

/// How a permanently abandoned number is treated.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GapPolicy {
    /// Expected under failure; logged at `info`.
    Accept,
    /// Operational signal; logged at `error` and counted in `sequence_gaps`.
    #[default]
    Alert,
}

/// Runtime configuration, parsed from CLI arguments or environment
/// variables.
///
/// Every timeout and size is independently tunable; defaults suit a single
/// node with a local SQLite database.
#[derive(clap::Args, Debug, Clone)]
pub struct CliArgs {
    /// Durable store connection string.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL", default_value_t = String::from("sqlite://tally.db"))]
    pub database_url: String,

    /// Durable store pool size. SQLite allows one writer at a time, so more
    /// connections mostly add lock contention.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 1)]
    pub database_max_connections: u32,

    /// Counter store used by the number allocator. Every instance sharing a
    /// database must use the same shared backend (`sql` or `redis`).
    ///
    /// Environment variable: `COUNTER_BACKEND`
    #[arg(long, env = "COUNTER_BACKEND", value_enum, default_value_t = CounterBackend::Sql)]
    pub counter_backend: CounterBackend,

    /// Counter store endpoint (`redis://...`), required for `redis`.
    ///
    /// Environment variable: `COUNTER_URL`
    #[arg(long, env = "COUNTER_URL")]
    pub counter_url: Option<String>,

    /// Search index connection string, or `memory`.
    ///
    /// Environment variable: `SEARCH_INDEX_URL`
    #[arg(long, env = "SEARCH_INDEX_URL", default_value_t = String::from("sqlite://tally-search.db"))]
    pub search_index_url: String,

    /// Number of creation workers. Each runs one task attempt at a time.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Admitted-but-unfinished tasks allowed before producers are rejected
    /// with a backpressure error.
    ///
    /// Environment variable: `MAX_BACKLOG`
    #[arg(long, env = "MAX_BACKLOG", default_value_t = 10_000)]
    pub max_backlog: usize,

    /// Attempts per creation task before it is dead-lettered.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubles per attempt.
    ///
    /// Environment variable: `BASE_BACKOFF_MS`
    #[arg(long, env = "BASE_BACKOFF_MS", default_value_t = 50)]
    pub base_backoff_ms: u64,

    /// Upper bound on any single retry delay.
    ///
    /// Environment variable: `MAX_BACKOFF_MS`
    #[arg(long, env = "MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub max_backoff_ms: u64,

    /// Allocation budget. Allocation is on the request path, so it must stay
    /// in single-digit milliseconds.
    ///
    /// Environment variable: `ALLOCATE_TIMEOUT_MS`
    #[arg(long, env = "ALLOCATE_TIMEOUT_MS", default_value_t = 5)]
    pub allocate_timeout_ms: u64,

    /// Budget for one durable write attempt.
    ///
    /// Environment variable: `TASK_TIMEOUT_MS`
    #[arg(long, env = "TASK_TIMEOUT_MS", default_value_t = 5_000)]
    pub task_timeout_ms: u64,

    /// Budget for one search index write.
    ///
    /// Environment variable: `INDEX_TIMEOUT_MS`
    #[arg(long, env = "INDEX_TIMEOUT_MS", default_value_t = 1_000)]
    pub index_timeout_ms: u64,

    /// Interval between authoritative counter-cache sweeps.
    ///
    /// Environment variable: `RECONCILE_INTERVAL_SECS`
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    pub reconcile_interval_secs: u64,

    /// Entries read per reindex page.
    ///
    /// Environment variable: `REINDEX_BATCH_SIZE`
    #[arg(long, env = "REINDEX_BATCH_SIZE", default_value_t = 500)]
    pub reindex_batch_size: u32,

    /// Time allowed for the backlog to drain at shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Treatment of permanently abandoned numbers.
    ///
    /// Environment variable: `GAP_POLICY`
    #[arg(long, env = "GAP_POLICY", value_enum, default_value_t = GapPolicy::Alert)]
    pub gap_policy: GapPolicy,
}

/// Settings of the in-process pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_workers: usize,
    pub max_backlog: usize,
    pub retry: RetryPolicy,
    pub allocate_timeout: Duration,
    pub task_timeout: Duration,
    pub index_timeout: Duration,
    pub reconcile_interval: Duration,
    pub reindex_batch_size: u32,
    pub shutdown_timeout: Duration,
    pub gap_policy: GapPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_backlog: 10_000,
            retry: RetryPolicy::default(),
            allocate_timeout: tally::DEFAULT_ALLOCATE_TIMEOUT,
            task_timeout: Duration::from_secs(5),
            index_timeout: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
            reindex_batch_size: 500,
            shutdown_timeout: Duration::from_secs(10),
            gap_policy: GapPolicy::Alert,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub counter_backend: CounterBackend,
    pub counter_url: Option<String>,
    pub search_index_url: String,
    pub pipeline: PipelineConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_backlog == 0 {
            bail!("MAX_BACKLOG must be greater than 0");
        }

        if args.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }

        if args.base_backoff_ms > args.max_backoff_ms {
            bail!(
                "BASE_BACKOFF_MS ({}) exceeds MAX_BACKOFF_MS ({})",
                args.base_backoff_ms,
                args.max_backoff_ms
            );
        }

        if !(1..=9).contains(&args.allocate_timeout_ms) {
            bail!(
                "ALLOCATE_TIMEOUT_MS ({}) must be between 1 and 9",
                args.allocate_timeout_ms
            );
        }

        if args.task_timeout_ms == 0 || args.index_timeout_ms == 0 {
            bail!("TASK_TIMEOUT_MS and INDEX_TIMEOUT_MS must be greater than 0");
        }

        if args.reconcile_interval_secs == 0 {
            bail!("RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        if args.counter_backend == CounterBackend::Redis {
            if args.counter_url.is_none() {
                bail!("COUNTER_URL is required when COUNTER_BACKEND is redis");
            }
            if !cfg!(feature = "redis") {
                bail!("COUNTER_BACKEND redis requires building with the `redis` feature");
            }
        }

        Ok(Self {
            database_url: args.database_url,
            database_max_connections: args.database_max_connections.max(1),
            counter_backend: args.counter_backend,
            counter_url: args.counter_url,
            search_index_url: args.search_index_url,
            pipeline: PipelineConfig {
                num_workers: args.num_workers,
                max_backlog: args.max_backlog,
                retry: RetryPolicy {
                    max_attempts: args.max_attempts,
                    base_backoff: Duration::from_millis(args.base_backoff_ms),
                    max_backoff: Duration::from_millis(args.max_backoff_ms),
                    jitter: true,
                },
                allocate_timeout: Duration::from_millis(args.allocate_timeout_ms),
                task_timeout: Duration::from_millis(args.task_timeout_ms),
                index_timeout: Duration::from_millis(args.index_timeout_ms),
                reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
                reindex_batch_size: args.reindex_batch_size.max(1),
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
                gap_policy: args.gap_policy,
            },
        })
    }
}
