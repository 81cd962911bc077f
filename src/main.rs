use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use querywatch::monitoring::{PoolSource, PoolStatus};
use querywatch::{DatabaseMonitor, MonitorConfig, OperationContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "querywatch")]
#[command(about = "Query timing, error classification and alerting for PostgreSQL-backed services")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to QUERYWATCH_CONFIG and environment)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Prometheus,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload through the instrumentation and print the result
    Simulate {
        #[arg(long, default_value_t = 500)]
        operations: usize,
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
        /// Fraction of operations that fail
        #[arg(long, default_value_t = 0.05)]
        failure_rate: f64,
        /// Fraction of operations slower than the slow query threshold
        #[arg(long, default_value_t = 0.01)]
        slow_rate: f64,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Run ping queries against a live database and report
    Ping {
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[arg(long, default_value_t = 20)]
        queries: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Show the effective configuration and validation results
    Config,
    /// Print the default configuration as TOML
    InitConfig,
}

/// Pool whose occupancy follows the simulated in-flight operations.
struct SimulatedPool {
    size: u32,
    in_flight: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl PoolSource for SimulatedPool {
    async fn pool_status(&self) -> querywatch::Result<PoolStatus> {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        Ok(PoolStatus {
            pool_size: self.size,
            checked_out: in_flight.min(self.size),
            overflow: in_flight.saturating_sub(self.size),
        })
    }
}

const FAILURES: [&str; 5] = [
    "error communicating with database: Connection refused (os error 111)",
    "ERROR: deadlock detected",
    "ERROR: canceling statement due to statement timeout",
    "pool timed out while waiting for an open connection",
    "ERROR: duplicate key value violates unique constraint \"orders_pkey\"",
];

const STATEMENTS: [(&str, &str); 5] = [
    ("list_orders", "SELECT * FROM orders WHERE customer_id = $1"),
    ("create_order", "INSERT INTO orders (customer_id, total) VALUES ($1, $2)"),
    ("update_stock", "UPDATE inventory SET quantity = quantity - $1 WHERE sku = $2"),
    ("purge_sessions", "DELETE FROM sessions WHERE expires_at < now()"),
    ("refresh_stats", "VACUUM ANALYZE orders"),
];

struct Step {
    name: &'static str,
    sql: &'static str,
    latency: Duration,
    failure: Option<&'static str>,
}

fn plan_workload(
    operations: usize,
    failure_rate: f64,
    slow_rate: f64,
    slow_threshold: Duration,
    seed: Option<u64>,
) -> Vec<Step> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    (0..operations)
        .map(|_| {
            let (name, sql) = STATEMENTS[rng.gen_range(0..STATEMENTS.len())];
            let latency = if rng.gen_bool(slow_rate.clamp(0.0, 1.0)) {
                slow_threshold + Duration::from_millis(rng.gen_range(50..500))
            } else {
                Duration::from_millis(rng.gen_range(1..25))
            };
            let failure = rng
                .gen_bool(failure_rate.clamp(0.0, 1.0))
                .then(|| FAILURES[rng.gen_range(0..FAILURES.len())]);
            Step {
                name,
                sql,
                latency,
                failure,
            }
        })
        .collect()
}

async fn simulate(
    monitor: &DatabaseMonitor,
    steps: Vec<Step>,
    concurrency: usize,
) -> Result<()> {
    let in_flight = Arc::new(AtomicU32::new(0));
    let sampler = monitor
        .pool_sampler(Arc::new(SimulatedPool {
            size: concurrency.max(1) as u32,
            in_flight: in_flight.clone(),
        }));
    let sampler_handle = if monitor.config().sampler.enabled {
        Some(sampler.clone().spawn()?)
    } else {
        None
    };

    info!("Simulating {} operations", steps.len());
    futures::stream::iter(steps)
        .for_each_concurrent(concurrency.max(1), |step| {
            let in_flight = in_flight.clone();
            async move {
                in_flight.fetch_add(1, Ordering::Relaxed);
                let ctx = OperationContext::from_sql(step.name, step.sql);
                let _ = monitor
                    .instrumentation()
                    .observe(ctx, async {
                        tokio::time::sleep(step.latency).await;
                        match step.failure {
                            Some(message) => Err(message.to_string()),
                            None => Ok(()),
                        }
                    })
                    .await;
                in_flight.fetch_sub(1, Ordering::Relaxed);
            }
        })
        .await;

    let check = sampler.tick().await;
    if let Some(handle) = sampler_handle {
        handle.shutdown().await;
    }
    let status = sampler.status();
    info!(
        "Pool health {:?} after {} checks",
        check.status, status.health_history_size
    );
    monitor.evaluate_alerts();
    Ok(())
}

async fn ping(monitor: &DatabaseMonitor, database_url: &str, queries: usize) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {e}"))?;

    let sampler = monitor.pool_sampler(Arc::new(pool.clone()));
    let session = monitor.session("ping");

    for _ in 0..queries {
        let sql = "SELECT 1";
        let _ = session
            .execute("ping", sql, sqlx::query(sql).execute(&pool))
            .await;
        sampler.sample_once().await?;
    }

    session.close();
    let stats = session.stats();
    info!(
        "Ping finished: {} queries, {} errors, {:.2}ms average",
        stats.query_count, stats.error_count, stats.avg_query_ms
    );
    pool.close().await;
    Ok(())
}

fn print_report(monitor: &DatabaseMonitor, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&monitor.snapshot())?),
        OutputFormat::Prometheus => print!("{}", monitor.export_prometheus()?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MonitorConfig::from_file(path)?,
        None => MonitorConfig::from_env()?,
    };
    if cli.json_logs {
        config.logging.json = true;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Commands::Simulate {
            operations,
            concurrency,
            failure_rate,
            slow_rate,
            seed,
            format,
        } => {
            config.validate()?;
            let steps = plan_workload(
                operations,
                failure_rate,
                slow_rate,
                Duration::from_millis(config.slow_query_threshold_ms),
                seed,
            );
            let monitor = DatabaseMonitor::from_config(config)?;
            simulate(&monitor, steps, concurrency).await?;
            print_report(&monitor, format)
        }
        Commands::Ping {
            database_url,
            queries,
            format,
        } => {
            config.validate()?;
            let url = database_url
                .or_else(|| config.database_url.clone())
                .ok_or_else(|| anyhow::anyhow!("No database URL: pass --database-url or set DATABASE_URL"))?;
            let monitor = DatabaseMonitor::from_config(config)?;
            ping(&monitor, &url, queries).await?;
            print_report(&monitor, format)
        }
        Commands::Config => {
            println!("{}", config.create_diagnostic_report());
            Ok(())
        }
        Commands::InitConfig => {
            print!("{}", toml::to_string_pretty(&MonitorConfig::default())?);
            Ok(())
        }
    }
}
