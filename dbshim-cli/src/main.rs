//! dbshim 连接巡检工具
//!
//! 面向运维的小工具，包括：
//! - 对配置的数据库连接做连通性检查
//! - 执行临时查询 / 批量语句
//! - 清空查询缓存

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dbshim::{QueryOptions, Registry, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dbshim", version, about = "Legacy database compatibility layer smoke tool")]
struct Cli {
    /// Settings file describing the named connections
    #[arg(
        short,
        long,
        global = true,
        default_value = "dbshim.toml",
        env = "DBSHIM_CONFIG"
    )]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to each configured connection and report latency
    Ping {
        /// Check a single connection instead of all of them
        connection: Option<String>,
    },
    /// Run a single query and print the rows as JSON
    Query {
        connection: String,
        sql: String,
        /// Description attached to the query log line
        #[arg(short, long, default_value = "ad-hoc query")]
        description: String,
        /// Cap on buffered rows
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Run multiple ;-separated statements in one round trip
    Batch {
        connection: String,
        sql: String,
        #[arg(short, long, default_value = "ad-hoc batch")]
        description: String,
    },
    /// Flush the store behind a cache connection
    Flush { connection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (if present) before anything else
    load_dotenv();

    // 初始化日志追踪
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // 加载配置
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    let registry = Registry::from_settings(settings)?;
    tracing::info!(connections = registry.len(), "registry ready");

    match cli.command {
        Commands::Ping { connection } => ping(&registry, connection.as_deref()).await,
        Commands::Query {
            connection,
            sql,
            description,
            max_rows,
        } => query(&registry, &connection, &sql, &description, max_rows).await,
        Commands::Batch {
            connection,
            sql,
            description,
        } => batch(&registry, &connection, &sql, &description).await,
        Commands::Flush { connection } => {
            registry.flush_cache(&connection).await?;
            println!("{}: cache flushed", connection);
            Ok(())
        }
    }
}

async fn ping(registry: &Registry, only: Option<&str>) -> Result<()> {
    let names: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => registry.names().map(str::to_string).collect(),
    };

    let mut failures = 0usize;
    for name in &names {
        let conn = registry.get(name)?;
        match conn.ping().await {
            Ok(latency) => {
                println!("{}: ok ({} ms)", name, latency.as_millis());
            }
            Err(e) => {
                println!("{}: FAILED ({})", name, e);
                failures += 1;
            }
        }
    }

    println!(
        "checked {} connection(s) at {}",
        names.len(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    if failures > 0 {
        bail!("{} of {} connections unreachable", failures, names.len());
    }
    Ok(())
}

async fn query(
    registry: &Registry,
    connection: &str,
    sql: &str,
    description: &str,
    max_rows: Option<usize>,
) -> Result<()> {
    let conn = registry.get(connection)?;
    let opts = QueryOptions {
        max_rows,
        ..QueryOptions::default()
    };
    let outcome = conn.query_with(sql, description, opts).await?;

    eprintln!(
        "{}: {} ({} ms{})",
        connection,
        if outcome.columns().is_empty() {
            format!("{} affected", outcome.affected_rows())
        } else {
            format!("{} rows", outcome.num_rows())
        },
        outcome.elapsed().as_millis(),
        if outcome.from_cache() { ", cached" } else { "" },
    );
    let maps = outcome.into_maps();
    println!("{}", serde_json::to_string_pretty(&maps)?);
    Ok(())
}

async fn batch(registry: &Registry, connection: &str, sql: &str, description: &str) -> Result<()> {
    let conn = registry.get(connection)?;
    let results = conn.multi_query(sql, description).await?;

    let mut failures = 0usize;
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(outcome) => {
                if outcome.columns().is_empty() {
                    println!("part {}: {} affected", index + 1, outcome.affected_rows());
                } else {
                    println!("part {}: {} rows", index + 1, outcome.num_rows());
                }
            }
            Err(e) => {
                println!("part {}: ERROR {}", index + 1, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} statement(s) failed", failures);
    }
    Ok(())
}

/// Load .env file from the working directory (best-effort, no error if missing).
fn load_dotenv() {
    let env_path = std::path::Path::new(".env");
    if env_path.exists() {
        if let Ok(content) = std::fs::read_to_string(env_path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let key = key.trim();
                    let value = value.trim();
                    // Only set if not already set by the environment
                    if std::env::var(key).is_err() {
                        std::env::set_var(key, value);
                    }
                }
            }
        }
    }
}
