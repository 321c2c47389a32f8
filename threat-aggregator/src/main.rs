use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use threat_aggregator::{
    extract_iocs, FetchConfig, InferenceBackend, IocType, MemorySink, MonitorConfig, OllamaBackend, OllamaConfig,
    PersistenceSink, PostgresSink, RssFeedSource, ThreatAnalyzer, ThreatMonitor,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL_SECONDS: u64 = 60;

#[derive(Parser)]
#[command(name = "threat-aggregator")]
#[command(about = "Threat intelligence feed monitor with IOC extraction and AI analysis")]
struct Cli {
    /// PostgreSQL connection string; records are kept in memory when absent
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434", global = true)]
    ollama_url: String,

    #[arg(long, env = "OLLAMA_MODEL", default_value = "tinyllama", global = true)]
    model: String,

    /// Skip the inference backend and use keyword analysis only
    #[arg(long, global = true)]
    offline: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured feeds until interrupted
    Monitor,

    /// Process every feed once and print the cycle report
    Once,

    /// Extract IOCs from a file, or stdin when no file is given
    Extract { file: Option<PathBuf> },

    /// Analyze an article body from a file or stdin
    Analyze {
        #[arg(long)]
        title: String,
        file: Option<PathBuf>,
    },

    /// Classify a single indicator
    Classify {
        #[arg(long = "type")]
        ioc_type: IocType,
        value: String,
        #[arg(long, default_value = "")]
        context: String,
    },

    /// Show stored threat statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Monitor => run_monitor(&cli).await,
        Commands::Once => {
            let monitor = build_monitor(&cli).await?;
            let report = monitor.run_cycle().await;
            print_json(&report)?;
            print_json(&monitor.stats().await?)
        }
        Commands::Extract { file } => {
            let text = read_input(file.as_ref()).await?;
            print_json(&extract_iocs(&text))
        }
        Commands::Analyze { title, file } => {
            let body = read_input(file.as_ref()).await?;
            let analyzer = build_analyzer(&cli);
            print_json(&analyzer.analyze(title, &body).await)
        }
        Commands::Classify { ioc_type, value, context } => {
            let analyzer = build_analyzer(&cli);
            print_json(&analyzer.classify_ioc(value, *ioc_type, context).await)
        }
        Commands::Stats => {
            let sink = build_sink(&cli).await?;
            print_json(&sink.stats().await?)
        }
    }
}

async fn run_monitor(cli: &Cli) -> Result<()> {
    let monitor = build_monitor(cli).await?;
    monitor.start().await;

    let mut stats_timer = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECONDS));
    stats_timer.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupt received, shutting down");
                break;
            }
            _ = stats_timer.tick() => {
                match monitor.stats().await {
                    Ok(stats) => info!(
                        "Threats: {} ({} recent), IOCs: {}, AI coverage: {:.1}%",
                        stats.total_threats,
                        stats.recent_threats,
                        stats.total_iocs,
                        stats.analysis_coverage()
                    ),
                    Err(e) => warn!("Failed to read stats: {}", e),
                }
            }
        }
    }

    monitor.stop().await;
    monitor.join().await;
    Ok(())
}

async fn build_monitor(cli: &Cli) -> Result<ThreatMonitor> {
    let source = Arc::new(RssFeedSource::new(FetchConfig::default()));
    let analyzer = Arc::new(build_analyzer(cli));
    let sink = build_sink(cli).await?;
    Ok(ThreatMonitor::new(MonitorConfig::default(), source, analyzer, sink))
}

fn build_analyzer(cli: &Cli) -> ThreatAnalyzer {
    if cli.offline {
        info!("Offline mode: keyword analysis only");
        return ThreatAnalyzer::offline();
    }

    let config = OllamaConfig {
        base_url: cli.ollama_url.clone(),
        model: cli.model.clone(),
        ..OllamaConfig::default()
    };
    let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaBackend::new(config));
    ThreatAnalyzer::new(backend)
}

async fn build_sink(cli: &Cli) -> Result<Arc<dyn PersistenceSink>> {
    match &cli.database_url {
        Some(url) => {
            let sink = PostgresSink::connect(url)
                .await
                .context("Failed to connect to database. Make sure PostgreSQL is running")?;
            Ok(Arc::new(sink))
        }
        None => {
            info!("No database configured, keeping records in memory");
            Ok(Arc::new(MemorySink::new()))
        }
    }
}

async fn read_input(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).context("Failed to read stdin")?;
            Ok(text)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
