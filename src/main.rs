use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netspeed_dashboard::config::DashboardConfig;
use netspeed_dashboard::dashboard::Dashboard;
use netspeed_dashboard::history::DirectorySink;
use netspeed_dashboard::metrics::TimeRange;
use netspeed_dashboard::notify::NotificationBoard;
use netspeed_dashboard::samples::LoadOutcome;
use netspeed_dashboard::storage::TelemetryStore;
use netspeed_dashboard::web::start_web_server;

#[derive(Parser)]
#[command(name = "netspeed-dashboard")]
#[command(about = "Live network speed dashboard for a remote telemetry server", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Telemetry server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Telemetry server port (for `serve`, the port to listen on)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Polling interval in seconds (1-60)
    #[arg(short, long, global = true)]
    interval: Option<u64>,

    /// Path to store log files for long-running commands
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the server and follow push updates until Ctrl+C
    Monitor {
        /// Poll only, without the real-time channel
        #[arg(long, default_value = "false")]
        no_push: bool,
    },
    /// Fetch the latest values once and print the statistics
    Fetch,
    /// Send one value to the server
    Send {
        value: String,
    },
    /// Query stored measurements for a time range
    History {
        /// One of 1h, 6h, 24h, 7d, 30d
        #[arg(short, long, default_value = "24h")]
        range: TimeRange,

        /// Directory to write a CSV export into
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
    /// Manage saved samples
    Samples {
        #[command(subcommand)]
        action: SampleCommand,
    },
    /// Run the companion telemetry server
    Serve {
        /// Path to store the database
        #[arg(short, long, default_value = "telemetry.db")]
        database: PathBuf,
    },
}

#[derive(Subcommand)]
enum SampleCommand {
    /// List saved samples
    List,
    /// Fetch the current values and save them as a named sample
    Save {
        name: String,
    },
    /// Load a sample and print its points
    Show {
        id: String,
    },
    /// Delete a sample
    Delete {
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },
    /// Overlay up to three samples
    Compare {
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DashboardConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host.clone() {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(interval) = cli.interval {
        config = config.with_interval_secs(interval);
    }

    match cli.command {
        Commands::Monitor { no_push } => {
            let _guard = init_logging(Some(&cli.log_dir), "netspeed-monitor.log")?;
            config.push_enabled = config.push_enabled && !no_push;
            run_monitor(config).await
        }
        Commands::Fetch => {
            init_logging(None, "")?;
            let dashboard = connect(config)?;
            let outcome = dashboard.fetch_now().await?;
            if let Some(outcome) = outcome {
                info!(accepted = outcome.accepted, dropped = outcome.dropped, "Fetched latest data");
            }
            print_series(&dashboard);
            Ok(())
        }
        Commands::Send { value } => {
            init_logging(None, "")?;
            let dashboard = connect(config)?;
            dashboard.send_value(&value).await?;
            println!("Sent {}", value.trim());
            Ok(())
        }
        Commands::History { range, export } => {
            init_logging(None, "")?;
            let mut dashboard = connect(config)?;
            let records = dashboard.query_history(range).await?;
            println!("{} records in the last {}", records.len(), range);
            for record in records {
                println!(
                    "{}  {:>8.1} Mbps  {}",
                    record.formatted_time,
                    record.value,
                    record.server.as_deref().unwrap_or("Unknown")
                );
            }
            if let Some(dir) = export {
                let path = dashboard.export_history(&DirectorySink::new(dir))?;
                println!("Exported to {:?}", path);
            }
            Ok(())
        }
        Commands::Samples { action } => {
            init_logging(None, "")?;
            let dashboard = connect(config)?;
            run_samples(dashboard, action).await
        }
        Commands::Serve { database } => {
            let _guard = init_logging(Some(&cli.log_dir), "netspeed-server.log")?;
            info!("Database: {:?}", database);
            let store = Arc::new(TelemetryStore::new(&database)?);
            info!(path = ?store.path(), "Telemetry store ready");
            start_web_server(store, config.port).await
        }
    }
}

/// Stdout logging, plus an hourly JSON log file when `log_dir` is given
fn init_logging(log_dir: Option<&Path>, file_name: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().json().with_writer(non_blocking))
        .init();

    Ok(Some(guard))
}

fn connect(config: DashboardConfig) -> anyhow::Result<Dashboard> {
    Ok(Dashboard::connect(config, Arc::new(NotificationBoard::default()))?)
}

async fn run_monitor(config: DashboardConfig) -> anyhow::Result<()> {
    info!("Starting network speed monitor");
    info!("Server: {}", config.api_base_url());
    info!("Polling interval: {}s", config.interval_secs);
    if config.push_enabled {
        info!("Real-time channel: {}", config.ws_url());
    }

    let dashboard = connect(config)?;
    let mut series = dashboard.subscribe();
    let mut status = dashboard.subscribe_status();
    dashboard.start_monitoring();

    info!("Press Ctrl+C to stop monitoring");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            changed = series.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = series.borrow_and_update().clone();
                let stats = view.statistics;
                info!(
                    points = view.points.len(),
                    current = stats.current,
                    peak = stats.peak,
                    average = stats.average,
                    updated = %stats.last_updated_label(),
                    "Series updated"
                );
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(state = ?current.state, message = %current.message, "Monitoring status");
            }
        }
    }

    info!("Shutting down...");
    dashboard.stop_monitoring();
    Ok(())
}

async fn run_samples(mut dashboard: Dashboard, action: SampleCommand) -> anyhow::Result<()> {
    match action {
        SampleCommand::List => {
            let samples = dashboard.list_samples().await?;
            if samples.is_empty() {
                println!("No saved samples");
            }
            for sample in samples {
                println!(
                    "{}  {:<24} {:>5} points  {}",
                    sample.id,
                    sample.name,
                    sample.data_points,
                    sample.timestamp.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SampleCommand::Save { name } => {
            dashboard.fetch_now().await?;
            let id = dashboard.save_sample(&name).await?;
            println!("Saved sample {:?} as {}", name.trim(), id);
        }
        SampleCommand::Show { id } => {
            dashboard.load_sample(&id).await?;
            if let Some(sample) = dashboard.samples().active_sample() {
                println!("{} ({})", sample.name, sample.timestamp.format("%Y-%m-%d %H:%M"));
            }
            print_series(&dashboard);
        }
        SampleCommand::Delete { id, yes } => {
            let deleted = if yes {
                dashboard.delete_sample(&id, &|_: &str| true).await?
            } else {
                dashboard.delete_sample(&id, &prompt_yes_no).await?
            };
            if deleted {
                println!("Deleted {}", id);
            } else {
                println!("Kept {}", id);
            }
        }
        SampleCommand::Compare { ids } => {
            dashboard.set_compare_mode(true);
            for id in &ids {
                match dashboard.load_sample(id).await? {
                    LoadOutcome::SelectionFull => println!("Skipping {}: already comparing the maximum", id),
                    LoadOutcome::AlreadySelected => println!("Skipping {}: already selected", id),
                    _ => {}
                }
            }
            println!("{}", serde_json::to_string_pretty(&dashboard.comparison())?);
        }
    }
    Ok(())
}

fn print_series(dashboard: &Dashboard) {
    let view = dashboard.view();
    for point in &view.points {
        println!("{}  {:>8.1} Mbps", point.time, point.value);
    }
    let stats = view.statistics;
    println!(
        "Current: {:.1}  Peak: {:.1}  Average: {:.1}  Last updated: {}",
        stats.current,
        stats.peak,
        stats.average,
        stats.last_updated_label()
    );
}

fn prompt_yes_no(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
