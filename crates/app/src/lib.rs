use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pdfdesk_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use pdfdesk_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RedactingMakeWriter,
    DEFAULT_LOG_FILTER,
};
use pdfdesk_core::server::{app_router, app_state_with_config};

#[derive(Debug, Parser)]
#[command(name = "pdfdesk", about = "HTTP service for PDF and document conversions")]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, help = "Directory holding job directories (overrides [jobs].work_dir)")]
    work_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    run_server(cli, resolved_data_dir).await
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Loads `config.toml` and layers the environment and then the command line on top.
fn load_config(cli: &Cli, data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides()?;
    apply_cli_overrides(&mut config, cli);
    Ok(config)
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(work_dir) = &cli.work_dir {
        config.jobs.work_dir = work_dir.clone();
    }
}

async fn run_server(cli: Cli, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&cli, &data_dir)?;
    pdfdesk_core::runtime::log_tool_status(&config.tools.search_dirs);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = app_state_with_config(config, data_dir);
    let sweeper = state.start_sweeper();
    let app = app_router(state);

    info!(%addr, "Starting pdfdesk server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.stop().await;
    served.context("server error")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pdfdesk").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn cli_parses_server_flags() {
        let cli = parse(&[
            "--host",
            "127.0.0.1",
            "-p",
            "9000",
            "--data-dir",
            "/srv/pdfdesk",
            "--work-dir",
            "/tmp/jobs",
            "-vv",
            "--log-filter",
            "pdfdesk_core=debug",
        ]);
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/pdfdesk")));
        assert_eq!(cli.work_dir, Some(PathBuf::from("/tmp/jobs")));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter.as_deref(), Some("pdfdesk_core=debug"));
    }

    #[test]
    fn cli_overrides_win_over_config_file() {
        let cli = parse(&["--port", "9100", "--work-dir", "scratch"]);
        let mut config = AppConfig::default();
        config.server.host = "10.0.0.5".to_string();
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "10.0.0.5");
        assert_eq!(config.jobs.work_dir, PathBuf::from("scratch"));
    }

    #[test]
    fn load_config_writes_defaults_on_first_run() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let data_dir = temp.path().join("data");
        let cli = parse(&["--host", "127.0.0.1"]);

        let config = load_config(&cli, &data_dir).expect("config should load");
        assert!(config_path(&data_dir).is_file());
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.jobs.retention_minutes, AppConfig::default().jobs.retention_minutes);
    }
}
