use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::LevelFilter;
use tokio::net::TcpListener;
use tracing::{info, warn};

use clawbridge::api::{AppState, create_router};
use clawbridge::config::BridgeConfig;

const APP_NAME: &str = "clawbridge";

/// Session cache GC cadence and idle threshold.
const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const GC_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = BridgeConfig::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
        Command::Config { command } => handle_config(&cli.common, config, command),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_serve(config: BridgeConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Bridge between browser webchat clients and the OpenClaw gateway.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on (overrides API_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = match effective_log_level(common) {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("clawbridge={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color = common.no_color
            || std::env::var_os("NO_COLOR").is_some()
            || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(common));
    builder.try_init().ok();
}

fn handle_config(common: &CommonOpts, config: BridgeConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config).context("serializing config to JSON")?
                );
            } else {
                println!("{config:#?}");
            }
            Ok(())
        }
        ConfigCommand::Path => {
            let path = common
                .config
                .clone()
                .or_else(BridgeConfig::default_config_path)
                .context("no config path could be resolved")?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn handle_serve(config: BridgeConfig, cmd: ServeCommand) -> Result<()> {
    info!("Starting clawbridge...");
    info!("Gateway endpoint: {}", config.gateway_ws_url);
    if !config.tls_verify {
        warn!("TLS verification is DISABLED for outbound gateway connections");
    }
    if !config.streaming_enabled {
        info!("Per-request streaming endpoint is disabled");
    }

    let port = cmd.port.unwrap_or(config.api_port);
    let state = AppState::new(config);

    // Periodically drop idle session cache entries.
    let gc_sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            gc_sessions.gc_idle(GC_IDLE_THRESHOLD);
        }
    });

    let pool = state.pool.clone();
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", cmd.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cmd.host, port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("serving HTTP")?;

    pool.close_all();
    info!("Gateway connections closed, bye");
    Ok(())
}
