use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ricochet_config::{load_config, validate_config};
use ricochet_core::defaults::{DEFAULT_SHUTDOWN_TIMEOUT_SECS, STORAGE_DIR};
use ricochet_proxy::ProxyManager;
use ricochet_rules::RuleSet;
use ricochet_store::Store;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  ╭────────────────────────────────────────╮
  │  ricochet — stealth traffic redirector │
  ╰────────────────────────────────────────╯
"#;

#[derive(Parser, Debug)]
#[command(name = "ricochet", version, about = "Stealth traffic redirector for red-team infrastructure")]
struct Args {
    /// Config file path (YAML)
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Log file path (in addition to stderr)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8, log_file: Option<&PathBuf>) -> Result<(), std::io::Error> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    print!("{}", &BANNER[1..]);
    println!("  v{}\n", ricochet_core::VERSION);

    let args = Args::parse();
    if let Err(err) = init_tracing(args.verbose, args.log.as_ref()) {
        eprintln!("can't open log file: {err}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    validate_config(&config)?;

    info!("opening storage");
    let store = Store::open(STORAGE_DIR)?;

    info!(rules = config.rules.len(), "building rules");
    let rules = RuleSet::build(&store, &config.rules, &config.globals)?;

    info!(proxies = config.proxies.len(), "starting proxies");
    let manager = ProxyManager::new(&config, &rules, &store)?;
    manager.start_all().await?;

    wait_for_signal().await;
    info!("shutting down proxies");
    if let Err(err) = manager
        .shutdown(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS))
        .await
    {
        warn!(error = %err, "shutdown incomplete");
    } else {
        info!("shutdown successful");
    }
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
