//! phantom-proxy entry point
//!
//! ```bash
//! # Run the client or server named by the config file
//! phantom-proxy run -c config.yaml
//!
//! # Generate a 32-byte secret key for encryption.key
//! phantom-proxy secret
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use rand::RngCore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use phantom_proxy::config::{load_config, Config, Role};
use phantom_proxy::{Client, Forwarder, Server};

/// Wait this long for in-flight stream tasks after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

enum Command {
    Run { config_path: PathBuf },
    Secret,
    Version,
    Stub(&'static str),
}

fn parse_args() -> Command {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        print_help();
        std::process::exit(1);
    };

    match command.as_str() {
        "run" => {
            let mut config_path = PathBuf::from("config.yaml");
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "-c" | "--config" => {
                        if let Some(path) = args.next() {
                            config_path = PathBuf::from(path);
                        }
                    }
                    other => {
                        eprintln!("Unknown argument: {other}");
                        print_help();
                        std::process::exit(1);
                    }
                }
            }
            Command::Run { config_path }
        }
        "secret" => Command::Secret,
        "version" | "-v" | "--version" => Command::Version,
        "dump" => Command::Stub("dump"),
        "ping" => Command::Stub("ping"),
        "iface" => Command::Stub("iface"),
        "-h" | "--help" => {
            print_help();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r"phantom-proxy v{}

KCP transport over raw TCP packet.

USAGE:
    phantom-proxy <COMMAND>

COMMANDS:
    run -c <PATH>   Run the client or server based on the config file
                    [default: config.yaml]
    secret          Generate a secure, random 32-byte secret key
    version         Print version information
    dump            Inspect captured packets (separate tooling)
    ping            Probe a tunnel endpoint (separate tooling)
    iface           List capture interfaces (separate tooling)

ENVIRONMENT:
    PHANTOM_LOG_LEVEL   Override log.level from the config file
    RUST_LOG            Fine-grained tracing filter (takes precedence)
",
        phantom_proxy::VERSION
    );
}

/// Initialize logging.
///
/// Level priority: `RUST_LOG`, then `PHANTOM_LOG_LEVEL` (already folded
/// into the config by the loader), then `log.level`.
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" | "fatal" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn generate_secret() {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    println!("{}", hex::encode(key));
}

#[tokio::main]
async fn main() -> Result<()> {
    match parse_args() {
        Command::Run { config_path } => run(&config_path).await,
        Command::Secret => {
            generate_secret();
            Ok(())
        }
        Command::Version => {
            println!("phantom-proxy v{}", phantom_proxy::VERSION);
            Ok(())
        }
        Command::Stub(name) => {
            eprintln!("'{name}' ships as separate tooling and is not built into this binary");
            Ok(())
        }
    }
}

async fn run(config_path: &std::path::Path) -> Result<()> {
    let config = load_config(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {config_path:?}: {e}"))?;

    init_logging(&config);
    info!("phantom-proxy v{}", phantom_proxy::VERSION);
    info!("Configuration loaded from {:?}", config_path);

    let cancel = CancellationToken::new();

    match config.role {
        Role::Client => run_client(config, cancel).await,
        Role::Server => run_server(config, cancel).await,
    }
}

async fn run_client(config: Config, cancel: CancellationToken) -> Result<()> {
    let rules = config.forward.clone();
    let client = Client::new(config, cancel.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialize client: {e}"))?;
    client
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start client: {e}"))?;

    let mut forwarders = Vec::with_capacity(rules.len());
    for rule in rules {
        let forwarder = Forwarder::new(client.clone(), rule);
        forwarders.push(forwarder.start(cancel.child_token()));
    }

    wait_for_shutdown().await;
    info!("Shutting down...");
    cancel.cancel();

    let drain = async {
        for handle in forwarders {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("forwarders did not stop within {:?}, dropping", SHUTDOWN_GRACE);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_server(config: Config, cancel: CancellationToken) -> Result<()> {
    info!("Starting server...");
    let server =
        Server::new(config).map_err(|e| anyhow::anyhow!("Failed to initialize server: {e}"))?;

    let run_cancel = cancel.clone();
    let result = tokio::select! {
        r = server.run(run_cancel) => r,
        () = wait_for_shutdown() => {
            info!("Shutting down...");
            Ok(())
        }
    };
    cancel.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    result.map_err(|e| anyhow::anyhow!("Server encountered an error: {e}"))?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        () = wait_for_sigterm() => info!("Received SIGTERM"),
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
