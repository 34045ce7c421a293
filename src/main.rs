use watchtowerd::{
    api::{create_router, ApiState},
    chain::client::EsploraClient,
    config::{Config, NetworkId},
    database::actions::setup_db,
    monitor::{
        poller::{monitor_main_loop, Monitor},
        MonitorMessage,
    },
    notifier::push::ExpoPushGateway,
};

use std::{
    fs,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;

/// How long we tolerate a stuck in-flight cycle before force-exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    name = "watchtowerd",
    version,
    about = "Vault watchtower daemon: monitors Bitcoin networks for vault \
             trigger transactions and pushes notifications until acknowledged."
)]
struct Args {
    /// Port of the HTTP registration surface. 0 picks an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Folder holding the watchtower state databases and the
    /// authorized-addresses databases.
    #[arg(long, default_value = "./db")]
    db_folder: PathBuf,

    /// Don't watch the bitcoin network.
    #[arg(long)]
    disable_bitcoin: bool,

    /// Don't watch the testnet network.
    #[arg(long)]
    disable_testnet: bool,

    /// Don't watch the tape network.
    #[arg(long)]
    disable_tape: bool,

    /// Also watch a regtest network, served by the given Esplora base URL.
    #[arg(long, value_name = "URL")]
    enable_regtest: Option<String>,

    /// Require registered commitments to pay an authorized address.
    #[arg(long)]
    with_commitments: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn config_from_args(args: &Args) -> Config {
    let mut networks = Vec::new();
    if !args.disable_bitcoin {
        networks.push(NetworkId::Bitcoin);
    }
    if !args.disable_testnet {
        networks.push(NetworkId::Testnet);
    }
    if !args.disable_tape {
        networks.push(NetworkId::Tape);
    }
    if args.enable_regtest.is_some() {
        networks.push(NetworkId::Regtest);
    }

    Config {
        db_folder: args.db_folder.clone(),
        networks,
        regtest_url: args.enable_regtest.clone(),
        with_commitments: args.with_commitments,
        port: args.port,
    }
}

// This logs on stdout, systemd or the operator's supervisor handles the rest
fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Installing Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl-C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

fn main() {
    let args = Args::parse();

    setup_logger(args.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    let config = config_from_args(&args);
    if config.networks.is_empty() {
        eprintln!("All networks are disabled, nothing to watch.");
        process::exit(1);
    }

    fs::create_dir_all(&config.db_folder).unwrap_or_else(|e| {
        eprintln!(
            "Error creating db folder '{}': {}",
            config.db_folder.display(),
            e
        );
        process::exit(1);
    });

    // One monitor thread per network, each owning its store, chain
    // client, push gateway and block cache.
    let mut monitors = Vec::with_capacity(config.networks.len());
    for network in config.networks.clone() {
        let db_path = config.db_file(network);
        log::info!("Setting up database for '{}'", network);
        setup_db(&db_path).unwrap_or_else(|e| {
            eprintln!("Error setting up database for '{}': {}", network, e);
            process::exit(1);
        });

        let url = config
            .esplora_url(network)
            .expect("Enabled networks have a base URL");
        let chain = EsploraClient::new(&url).unwrap_or_else(|e| {
            eprintln!("Error setting up chain client for '{}': {}", network, e);
            process::exit(1);
        });
        let push = ExpoPushGateway::new().unwrap_or_else(|e| {
            eprintln!("Error setting up push gateway: {}", e);
            process::exit(1);
        });

        let monitor = Monitor::new(network, db_path, chain, push);
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || monitor_main_loop(monitor, stop_rx));
        monitors.push((network, stop_tx, handle));
    }

    // The registration surface runs on its own runtime until a stop
    // signal comes in.
    let state = Arc::new(ApiState {
        config: config.clone(),
    });
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error setting up async runtime: {}", e);
            process::exit(1);
        });
    let served: Result<(), std::io::Error> = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
        log::info!("HTTP surface listening on {}", listener.local_addr()?);
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
    });
    if let Err(e) = served {
        log::error!("Error serving the HTTP surface: {}", e);
    }

    // Interrupt the monitors' sleep, then wait for the in-flight cycles.
    // A stuck cycle must not keep the process alive forever.
    log::info!("Shutting down, waiting for in-flight cycles..");
    for (_, stop_tx, _) in &monitors {
        let _ = stop_tx.send(MonitorMessage::Shutdown);
    }

    let stopped = Arc::new(AtomicBool::new(false));
    let watchdog_flag = stopped.clone();
    thread::spawn(move || {
        thread::sleep(SHUTDOWN_GRACE);
        if !watchdog_flag.load(Ordering::Relaxed) {
            log::error!("A cycle is stuck, force exiting.");
            process::exit(1);
        }
    });

    for (network, _, handle) in monitors {
        if handle.join().is_err() {
            log::error!("Monitor thread for '{}' panicked", network);
        }
    }
    stopped.store(true, Ordering::Relaxed);

    log::info!("watchtowerd stopped");
}
