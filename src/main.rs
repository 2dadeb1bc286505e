use clap::Parser;
use p2p_peer_session::{
    arguments_parser::Args,
    peer::{LoggingBlockManager, MemoryAddressBook, PeerContext, PeerManager},
    telemetry::{
        log_operation_failure, log_operation_success, log_session_snapshots, setup_telemetry,
        TelemetryConfig,
    },
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Addresses the in-process address book keeps
const ADDRESS_BOOK_CAPACITY: usize = 2500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Argument validation error: {}", e);
        std::process::exit(1);
    }

    // Setup telemetry based on configuration
    let telemetry_config = TelemetryConfig::from_env();
    setup_telemetry(args.log_level.clone(), args.log_format.clone())
        .map_err(|e| anyhow::anyhow!("Failed to setup telemetry: {}", e))?;

    info!(
        service_name = %telemetry_config.service_name,
        service_version = %telemetry_config.service_version,
        environment = %telemetry_config.environment,
        bind_address = ?args.bind_address,
        peer_count = args.peer_addresses.len(),
        persistent = args.persistent,
        "Starting peer session node"
    );

    let start_time = Instant::now();
    let result = run_node(&args).await;
    let duration = start_time.elapsed();

    match result {
        Ok(_) => {
            log_operation_success("node", duration);
            info!("Node stopped");
        }
        Err(e) => {
            log_operation_failure("node", e.as_ref(), duration);
            error!(error = %e, "Node failed");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Listen and/or dial, then run until Ctrl-C
async fn run_node(args: &Args) -> anyhow::Result<()> {
    let (ctx, events) = PeerContext::new(
        args.peer_config(),
        Arc::new(MemoryAddressBook::new(ADDRESS_BOOK_CAPACITY)),
        Arc::new(LoggingBlockManager::new(args.start_height)),
    );
    let manager = PeerManager::new(ctx, events);
    manager.start();

    if let Some(bind) = &args.bind_address {
        let local_addr = manager
            .listen(bind)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen on {}: {}", bind, e))?;
        info!(local_addr = %local_addr, "Accepting inbound peers");
    }

    for addr in &args.peer_addresses {
        match manager.connect(addr, args.persistent) {
            Ok(peer) => info!(peer = %peer, "Dialing peer"),
            Err(e) => warn!(peer_addr = %addr, error = %e, "Can't dial peer"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for shutdown signal: {}", e))?;
    info!(peer_count = manager.peer_count(), "Shutdown requested");

    log_session_snapshots(&manager.snapshots());
    manager.shutdown().await;

    Ok(())
}
