//! tim-gateway: intercepting federation gateway
//!
//! This is the main entry point for the tim-gateway binary. It handles CLI
//! argument parsing, configuration loading, telemetry initialization, and
//! wires up the two gateways.
//!
//! # Logging
//!
//! - **Audit logging**: Goes to syslog as single-line JSON, one event per
//!   security decision
//! - **Debug logging**: `tracing` on stderr, filtered by `-v`, `RUST_LOG` or
//!   `general.log_level`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tim_gateway::{
    cli::{Cli, Commands},
    config::{Config, ConfigLoader, GeneralConfig},
    federation::FederationAllowList,
    proxy::{
        CertificateAuthority, CertificateCache, Gateway, GatewayServer, PlainHandler,
        RelayEngine, TunnelHandler,
    },
    telemetry::AuditLogger,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    if let Commands::GenerateCa { out, common_name } = cli.command() {
        init_tracing(cli.verbose, None)?;
        return generate_ca(out, common_name);
    }

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, Some(&config.general.log_level))?;
    debug!("Loaded configuration: {:?}", config);

    run(config).await
}

/// Run both gateways until SIGINT or SIGTERM.
async fn run(config: Config) -> Result<()> {
    let audit = Arc::new(create_audit_logger(&config.general));

    // Invalid CA material is fatal: the outbound gateway cannot work without it
    let ca = Arc::new(
        CertificateAuthority::load(
            &config.outbound.ca_certificate_file,
            &config.outbound.ca_private_key_file,
        )
        .context("Failed to load root CA")?,
    );

    let (allow_list, refresh_engine) =
        FederationAllowList::open(&config.federation_list, audit.clone())
            .context("Failed to open federation list cache")?;
    let refresh_task = tokio::spawn(refresh_engine.run());

    let relay = Arc::new(
        RelayEngine::new(&config.relay, &[]).context("Failed to create relay client")?,
    );
    let inbound = Arc::new(
        Gateway::inbound(&config, allow_list.clone(), relay.clone(), audit.clone())
            .context("Failed to create inbound gateway")?,
    );
    let outbound = Arc::new(Gateway::outbound(
        &config,
        allow_list,
        relay,
        audit.clone(),
    ));
    let certs = Arc::new(CertificateCache::new(ca, audit.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let inbound_server = GatewayServer::bind(
        "inbound",
        config.inbound.listen,
        Arc::new(PlainHandler::new(inbound)),
        shutdown_rx.clone(),
        audit.clone(),
    )
    .await
    .with_context(|| format!("Failed to bind inbound listener on {}", config.inbound.listen))?;

    let outbound_server = GatewayServer::bind(
        "outbound",
        config.outbound.listen,
        Arc::new(TunnelHandler::new(certs, outbound)),
        shutdown_rx,
        audit.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "Failed to bind outbound listener on {}",
            config.outbound.listen
        )
    })?;

    let servers = [
        tokio::spawn(inbound_server.run()),
        tokio::spawn(outbound_server.run()),
    ];

    shutdown_signal().await?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    // The refresh loop writes its files between await points.
    refresh_task.abort();

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Gateway stopped with error: {}", e),
            Err(e) => warn!("Gateway task failed: {}", e),
        }
    }

    Ok(())
}

/// Write a fresh root CA into `out`.
fn generate_ca(out: &Path, common_name: &str) -> Result<()> {
    let ca = CertificateAuthority::generate(common_name).context("Failed to generate root CA")?;
    let (cert_path, key_path) = ca
        .write_pem(out)
        .with_context(|| format!("Failed to write root CA to {:?}", out))?;

    println!("Root certificate: {}", cert_path.display());
    println!("Private key:      {}", key_path.display());
    Ok(())
}

/// Syslog audit logger, or the null logger when disabled or unavailable.
fn create_audit_logger(general: &GeneralConfig) -> AuditLogger {
    if !general.audit_syslog {
        debug!("Audit logging to syslog disabled");
        return AuditLogger::new_null();
    }

    match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("Audit events will be dropped: {}", e);
            AuditLogger::new_null()
        }
    }
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured level, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: Option<&str>) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(configured.unwrap_or("warn")))
            .unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
