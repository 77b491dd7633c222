//! Process entry for the OpenClaw gateway.
//!
//! Exit codes: 0 normal shutdown, 2 config invalid at startup, 3 identity
//! write failure, 4 port bind failure, 64 internal invariant violation.

use openclaw_gateway::{
    bind_listener, serve, Authenticator, ConfigHandle, ConfigReloader, ControlPlane, NodeLinks,
    ServerState,
};
use openclaw_types::config::{discover_config, load_config, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_IDENTITY_FAILURE: u8 = 3;
const EXIT_BIND_FAILURE: u8 = 4;
const EXIT_INVARIANT: u8 = 64;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,openclaw=debug".into()),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("tokio runtime init failed: {e}");
            return ExitCode::from(EXIT_INVARIANT);
        }
    };
    ExitCode::from(runtime.block_on(run()))
}

async fn run() -> u8 {
    // Config discovery: OPENCLAW_HOME (or cwd) holds openclaw.json/.yaml/.json5.
    let home = std::env::var("OPENCLAW_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let (mut config, config_path) = match discover_config(&home) {
        Some(path) => match load_config(&path) {
            Ok(config) => (config, path),
            Err(e) => {
                error!("config invalid: {e}");
                return EXIT_CONFIG_INVALID;
            }
        },
        None => {
            info!("no config file found under {} — using defaults", home.display());
            (Config::default(), home.join("openclaw.json"))
        }
    };
    for warning in config.clamp_bounds() {
        warn!("config: {warning}");
    }
    if let Err(e) = config.validate() {
        error!("config invalid: {e}");
        return EXIT_CONFIG_INVALID;
    }

    let workspace = config.agents.defaults.workspace.clone();
    let workspace = if workspace.as_os_str().is_empty() || workspace.starts_with("~") {
        home.clone()
    } else {
        workspace
    };
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        error!("cannot create workspace {}: {e}", workspace.display());
        return EXIT_IDENTITY_FAILURE;
    }

    let bind = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid gateway bind address {bind}: {e}");
            return EXIT_CONFIG_INVALID;
        }
    };

    let config_handle = Arc::new(ConfigHandle::new(config, &config_path));
    let cp = match ControlPlane::assemble(&workspace, config_handle.clone()) {
        Ok(cp) => cp,
        Err(e) => {
            error!("boot failed: {e}");
            return match e {
                openclaw_types::OpenClawError::StorageUnavailable(_) => EXIT_IDENTITY_FAILURE,
                openclaw_types::OpenClawError::ConfigInvalid { .. } => EXIT_CONFIG_INVALID,
                _ => EXIT_INVARIANT,
            };
        }
    };
    info!(
        device = %cp.identity.public_key(),
        workspace = %workspace.display(),
        "control plane assembled"
    );

    let listener = match bind_listener(addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {addr}: {e}");
            return EXIT_BIND_FAILURE;
        }
    };

    let reloader = Arc::new(ConfigReloader::new(config_handle.clone(), cp.bus.clone()));
    cp.wire_reloads(&reloader);
    tokio::spawn(reloader.clone().watch());

    cp.start().await;

    let auth = Arc::new(Authenticator::new(
        cp.pairing.clone(),
        config_handle.get().gateway.auth_token.clone(),
        cp.nodes.clone(),
    ));
    let state = Arc::new(ServerState {
        cp: cp.clone(),
        reloader,
        auth,
        nodes: Arc::new(NodeLinks::new()),
    });

    info!("gateway listening on ws://{addr}/");
    let server = tokio::spawn(serve(listener, state));

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("signal handler");
            tokio::select! {
                _ = ctrl_c => {},
                _ = term.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };

    tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received");
            if let Err(e) = cp.cron.persist() {
                warn!("cron persist on shutdown failed: {e}");
            }
            EXIT_OK
        }
        result = server => {
            match result {
                Ok(Ok(())) => EXIT_OK,
                Ok(Err(e)) => {
                    error!("server error: {e}");
                    EXIT_INVARIANT
                }
                Err(e) => {
                    error!("server task panicked: {e}");
                    EXIT_INVARIANT
                }
            }
        }
    }
}
