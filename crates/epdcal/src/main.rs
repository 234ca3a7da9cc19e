//! epdcal entry point.

mod cli;
mod hal;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use epdcal_core::tracing::{init_tracing, TracingConfig};
use epdcal_server::{
    spawn_signal_listener, AppState, Config, CycleOptions, Orchestrator, ShutdownHandle,
    DEFAULT_CONFIG_PATH,
};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();

    // Debug runs keep everything in the working directory so no root
    // permissions are needed during development.
    if cli.debug && cli.config == std::path::Path::new(DEFAULT_CONFIG_PATH) {
        cli.config = "./config.yaml".into();
    }

    let tracing_config = if cli.debug {
        TracingConfig::debug()
    } else {
        TracingConfig::default()
    };
    init_tracing(tracing_config).expect("failed to initialize tracing");

    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(config_path = %cli.config.display(), error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    if let Some(listen) = cli.listen.take() {
        config.listen = listen;
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.listen,
        timezone = %config.timezone,
        refresh = %config.refresh,
        horizon_days = config.horizon_days,
        source_count = config.ics.len(),
        once = cli.once,
        render_only = cli.render_only,
        debug = cli.debug,
        "epdcal starting"
    );

    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone());

    // HTTP API + embedded UI; the capture step renders through it.
    let state = match AppState::new(config.clone(), cli.debug) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to build server state");
            return ExitCode::FAILURE;
        }
    };
    let web_shutdown = shutdown.clone();
    let web_trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = epdcal_server::web::serve(state, web_shutdown).await {
            error!(error = %e, "HTTP server failed");
            web_trigger.trigger();
        }
    });

    // Panel bring-up; failure degrades to render-only operation.
    let panel = if cli.render_only {
        None
    } else {
        match hal::open_panel() {
            Ok(panel) => {
                info!("panel driver initialized");
                Some(panel)
            }
            Err(e) => {
                error!(error = %e, "panel unavailable, continuing render-only");
                None
            }
        }
    };

    let options = CycleOptions {
        once: cli.once,
        render_only: cli.render_only,
        dump: cli.dump,
        debug: cli.debug,
    };
    let mut orchestrator = match Orchestrator::new(config, options, panel, shutdown.clone()) {
        Ok(orch) => orch,
        Err(e) => {
            error!(error = %e, "failed to build orchestrator");
            return ExitCode::FAILURE;
        }
    };

    let status = if cli.once {
        match orchestrator.run_once().await {
            Ok(()) => {
                info!("single cycle completed");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "single cycle failed");
                ExitCode::FAILURE
            }
        }
    } else {
        match orchestrator.run_scheduled().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "refresh loop failed");
                ExitCode::FAILURE
            }
        }
    };

    // Stop the HTTP server and give in-flight work a short drain so the
    // panel lands in deep sleep before the process exits.
    shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("epdcal exiting");
    status
}
