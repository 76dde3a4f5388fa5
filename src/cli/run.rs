use anyhow::bail;
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use mg_bridge::apps::App;
use mg_bridge::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint for logs and metrics (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = &context.root;
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `mg-bridge init` first (or set MG_BRIDGE_ROOT).",
            root.display()
        );
    }

    let telemetry = init_tracing(
        root,
        "logs/mg-bridge.log",
        "logs/mg-bridge-events.json",
        &args.log_level,
        args.otel_endpoint.as_deref(),
    )?;
    info!(otel = telemetry.otel_enabled(), "mg-bridge starting up");

    let (app, report) = match App::bootstrap(root, &context.config_manager).await {
        Ok(booted) => booted,
        Err(err) => {
            error!("Failed to bootstrap mg-bridge: {err:#}");
            telemetry.shutdown();
            return Err(err);
        }
    };
    println!(
        "mg-bridge listening on {} with {} workers ({} failed to start); press Ctrl-C to exit",
        app.config().http_addr,
        report.started.len(),
        report.failed.len()
    );

    let served = app.serve(wait_for_ctrl_c()).await;
    if let Err(err) = &served {
        error!("HTTP server stopped: {err:#}");
    }

    info!("mg-bridge shutting down");
    app.shutdown().await;
    telemetry.shutdown();
    println!("Goodbye!");
    served
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received"),
        Err(err) => {
            // without a signal handler only the process dying stops us
            error!("Could not listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    }
}
