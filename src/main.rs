//! CLI entry point for spectro-scan
//!
//! Provides commands for:
//! - Running a scan as the controller (listens for one analyzer)
//! - Running the analyzer node (connects to the controller)
//!
//! Both nodes use simulated devices from `hardware::mock`; real drivers plug
//! in through the capability traits.
//!
//! # Usage
//!
//! ```bash
//! spectro-scan controller --config config/scan.toml --ramp -1 1 41 --results results.csv
//! spectro-scan analyzer --config config/scan.toml --connect 127.0.0.1:7878
//! spectro-scan controller --config config/scan.toml --retry-failed
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use spectro_scan::acquisition::simulated;
use spectro_scan::config::ScanConfig;
use spectro_scan::hardware::mock::MockVoltageSource;
use spectro_scan::network::{
    AnalyzerNode, AnalyzerSettings, ControllerSession, ControllerSettings, MessageLink,
};
use spectro_scan::scan::{points, ScanRunner, StepQueue, ValidationGate};
use spectro_scan::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

#[derive(Parser)]
#[command(name = "spectro-scan")]
#[command(about = "Two-node stepped spectroscopy scan", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/scan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a scan pass; waits for one analyzer to connect
    Controller(ControllerArgs),

    /// Serve intensity measurements to a controller
    Analyzer {
        /// Controller address (defaults to `network.endpoint`)
        #[arg(long)]
        connect: Option<String>,
    },
}

#[derive(Args)]
struct ControllerArgs {
    /// Listen address (defaults to `network.endpoint`)
    #[arg(long)]
    listen: Option<String>,

    /// Scan point CSV (step_index,voltage)
    #[arg(long, group = "source")]
    points: Option<PathBuf>,

    /// Linear ramp: START STOP N
    #[arg(long, group = "source", num_args = 3, value_names = ["START", "STOP", "N"], allow_negative_numbers = true)]
    ramp: Option<Vec<f64>>,

    /// Replay the steps recorded in the retry ledger
    #[arg(long, group = "source")]
    retry_failed: bool,

    /// Write gate results here as CSV. With --retry-failed, an existing file
    /// is updated with the rerun's results.
    #[arg(long)]
    results: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ScanConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::Controller(args) => run_controller(&config, args).await,
        Commands::Analyzer { connect } => run_analyzer(&config, connect).await,
    }
}

fn step_queue(args: &ControllerArgs) -> Result<Option<StepQueue>> {
    if let Some(path) = &args.points {
        return Ok(Some(points::load_csv(path)?));
    }
    if let Some(ramp) = &args.ramp {
        let [start, stop, n] = ramp.as_slice() else {
            bail!("--ramp takes START STOP N");
        };
        if *n < 1.0 || n.fract() != 0.0 || *n > f64::from(u32::MAX) {
            bail!("--ramp N must be a positive whole number, got {n}");
        }
        return Ok(Some(StepQueue::linear(*start, *stop, *n as u32)?));
    }
    if args.retry_failed {
        return Ok(None);
    }
    bail!("pass one of --points <csv>, --ramp START STOP N or --retry-failed")
}

async fn run_controller(config: &ScanConfig, args: ControllerArgs) -> Result<()> {
    let queue = step_queue(&args)?;

    let output = Arc::new(MockVoltageSource::new(
        config.actuation.voltage_limit,
        config.actuation.max_ramp_rate,
    ));
    let scheduler = simulated::frequency_scheduler(config, Arc::clone(&output))?;

    let listen = args.listen.as_deref().unwrap_or(&config.network.endpoint);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(endpoint = %listen, "controller waiting for analyzer");
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    info!(%peer, "analyzer connected");

    let session = ControllerSession::new(
        MessageLink::new(stream, peer.to_string()),
        output,
        scheduler,
        ControllerSettings::from_config(config),
    )?;
    let mut runner = ScanRunner::new(
        session,
        ValidationGate::new(config.thresholds.stability()),
        &config.ledger.path,
    );

    let report = match queue {
        Some(queue) => runner.run_pass(queue, false).await?,
        None => {
            let rerun = runner.rerun_failed(&config.ledger.path).await?;
            match &args.results {
                Some(path) => rerun.onto_previous_results(path)?,
                None => rerun,
            }
        }
    };

    if let Some(path) = &args.results {
        report.write_results_csv(path)?;
    }
    info!(
        session_id = %report.session_id,
        accepted = report.accepted(),
        failed = report.failed_steps(),
        ledger = %runner.ledger_path().display(),
        "scan complete"
    );
    Ok(())
}

async fn run_analyzer(config: &ScanConfig, connect: Option<String>) -> Result<()> {
    let scheduler = simulated::intensity_scheduler(config)?;

    let endpoint = connect.unwrap_or_else(|| config.network.endpoint.clone());
    let stream = TcpStream::connect(&endpoint)
        .await
        .with_context(|| format!("connecting to controller at {endpoint}"))?;
    stream.set_nodelay(true)?;
    info!(%endpoint, "connected to controller");

    let mut node = AnalyzerNode::new(
        MessageLink::new(stream, endpoint),
        scheduler,
        AnalyzerSettings::from_config(config),
    );
    let summary = node.run().await?;
    info!(
        reported = summary.steps_reported,
        abandoned = summary.steps_abandoned,
        "analyzer finished"
    );
    Ok(())
}
