use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use procwarden::process::{ProcessHost, WorkerConfiguration, WorkerHandle};
use procwarden::{logging, SupervisorConfig, APP_NAME, APP_VERSION};

/// Exit code reported when the supervisor is interrupted
const INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "procwarden")]
#[command(about = "Run a module as a supervised worker process")]
#[command(version)]
struct Cli {
    /// How long to wait for the worker to exit after Ctrl-C before killing it
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Module the worker host executable runs
    module: PathBuf,

    /// Arguments passed through to the module
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Supervisor panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    logging::init();
    let cli = Cli::parse();
    info!("Starting {} v{}", APP_NAME, APP_VERSION);

    // The module is run directly instead of through a bootstrap module
    let mut config = SupervisorConfig::load();
    config.bootstrap_module = cli.module.clone();
    let host = ProcessHost::builder(config).build()?;
    let timeout = cli
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| host.config().exit_timeout());

    let worker = WorkerHandle::new(&host);
    worker.on_stdout().subscribe(|text: &String| print!("{}", text)).detach();
    worker.on_stderr().subscribe(|text: &String| eprint!("{}", text)).detach();
    let exited = worker.on_exit().next();
    let crashed = worker.on_crash().next();

    let configuration = WorkerConfiguration::new("cli", cli.module.to_string_lossy())
        .with_args(cli.args)
        .with_parent_lifecycle_bound(std::process::id());
    if !worker.start(configuration) {
        bail!("Failed to start worker {:?}", cli.module);
    }

    let code = tokio::select! {
        Some(exit) = exited => {
            info!("Worker exited with code {}", exit.code);
            exit.code
        }
        Some(crash) = crashed => {
            error!("Worker crashed with code {} ({})", crash.code, crash.reason);
            crash.code
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping worker");
            host.shutdown(timeout).await;
            INTERRUPTED
        }
    };

    worker.dispose();
    std::process::exit(code);
}
