//! buildhand, a distributed build worker.
//!
//! Claims pipeline builds from a shared queue and executes them as
//! container graphs on the configured runtime, streaming logs and state
//! back to the control plane.
//!
//! Exit codes: 0 on normal shutdown, 1 on configuration errors, 2 when
//! the container runtime is unreachable at startup.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use buildhand_client::HttpControlPlane;
use buildhand_runtime::RuntimeErrorKind;
use buildhand_worker::{Config, InMemoryQueue, Queue, Worker};

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

/// Distributed build worker for container pipelines.
#[derive(Debug, Parser)]
#[command(name = "buildhand", version, about)]
struct Args {
    /// Control-plane base URL
    #[arg(long, env = "BUILDHAND_SERVER_ADDR")]
    server_addr: String,

    /// Worker-to-server shared secret
    #[arg(long, env = "BUILDHAND_SERVER_SECRET", default_value = "")]
    server_secret: String,

    /// Hostname reported on build records
    #[arg(long, env = "BUILDHAND_HOSTNAME")]
    hostname: Option<String>,

    /// Maximum concurrent stage parallelism per build
    #[arg(long, env = "BUILDHAND_EXECUTOR_THREADS", default_value_t = 1)]
    executor_threads: usize,

    /// Queue backend ("memory")
    #[arg(long, env = "BUILDHAND_QUEUE_DRIVER", default_value = "memory")]
    queue_driver: String,

    /// Comma-separated routing labels this worker serves
    #[arg(long, env = "BUILDHAND_WORKER_ROUTES", value_delimiter = ',')]
    worker_routes: Vec<String>,

    /// Container runtime backend ("docker", "mock")
    #[arg(long, env = "BUILDHAND_RUNTIME_DRIVER", default_value = "docker")]
    runtime_driver: String,

    /// External secret store address
    #[arg(long, env = "BUILDHAND_SECRET_ADDR")]
    secret_addr: Option<String>,

    /// External secret store token
    #[arg(long, env = "BUILDHAND_SECRET_TOKEN")]
    secret_token: Option<String>,

    /// Upper bound per build, in seconds
    #[arg(long, env = "BUILDHAND_BUILD_TIMEOUT", default_value_t = 1800)]
    build_timeout: u64,

    /// Log filter directive
    #[arg(long, env = "BUILDHAND_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and version are normal exits
            if e.use_stderr() {
                eprint!("{e}");
                return ExitCode::from(EXIT_CONFIG);
            }
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let mut config = Config {
        server_address: args.server_addr,
        shared_secret: args.server_secret,
        executor_threads: args.executor_threads,
        queue_driver: args.queue_driver,
        routes: args.worker_routes,
        runtime_driver: args.runtime_driver,
        secret_store_address: args.secret_addr,
        secret_store_token: args.secret_token,
        build_timeout: Duration::from_secs(args.build_timeout),
        log_level: args.log_level,
        ..Config::default()
    };
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }

    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    init_logging(&config.log_level);
    info!(host = %config.hostname, driver = %config.runtime_driver, "buildhand starting");

    let runtime = match buildhand_runtime::connect(&config.runtime_driver).await {
        Ok(runtime) => runtime,
        Err(e) => {
            if matches!(e.kind(), RuntimeErrorKind::PreconditionFailed { .. }) {
                error!(%e, "runtime driver misconfigured");
                return ExitCode::from(EXIT_CONFIG);
            }
            error!(%e, "runtime unavailable");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let queue: Arc<dyn Queue> = match config.queue_driver.as_str() {
        "memory" => Arc::new(InMemoryQueue::new()),
        other => {
            error!(driver = other, "unknown queue driver");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let api = Arc::new(HttpControlPlane::new(
        config.server_address.clone(),
        config.shared_secret.clone(),
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let worker = Worker::new(config, queue, runtime, api, shutdown);
    match worker.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "worker exited with error");
            ExitCode::FAILURE
        }
    }
}
