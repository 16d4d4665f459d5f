//! jobd — remote job runner daemon.
//!
//! ## Usage
//!
//! ```sh
//! jobd serve --listen 0.0.0.0:7070 \
//!     --cert server.pem --key server.key --ca clients-ca.pem \
//!     --admin carol
//! ```
//!
//! The binary doubles as its own container child: the server re-executes
//! it with the hidden `runc` subcommand to set up namespaces, cgroups and
//! mounts before exec'ing the target command. `runc` is not for humans.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobd::launcher::{self, ReexecLauncher};
use jobd::server::Server;
use jobd::spec::{DiskIoLimit, JobSpec, ResourceLimits};
use jobd::tls::{self, TlsOptions};
use jobd::tracker::{CallContext, Tracker};
use jobd::{cgroup, JobState};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "jobd", version, about = "Remote job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the job runner over mutually-authenticated TLS.
    Serve(ServeArgs),
    /// Run one job locally and print its output. Debugging aid.
    #[command(hide = true)]
    Run(RunArgs),
    /// Container child entrypoint used by the server's re-exec.
    #[command(hide = true)]
    Runc(RuncArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TCP listen address.
    #[arg(short, long, default_value = "0.0.0.0:7070")]
    listen: SocketAddr,
    /// Server certificate (PEM).
    #[arg(long)]
    cert: PathBuf,
    /// Server private key (PEM).
    #[arg(long)]
    key: PathBuf,
    /// CA bundle client certificates must chain to (PEM).
    #[arg(long)]
    ca: PathBuf,
    /// Identity allowed to operate on any job. Repeatable.
    #[arg(long = "admin", value_name = "NAME")]
    admins: Vec<String>,
}

/// The job spec flattened onto the command line, shared by `run` and
/// `runc`.
#[derive(Args)]
struct SpecArgs {
    /// Run in an isolated root directory.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Run in an isolated network namespace.
    #[arg(long)]
    isolate_network: bool,
    /// Maximum number of processes (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_processes: u32,
    /// Maximum memory in bytes (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    memory: u64,
    /// Maximum CPU in milli-CPUs (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    cpu: u32,
    /// Disk I/O limits, `dev:rbps:wbps:riops:wiops` with the device as a
    /// path or as `major:minor`. Repeatable.
    #[arg(long = "io", value_name = "LIMIT")]
    io: Vec<DiskIoLimit>,
    /// Target command and its arguments, after `--`.
    #[arg(last = true, required = true)]
    argv: Vec<String>,
}

impl SpecArgs {
    fn into_spec(self) -> JobSpec {
        let mut argv = self.argv.into_iter();
        JobSpec {
            command: argv.next().unwrap_or_default(),
            args: argv.collect(),
            root_dir: self.root,
            isolate_network: self.isolate_network,
            resources: ResourceLimits {
                milli_cpu: self.cpu,
                memory_bytes: self.memory,
                max_processes: self.max_processes,
                io_limits: self.io,
            },
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    spec: SpecArgs,
}

#[derive(Args)]
struct RuncArgs {
    /// Job id: cgroup directory name and container hostname.
    #[arg(long)]
    id: String,
    #[command(flatten)]
    spec: SpecArgs,
}

// =============================================================================
// Entrypoints
// =============================================================================

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        // The container child must stay single-threaded until it execs,
        // so it never touches the async runtime or the subscriber.
        Command::Runc(args) => run_container(args),
        Command::Serve(args) => runtime()?.block_on(serve(args)),
        Command::Run(args) => runtime()?.block_on(run_local(args)),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not build async runtime")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// `jobd runc`: phase 2 of the container launch. Diagnostics go to the
/// setup-error pipe, not to a logger.
fn run_container(args: RuncArgs) -> anyhow::Result<()> {
    let spec = args.spec.into_spec();
    launcher::exec_job(&args.id, &spec);
    // exec_job returns only when the exec never happened.
    std::process::exit(1);
}

/// `jobd serve`: the server proper.
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing();

    // rustls panics without a process-level crypto provider.
    rustls::crypto::ring::default_provider().install_default().ok();

    cgroup::init().context("could not initialize job cgroups")?;

    let tls_config = tls::server_config(&TlsOptions {
        cert: args.cert,
        key: args.key,
        ca: args.ca,
    })?;

    let tracker = Arc::new(Tracker::new(
        Arc::new(ReexecLauncher::new()),
        args.admins,
    ));
    let shutdown = CancellationToken::new();
    let server = Server::bind(args.listen, tls_config, tracker, shutdown).await?;
    server.run().await?;
    Ok(())
}

/// `jobd run`: start one job through the real launcher, follow its logs
/// to stdout, and exit with its exit code.
async fn run_local(args: RunArgs) -> anyhow::Result<()> {
    init_tracing();
    cgroup::init().context("could not initialize job cgroups")?;

    let tracker = Tracker::new(Arc::new(ReexecLauncher::new()), ["local".to_string()]);
    let ctx = CallContext::new("local", CancellationToken::new());

    let id = tracker.start(&ctx, args.spec.into_spec()).await?;
    let mut records = tracker.subscribe(&ctx, &id, true).await?;

    let mut stdout = std::io::stdout();
    while let Some(record) = records.recv().await {
        stdout.write_all(&record.line)?;
    }

    // The stream has ended; wait for the reaper to settle the status.
    tracker.stop(&ctx, &id, false).await?;
    let snapshot = tracker.get(&ctx, &id)?;
    info!(job = %id, exit_code = snapshot.status.exit_code, "job completed");

    if snapshot.status.state == JobState::Completed && snapshot.status.exit_code != 0 {
        std::process::exit(snapshot.status.exit_code as i32);
    }
    Ok(())
}
