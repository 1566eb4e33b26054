use clap::Parser;
use drowse::config::Opts;
use drowse::docker::{DockerClient, DockerError, SharedPorts};
use drowse::firewall::{Firewall, FirewallError};
use drowse::idler::{Idler, IdlerError, Waiter, WaiterPool};
use drowse::net;
use drowse::queue::{QueueOpenError, QueueSet};
use drowse::systemd::{Systemd, SystemdError};
use std::io;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, Level};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Default container manager endpoint
const DOCKER_SOCKET_DEFAULT: &str = "unix:///var/run/docker.sock";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Verbosity of the logger
    #[clap(short, long, default_value_t = Level::INFO)]
    verbosity: Level,
    /// Container manager endpoint
    #[clap(short = 'S', long, default_value = DOCKER_SOCKET_DEFAULT)]
    docker_socket: String,
    /// Host address interception rules match on; auto-detected when omitted
    #[clap(short = 'H', long)]
    host_ip: Option<IpAddr>,
    /// Engine knobs
    #[clap(flatten)]
    opts: Opts,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let args = Args::parse();
    // Build our log filter and subscriber
    let env_filter = EnvFilter::new(format!("{}={}", clap::crate_name!(), args.verbosity));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set global logger: {err}");
        return ExitCode::FAILURE;
    }
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("exiting: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), RunError> {
    let config = args.opts.config();
    if config.queues < 2 {
        return Err(RunError::TooFewQueues(config.queues));
    }
    let host_ip = match args.host_ip {
        Some(ip) => ip,
        None => net::detect_host_ip().ok_or(RunError::NoHostIp)?,
    };
    info!(%host_ip, "interception rules will match this address");

    // Fail fast if either external collaborator is missing
    let connect_err = |source| RunError::Docker {
        socket: args.docker_socket.clone(),
        source,
    };
    let docker = DockerClient::connect(&args.docker_socket)
        .await
        .map_err(&connect_err)?;
    let systemd = Systemd::default();
    systemd.check()?;
    let firewall = Arc::new(Firewall::new(config.chain, host_ip)?);

    // All queues must bind or the engine cannot run
    let mut queues = QueueSet::open(config.queues)?.into_queues();
    let trigger = queues.remove(0);

    // Seed the port lookup before any packet can arrive
    let ports: SharedPorts = Arc::new(RwLock::new(
        docker.port_map().await.map_err(&connect_err)?,
    ));

    let (pool, release_tx) = WaiterPool::new(config.queues);
    for (offset, queue) in queues.into_iter().enumerate() {
        let slot = (offset + 1) as u16;
        let waiter = Waiter::new(
            slot,
            queue,
            ports.clone(),
            systemd,
            firewall.clone(),
            release_tx.clone(),
            config,
        );
        thread::Builder::new()
            .name(format!("waiter-{slot}"))
            .spawn(move || {
                if let Err(err) = waiter.run() {
                    error!(slot, "waiter exited: {err}");
                }
            })
            .map_err(RunError::SpawnWorker)?;
    }
    drop(release_tx);

    let shutdown = Arc::new(AtomicBool::new(false));
    let idler = Idler::new(
        trigger,
        pool,
        ports,
        docker,
        systemd,
        firewall,
        config,
        shutdown.clone(),
    );
    let (done_tx, done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("idler".into())
        .spawn(move || {
            let _ = done_tx.send(idler.run());
        })
        .map_err(RunError::SpawnWorker)?;

    // Run until interrupted or the orchestrator dies; waiters go down
    // with the process
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Relaxed);
            Ok(())
        }
        result = done_rx => match result {
            Ok(outcome) => outcome.map_err(RunError::from),
            Err(_) => Err(RunError::IdlerGone),
        },
    }
}

#[derive(Debug, Error)]
enum RunError {
    #[error("no usable host address found; pass --host-ip")]
    NoHostIp,
    #[error("unable to connect to docker at {socket}: {source}")]
    Docker {
        socket: String,
        source: DockerError,
    },
    #[error(transparent)]
    Systemd(#[from] SystemdError),
    #[error("failed to initialize the firewall driver: {0}")]
    Firewall(#[from] FirewallError),
    #[error("need at least two queues (trigger plus one waiter), got {0}")]
    TooFewQueues(u16),
    #[error(transparent)]
    Queue(#[from] QueueOpenError),
    #[error("failed to spawn worker thread: {0}")]
    SpawnWorker(io::Error),
    #[error(transparent)]
    Idler(#[from] IdlerError),
    #[error("idler thread terminated without reporting a result")]
    IdlerGone,
}

impl RunError {
    /// Queue trouble exits 2, everything else startup-fatal exits 1
    fn exit_code(&self) -> u8 {
        match self {
            RunError::Queue(_) | RunError::TooFewQueues(_) => 2,
            _ => 1,
        }
    }
}
