mod pool;
mod sweep;
mod waiter;

pub use pool::{Reservation, WaiterPool};
pub use waiter::{Waiter, WaiterError};

use crate::config::Config;
use crate::docker::{ContainerId, DockerClient, SharedPorts};
use crate::firewall::Firewall;
use crate::packet;
use crate::systemd::{JobMode, Systemd};
use nfq::{Message, Queue, Verdict};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// How long the event loop sleeps when the trigger queue is empty
const TRIGGER_POLL: Duration = Duration::from_millis(50);

/// The orchestrator: one event loop fanning trigger packets, waiter
/// release signals, and sweep ticks into container starts and stops
///
/// Slot state lives here and nowhere else; waiters only report back over
/// the release channel, so reservation is naturally serialized and two
/// packets for one container can never start its unit twice.
pub struct Idler {
    trigger: Queue,
    pool: WaiterPool,
    ports: SharedPorts,
    docker: DockerClient,
    systemd: Systemd,
    firewall: Arc<Firewall>,
    config: Config,
    zero_ticks: HashMap<ContainerId, u32>,
    shutdown: Arc<AtomicBool>,
}

impl Idler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trigger: Queue,
        pool: WaiterPool,
        ports: SharedPorts,
        docker: DockerClient,
        systemd: Systemd,
        firewall: Arc<Firewall>,
        config: Config,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Idler {
            trigger,
            pool,
            ports,
            docker,
            systemd,
            firewall,
            config,
            zero_ticks: HashMap::new(),
            shutdown,
        }
    }

    pub fn run(mut self) -> Result<(), IdlerError> {
        self.trigger.set_nonblocking(true);
        let mut last_sweep = Instant::now();
        info!(queues = self.config.queues, "idler running");
        while !self.shutdown.load(Ordering::Relaxed) {
            self.pool.drain_releases();
            if last_sweep.elapsed() >= self.config.sweep_interval {
                self.sweep();
                last_sweep = Instant::now();
            }
            match self.trigger.recv() {
                Ok(msg) => self.unidle(msg)?,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(TRIGGER_POLL),
                Err(err) => return Err(IdlerError::Nfq(err)),
            }
        }
        info!("idler stopping");
        Ok(())
    }

    /// React to a packet that hit an interception rule: wake the target
    /// container and hand the packet to a waiter
    fn unidle(&mut self, mut msg: Message) -> Result<(), IdlerError> {
        let Some(id) = self.classify(&msg) else {
            return self.accept(msg);
        };
        let Reservation { slot, reused } = self.pool.reserve(&id);
        if !reused {
            info!(container = %id, slot, "starting container");
            if let Err(err) = self.systemd.start(&id.unit_name(), JobMode::Fail) {
                // fail open: better a refused connection than a hung client
                error!(container = %id, "unidle: could not start unit: {err}");
                self.pool.free(slot);
                return self.accept(msg);
            }
        }
        msg.set_verdict(Verdict::Queue(slot));
        self.trigger.verdict(msg).map_err(IdlerError::Nfq)
    }

    fn classify(&self, msg: &Message) -> Option<ContainerId> {
        let port = match packet::destination_port(msg) {
            Ok(port) => port,
            Err(err) => {
                warn!("accepting unclassifiable trigger packet: {err}");
                return None;
            }
        };
        let id = self
            .ports
            .read()
            .expect("port map lock poisoned")
            .get(&port)
            .cloned();
        if id.is_none() {
            warn!(port, "no container publishes the intercepted port");
        }
        id
    }

    fn accept(&mut self, mut msg: Message) -> Result<(), IdlerError> {
        msg.set_verdict(Verdict::Accept);
        self.trigger.verdict(msg).map_err(IdlerError::Nfq)
    }
}

#[derive(Debug, Error)]
pub enum IdlerError {
    #[error("error interacting with the trigger queue: {0}")]
    Nfq(io::Error),
}
