use crate::config::Config;
use crate::docker::{ContainerId, SharedPorts};
use crate::firewall::Firewall;
use crate::packet;
use crate::systemd::{ActiveState, Systemd};
use nfq::{Message, Queue, Verdict};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// One waiter worker: holds re-queued packets on its kernel queue until
/// the target container's unit is up, then lets them through
///
/// The packet is the client's connection attempt; no verdict is emitted
/// until the unit is active (or the hold times out), so the client never
/// sees a closed port while the container starts.
pub struct Waiter {
    slot: u16,
    queue: Queue,
    ports: SharedPorts,
    systemd: Systemd,
    firewall: Arc<Firewall>,
    release: UnboundedSender<u16>,
    config: Config,
}

impl Waiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: u16,
        queue: Queue,
        ports: SharedPorts,
        systemd: Systemd,
        firewall: Arc<Firewall>,
        release: UnboundedSender<u16>,
        config: Config,
    ) -> Self {
        Waiter {
            slot,
            queue,
            ports,
            systemd,
            firewall,
            release,
            config,
        }
    }

    pub fn run(mut self) -> Result<(), WaiterError> {
        loop {
            let msg = self.queue.recv().map_err(WaiterError::Nfq)?;
            self.handle(msg)?;
        }
    }

    fn handle(&mut self, mut msg: Message) -> Result<(), WaiterError> {
        match self.classify(&msg) {
            Some(id) => self.hold_until_started(&id),
            None => debug!(slot = self.slot, "releasing unclassifiable packet"),
        }
        msg.set_verdict(Verdict::Accept);
        self.queue.verdict(msg).map_err(WaiterError::Nfq)?;
        self.release
            .send(self.slot)
            .map_err(|_| WaiterError::ReleaseClosed)?;
        Ok(())
    }

    fn classify(&self, msg: &Message) -> Option<ContainerId> {
        let port = match packet::destination_port(msg) {
            Ok(port) => port,
            Err(err) => {
                warn!(slot = self.slot, "unidle: cannot classify held packet: {err}");
                return None;
            }
        };
        self.ports
            .read()
            .expect("port map lock poisoned")
            .get(&port)
            .cloned()
    }

    /// Wait for the unit to come up, then tear down its interception
    /// rules so traffic flows straight to the service
    fn hold_until_started(&self, id: &ContainerId) {
        let unit = id.unit_name();
        if !matches!(self.systemd.active_state(&unit), Ok(ActiveState::Active)) {
            info!(container = %id, "holding packet while {unit} starts");
            let deadline = Instant::now() + self.config.startup_timeout;
            loop {
                thread::sleep(self.config.startup_poll);
                match self.systemd.active_state(&unit) {
                    Ok(ActiveState::Active) => {
                        info!(container = %id, "unit active, releasing packet");
                        break;
                    }
                    _ if Instant::now() >= deadline => {
                        warn!(container = %id, "unidle: unit not active after hold timeout, releasing anyway");
                        break;
                    }
                    _ => {}
                }
            }
        }
        // point of no return: with the rules gone, later packets bypass us.
        // Runs on every wake, even when the unit is already up, so a running
        // container is never left intercepted.
        if let Err(err) = self.firewall.clear_interceptions(id) {
            error!(container = %id, "unidle: failed to remove interception rules: {err}");
        }
    }
}

#[derive(Debug, Error)]
pub enum WaiterError {
    #[error("error interacting with the waiter queue: {0}")]
    Nfq(io::Error),
    #[error("orchestrator release channel closed")]
    ReleaseClosed,
}
