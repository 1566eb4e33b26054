use super::Idler;
use crate::docker::{ContainerId, PortPair};
use crate::systemd::JobMode;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

impl Idler {
    /// One idleness pass: refresh the port map, read and reset the
    /// traffic counters, and idle every container whose zero-count streak
    /// has run long enough
    pub(super) fn sweep(&mut self) {
        debug!("sweep tick");
        match self.docker.port_map_blocking() {
            Ok(map) => *self.ports.write().expect("port map lock poisoned") = map,
            Err(err) => warn!("sweep: failed to refresh port map: {err}"),
        }
        let ips = match self.docker.container_ips_blocking() {
            Ok(ips) => ips,
            Err(err) => {
                warn!("sweep: failed to list container addresses: {err}");
                return;
            }
        };
        let counts = match self.firewall.packet_counts(&ips) {
            Ok(counts) => counts,
            Err(err) => {
                error!("sweep: failed to read packet counters: {err}");
                return;
            }
        };
        if let Err(err) = self.firewall.reset_counters() {
            warn!("sweep: failed to reset packet counters: {err}");
        }
        // every container with a published port is a candidate, running or
        // not; a container stopped out from under us has no counter entry,
        // counts zero, and gets its interception rules restored here
        let candidates: HashSet<ContainerId> = self
            .ports
            .read()
            .expect("port map lock poisoned")
            .values()
            .cloned()
            .collect();
        self.zero_ticks.retain(|id, _| candidates.contains(id));
        for id in candidates {
            let packets = counts.get(&id).copied().unwrap_or(0);
            let streak = self.zero_ticks.entry(id.clone()).or_insert(0);
            if packets > 0 {
                debug!(container = %id, packets, "container saw traffic");
                *streak = 0;
                continue;
            }
            *streak = streak.saturating_add(1);
            if *streak >= self.config.idle_ticks {
                self.idle(&id);
            }
        }
    }

    /// Stop one zero-traffic container and put interception rules in
    /// front of every port it publishes
    fn idle(&mut self, id: &ContainerId) {
        let published = match self.docker.published_ports_blocking(id) {
            Ok(published) if published.is_empty() => {
                debug!(container = %id, "idle: no published ports, nothing to intercept");
                return;
            }
            Ok(published) => published,
            Err(err) => {
                warn!(container = %id, "idle: failed to enumerate ports: {err}");
                return;
            }
        };
        let covered = match self.firewall.interception_ports(id) {
            Ok(covered) => covered,
            Err(err) => {
                warn!(container = %id, "idle: failed to scrape interception rules: {err}");
                return;
            }
        };
        if fully_intercepted(&published, &covered) {
            // already idle; nothing to stop, nothing to install
            return;
        }
        info!(container = %id, "stopping container");
        if let Err(err) = self.systemd.stop(&id.unit_name(), JobMode::Fail) {
            // the unit is still up, so installing rules would blackhole it
            error!(container = %id, "idle: could not stop unit: {err}");
            return;
        }
        for pair in &published {
            self.firewall.remove_interception(pair.external, id);
            if let Err(err) = self.firewall.install_interception(pair.external, id) {
                error!(container = %id, port = pair.external, "idle: failed to install interception rule: {err}");
            }
        }
    }
}

/// Whether every published external port already has an interception rule
fn fully_intercepted(published: &[PortPair], covered: &HashSet<u16>) -> bool {
    published.iter().all(|pair| covered.contains(&pair.external))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(external: u16) -> PortPair {
        PortPair {
            internal: external,
            external,
        }
    }

    #[test]
    fn covered_ports_mean_no_action() {
        let published = [pair(80), pair(8443)];
        let covered = HashSet::from([80, 8443]);
        assert!(fully_intercepted(&published, &covered));
    }

    #[test]
    fn any_uncovered_port_recreates_rules() {
        let published = [pair(80), pair(8443)];
        assert!(!fully_intercepted(&published, &HashSet::from([80])));
        assert!(!fully_intercepted(&published, &HashSet::new()));
    }

    #[test]
    fn extra_stale_rules_do_not_block_idling() {
        // a leftover rule for a port no longer published is ignored
        let published = [pair(80)];
        let covered = HashSet::from([80, 9999]);
        assert!(fully_intercepted(&published, &covered));
    }
}
