use crate::config::Chain;
use crate::docker::ContainerId;
use crate::queue::TRIGGER_QUEUE;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tracing::debug;

/// Driver for the interception rules and the traffic counters
///
/// Rule lifecycle goes through the iptables binary via the `iptables`
/// crate; the stateful counter dump has no crate API and is read straight
/// from `iptables-save -c`. Rules are parsed by option name, never by
/// token position, because match ordering varies between dumps.
pub struct Firewall {
    ipt: iptables::IPTables,
    chain: Chain,
    host_ip: IpAddr,
}

impl Firewall {
    pub fn new(chain: Chain, host_ip: IpAddr) -> Result<Self, FirewallError> {
        let ipt = iptables::new(false).map_err(FirewallError::driver)?;
        Ok(Firewall {
            ipt,
            chain,
            host_ip,
        })
    }

    /// Insert an interception rule at the top of the configured chain
    pub fn install_interception(&self, port: u16, id: &ContainerId) -> Result<(), FirewallError> {
        let spec = rule_spec(self.host_ip, port, id);
        self.ipt
            .insert(self.chain.table(), self.chain.chain(), &spec, 1)
            .map_err(FirewallError::driver)
    }

    /// Delete one interception rule; a rule that is not there is fine,
    /// both idle and unidle paths delete before they know
    pub fn remove_interception(&self, port: u16, id: &ContainerId) {
        let spec = rule_spec(self.host_ip, port, id);
        if let Err(err) = self.ipt.delete(self.chain.table(), self.chain.chain(), &spec) {
            debug!(port, container = %id, "no interception rule removed: {err}");
        }
    }

    /// External ports currently covered by interception rules for `id`
    pub fn interception_ports(&self, id: &ContainerId) -> Result<HashSet<u16>, FirewallError> {
        let rules = self
            .ipt
            .list(self.chain.table(), self.chain.chain())
            .map_err(FirewallError::driver)?;
        Ok(intercepted_ports(&rules, id))
    }

    /// Remove every interception rule installed for `id`
    ///
    /// Deletes what is actually in the chain rather than what the
    /// container currently publishes, so rules survive no port change.
    pub fn clear_interceptions(&self, id: &ContainerId) -> Result<(), FirewallError> {
        for port in self.interception_ports(id)? {
            self.remove_interception(port, id);
        }
        Ok(())
    }

    /// Per-container packet counts since the last reset
    ///
    /// Reads the DNAT accounting docker maintains and projects it through
    /// the caller's container address map; containers without a DNAT entry
    /// count zero.
    pub fn packet_counts(
        &self,
        ips: &HashMap<ContainerId, String>,
    ) -> Result<HashMap<ContainerId, u64>, FirewallError> {
        let output = Command::new("iptables-save")
            .arg("-c")
            .output()
            .map_err(|err| FirewallError::spawn("iptables-save -c", err))?;
        if !output.status.success() {
            return Err(FirewallError::exited("iptables-save -c", output.status));
        }
        let per_ip = dnat_packet_counts(&String::from_utf8_lossy(&output.stdout));
        Ok(ips
            .iter()
            .map(|(id, ip)| (id.clone(), per_ip.get(ip).copied().unwrap_or(0)))
            .collect())
    }

    /// Zero the DNAT counters so the next sweep sees a fresh window
    pub fn reset_counters(&self) -> Result<(), FirewallError> {
        let status = Command::new("iptables")
            .args(["-t", "nat", "-Z", "DOCKER"])
            .status()
            .map_err(|err| FirewallError::spawn("iptables -t nat -Z DOCKER", err))?;
        if status.success() {
            Ok(())
        } else {
            Err(FirewallError::exited("iptables -t nat -Z DOCKER", status))
        }
    }
}

/// The rule spec that diverts one published port to the trigger queue
fn rule_spec(host_ip: IpAddr, port: u16, id: &ContainerId) -> String {
    format!(
        "-d {host_ip} -p tcp -m tcp --dport {port} -j NFQUEUE --queue-num {TRIGGER_QUEUE} \
         -m comment --comment {id}"
    )
}

/// Ports of the rules in `rules` that divert to the trigger queue and
/// carry `id` as their comment
fn intercepted_ports(rules: &[String], id: &ContainerId) -> HashSet<u16> {
    rules
        .iter()
        .filter_map(|rule| {
            let tokens: Vec<&str> = rule.split_whitespace().collect();
            if !tokens.contains(&"NFQUEUE") {
                return None;
            }
            if token_after(&tokens, "--queue-num").and_then(|num| num.parse().ok())
                != Some(TRIGGER_QUEUE)
            {
                return None;
            }
            if token_after(&tokens, "--comment").map(|c| c.trim_matches('"')) != Some(id.as_str()) {
                return None;
            }
            token_after(&tokens, "--dport")?.parse().ok()
        })
        .collect()
}

/// Aggregate the packet counters of container-destined DNAT entries by
/// destination address
fn dnat_packet_counts(dump: &str) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for line in dump.lines() {
        if !line.contains("-A DOCKER") || !line.contains("! -i docker0") || !line.contains("-j DNAT")
        {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(packets) = tokens
            .first()
            .and_then(|counter| counter.strip_prefix('['))
            .and_then(|counter| counter.split(':').next())
            .and_then(|packets| packets.parse::<u64>().ok())
        else {
            continue;
        };
        let Some(dest_ip) = token_after(&tokens, "--to-destination")
            .and_then(|dest| dest.split(':').next())
        else {
            continue;
        };
        *counts.entry(dest_ip.to_owned()).or_insert(0) += packets;
    }
    counts
}

fn token_after<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|token| *token == flag)
        .and_then(|pos| tokens.get(pos + 1))
        .copied()
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("error interfacing with iptables: {0}")]
    IpTables(String),
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        source: io::Error,
    },
    #[error("{command} exited with {status}")]
    Exited {
        command: &'static str,
        status: ExitStatus,
    },
}

impl FirewallError {
    fn driver(err: Box<dyn std::error::Error>) -> Self {
        FirewallError::IpTables(err.to_string())
    }
    fn spawn(command: &'static str, source: io::Error) -> Self {
        FirewallError::Spawn { command, source }
    }
    fn exited(command: &'static str, status: ExitStatus) -> Self {
        FirewallError::Exited { command, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rule_spec_matches_on_host_port_and_comment() {
        let host_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let spec = rule_spec(host_ip, 80, &ContainerId::new("app-a"));
        assert_eq!(
            spec,
            "-d 10.0.0.5 -p tcp -m tcp --dport 80 -j NFQUEUE --queue-num 0 \
             -m comment --comment app-a"
        );
    }

    #[test]
    fn scrape_keys_fields_by_option_name() {
        let id = ContainerId::new("app-a");
        // match ordering differs between the two rules on purpose
        let rules = vec![
            "-P PREROUTING ACCEPT".to_owned(),
            "-A PREROUTING -d 10.0.0.5/32 -p tcp -m tcp --dport 80 \
             -j NFQUEUE --queue-num 0 -m comment --comment \"app-a\""
                .to_owned(),
            "-A PREROUTING -d 10.0.0.5/32 -p tcp -m tcp --dport 8443 \
             -m comment --comment \"app-a\" -j NFQUEUE --queue-num 0"
                .to_owned(),
        ];
        let ports = intercepted_ports(&rules, &id);
        assert_eq!(ports, HashSet::from([80, 8443]));
    }

    #[test]
    fn scrape_skips_other_containers_and_queues() {
        let id = ContainerId::new("app-a");
        let rules = vec![
            "-A PREROUTING -d 10.0.0.5/32 -p tcp -m tcp --dport 81 \
             -j NFQUEUE --queue-num 0 -m comment --comment \"app-b\""
                .to_owned(),
            "-A PREROUTING -d 10.0.0.5/32 -p tcp -m tcp --dport 82 \
             -j NFQUEUE --queue-num 3 -m comment --comment \"app-a\""
                .to_owned(),
            "-A PREROUTING -d 10.0.0.5/32 -p tcp -m tcp --dport 83 -j ACCEPT".to_owned(),
        ];
        assert!(intercepted_ports(&rules, &id).is_empty());
    }

    #[test]
    fn counter_lines_aggregate_by_destination() {
        let dump = "\
# Generated by iptables-save\n\
*nat\n\
[42:1000] -A DOCKER ! -i docker0 -p tcp -m tcp --dport 80 -j DNAT --to-destination 172.17.0.2:80\n\
[8:512] -A DOCKER ! -i docker0 -p tcp -m tcp --dport 8443 -j DNAT --to-destination 172.17.0.2:443\n\
[7:700] -A DOCKER ! -i docker0 -p tcp -m tcp --dport 81 -j DNAT --to-destination 172.17.0.3:81\n\
[99:9900] -A POSTROUTING -s 172.17.0.2/32 -j MASQUERADE\n\
[5:500] -A DOCKER -i docker0 -p tcp -j DNAT --to-destination 172.17.0.4:80\n\
COMMIT\n";
        let counts = dnat_packet_counts(dump);
        assert_eq!(counts.get("172.17.0.2"), Some(&50));
        assert_eq!(counts.get("172.17.0.3"), Some(&7));
        assert_eq!(counts.get("172.17.0.4"), None);
    }

    #[test]
    fn counts_project_onto_known_containers() {
        let per_ip = dnat_packet_counts(
            "[42:1000] -A DOCKER ! -i docker0 -p tcp -m tcp --dport 80 \
             -j DNAT --to-destination 172.17.0.2:80\n",
        );
        let ips = HashMap::from([
            (ContainerId::new("app-a"), "172.17.0.2".to_owned()),
            (ContainerId::new("app-b"), "172.17.0.9".to_owned()),
        ]);
        let projected: HashMap<ContainerId, u64> = ips
            .iter()
            .map(|(id, ip)| (id.clone(), per_ip.get(ip).copied().unwrap_or(0)))
            .collect();
        assert_eq!(projected.get(&ContainerId::new("app-a")), Some(&42));
        assert_eq!(projected.get(&ContainerId::new("app-b")), Some(&0));
    }
}
