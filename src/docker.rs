use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerSummary;
use bollard::Docker;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::warn;

/// Short name identifying one container; keys all per-container state
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(name: impl Into<String>) -> Self {
        ContainerId(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// The systemd unit the container runs under
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One published TCP port; interception matches on `external`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortPair {
    pub internal: u16,
    pub external: u16,
}

/// External TCP port to container lookup, rebuilt each sweep
pub type PortMap = HashMap<u16, ContainerId>;
/// The port map as shared between the orchestrator (writer) and waiters
pub type SharedPorts = Arc<RwLock<PortMap>>;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// Gateway to the container manager
///
/// bollard is an async client; the engine's workers are blocking threads,
/// so every query also comes in a `_blocking` flavor that parks on the
/// runtime handle captured at connect time.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    handle: Handle,
}

impl DockerClient {
    /// Connect to the manager endpoint and verify it answers
    pub async fn connect(socket: &str) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_unix(socket, 30, bollard::API_DEFAULT_VERSION)?;
        docker.ping().await?;
        Ok(DockerClient {
            docker,
            handle: Handle::current(),
        })
    }

    /// Map every published external TCP port to its container
    ///
    /// Uses the configured bindings rather than runtime state: an idled
    /// container is stopped, and its ports must still resolve when the
    /// wake-up packet arrives.
    pub async fn port_map(&self) -> Result<PortMap, DockerError> {
        let mut map = PortMap::new();
        for summary in self.list(true).await? {
            let Some(id) = summary_id(&summary) else {
                continue;
            };
            match self.published_ports(&id).await {
                Ok(pairs) => {
                    for pair in pairs {
                        map.insert(pair.external, id.clone());
                    }
                }
                Err(err) => warn!(container = %id, "failed to read port bindings: {err}"),
            }
        }
        Ok(map)
    }

    /// Published port pairs configured for one container
    pub async fn published_ports(&self, id: &ContainerId) -> Result<Vec<PortPair>, DockerError> {
        let details = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await?;
        let Some(bindings) = details.host_config.and_then(|hc| hc.port_bindings) else {
            return Ok(Vec::new());
        };
        let mut pairs = Vec::new();
        for (key, bound) in bindings {
            let Some(internal) = parse_port_key(&key) else {
                continue;
            };
            for binding in bound.unwrap_or_default() {
                if let Some(external) = binding.host_port.as_deref().and_then(|p| p.parse().ok()) {
                    pairs.push(PortPair { internal, external });
                }
            }
        }
        Ok(pairs)
    }

    /// Addresses of the running containers, keyed by container
    pub async fn container_ips(&self) -> Result<HashMap<ContainerId, String>, DockerError> {
        let mut ips = HashMap::new();
        for summary in self.list(false).await? {
            let Some(id) = summary_id(&summary) else {
                continue;
            };
            let ip = summary
                .network_settings
                .and_then(|settings| settings.networks)
                .and_then(|networks| {
                    networks
                        .into_values()
                        .find_map(|endpoint| endpoint.ip_address.filter(|ip| !ip.is_empty()))
                });
            if let Some(ip) = ip {
                ips.insert(id, ip);
            }
        }
        Ok(ips)
    }

    pub fn port_map_blocking(&self) -> Result<PortMap, DockerError> {
        self.handle.block_on(self.port_map())
    }
    pub fn published_ports_blocking(&self, id: &ContainerId) -> Result<Vec<PortPair>, DockerError> {
        self.handle.block_on(self.published_ports(id))
    }
    pub fn container_ips_blocking(&self) -> Result<HashMap<ContainerId, String>, DockerError> {
        self.handle.block_on(self.container_ips())
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>, DockerError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }
}

fn summary_id(summary: &ContainerSummary) -> Option<ContainerId> {
    summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| ContainerId::new(name.trim_start_matches('/')))
}

/// Parse a docker port-binding key such as `80/tcp`; non-TCP keys are not
/// interceptable and yield None
fn parse_port_key(key: &str) -> Option<u16> {
    let (port, proto) = key.split_once('/')?;
    if proto != "tcp" {
        return None;
    }
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_name_appends_service() {
        assert_eq!(ContainerId::new("app-a").unit_name(), "app-a.service");
    }

    #[test]
    fn port_key_parses_tcp_only() {
        assert_eq!(parse_port_key("80/tcp"), Some(80));
        assert_eq!(parse_port_key("53/udp"), None);
        assert_eq!(parse_port_key("80"), None);
        assert_eq!(parse_port_key("notaport/tcp"), None);
    }
}
