// Machine inventory: the hosts executions fan out to

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::executor::LocalConnection;
use crate::output::errors::PorterError;

/// A single machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Run on the controller instead of over SSH
    #[serde(default)]
    pub local: bool,
}

fn default_port() -> u16 {
    22
}

impl Host {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Host {
            id: id.into(),
            address: name.clone(),
            name,
            port: 22,
            user: String::new(),
            password: None,
            private_key: None,
            local: false,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Get the SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }

    /// Check if this host should use local connection
    pub fn is_local(&self) -> bool {
        self.local
            || self.name == "localhost"
            || LocalConnection::should_use_local(&self.address)
    }

    /// The controller itself
    pub fn localhost() -> Self {
        Host::new("localhost", "localhost")
            .with_address("127.0.0.1")
            .local()
    }
}

/// Lookup seam for whatever store owns the machine records
pub trait MachineStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Host>;

    /// Resolve every id, failing on the first unknown one
    fn resolve(&self, ids: &[String]) -> Result<Vec<Host>, PorterError> {
        ids.iter()
            .map(|id| {
                self.get(id).ok_or_else(|| PorterError::NotFound {
                    kind: "machine".to_string(),
                    id: id.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    defaults: HostDefaults,
    #[serde(default)]
    machines: Vec<Host>,
}

#[derive(Debug, Default, Deserialize)]
struct HostDefaults {
    user: Option<String>,
    port: Option<u16>,
    private_key: Option<String>,
}

/// In-memory machine store, loadable from YAML:
///
/// ```yaml
/// defaults:
///   user: deploy
/// machines:
///   - id: m1
///     name: builder
///     address: 10.0.0.5
/// ```
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: BTreeMap<String, Host>,
}

impl Inventory {
    pub fn new() -> Self {
        Inventory::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, PorterError> {
        let content = std::fs::read_to_string(path).map_err(|e| PorterError::Io {
            message: format!("Failed to read inventory file: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Self, PorterError> {
        let file: InventoryFile = serde_yaml::from_str(content).map_err(|e| PorterError::Config {
            message: format!("Invalid inventory YAML: {}", e),
            suggestion: Some("Expected a 'machines:' list with id and name".to_string()),
        })?;

        let mut inventory = Inventory::new();
        for mut host in file.machines {
            if host.address.is_empty() {
                host.address = host.name.clone();
            }
            if host.user.is_empty() {
                if let Some(user) = &file.defaults.user {
                    host.user = user.clone();
                }
            }
            if host.port == default_port() {
                if let Some(port) = file.defaults.port {
                    host.port = port;
                }
            }
            if host.private_key.is_none() {
                host.private_key = file.defaults.private_key.clone();
            }
            if inventory.hosts.contains_key(&host.id) {
                return Err(PorterError::Config {
                    message: format!("Duplicate machine id '{}'", host.id),
                    suggestion: None,
                });
            }
            inventory.add_host(host);
        }
        Ok(inventory)
    }

    /// Build an inventory from comma-separated `[user@]address[:port]` targets,
    /// each also serving as its own id.
    pub fn from_targets(targets: &str) -> Result<Self, PorterError> {
        let mut inventory = Inventory::new();
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (user, rest) = match target.split_once('@') {
                Some((u, r)) => (Some(u), r),
                None => (None, target),
            };
            let (address, port) = match rest.rsplit_once(':') {
                Some((a, p)) => {
                    let port = p.parse().map_err(|_| PorterError::Config {
                        message: format!("Invalid port in target '{}'", target),
                        suggestion: None,
                    })?;
                    (a, port)
                }
                None => (rest, 22),
            };

            let mut host = Host::new(address, address).with_port(port);
            if let Some(user) = user {
                host = host.with_user(user);
            }
            inventory.add_host(host);
        }
        Ok(inventory)
    }

    pub fn add_host(&mut self, host: Host) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl MachineStore for Inventory {
    fn get(&self, id: &str) -> Option<Host> {
        self.hosts.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_defaults() {
        let host = Host::new("m1", "builder");
        assert_eq!(host.address, "builder");
        assert_eq!(host.port, 22);
        assert_eq!(host.ssh_target(), "builder:22");
        assert!(!host.is_local());

        let host = host.with_user("deploy").with_address("10.0.0.5").with_port(2222);
        assert_eq!(host.ssh_target(), "deploy@10.0.0.5:2222");
    }

    #[test]
    fn test_is_local() {
        assert!(Host::new("m", "localhost").is_local());
        assert!(Host::new("m", "x").with_address("127.0.0.1").is_local());
        assert!(Host::new("m", "x").local().is_local());
        assert!(Host::localhost().is_local());
    }

    #[test]
    fn test_parse_inventory() {
        let yaml = r#"
defaults:
  user: deploy
  private_key: ~/.ssh/fleet
machines:
  - id: m1
    name: builder
    address: 10.0.0.5
  - id: m2
    name: runner
    port: 2200
    user: ci
"#;
        let inv = Inventory::parse_str(yaml).unwrap();
        assert_eq!(inv.len(), 2);

        let m1 = inv.get("m1").unwrap();
        assert_eq!(m1.user, "deploy");
        assert_eq!(m1.address, "10.0.0.5");
        assert_eq!(m1.private_key.as_deref(), Some("~/.ssh/fleet"));

        let m2 = inv.get("m2").unwrap();
        assert_eq!(m2.user, "ci");
        assert_eq!(m2.address, "runner");
        assert_eq!(m2.port, 2200);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = "machines:\n  - {id: m1, name: a}\n  - {id: m1, name: b}\n";
        assert!(Inventory::parse_str(yaml).is_err());
    }

    #[test]
    fn test_from_targets() {
        let inv = Inventory::from_targets("deploy@web1:2222, web2").unwrap();
        assert_eq!(inv.ids(), vec!["web1".to_string(), "web2".to_string()]);
        assert_eq!(inv.get("web1").unwrap().ssh_target(), "deploy@web1:2222");
        assert_eq!(inv.get("web2").unwrap().port, 22);

        assert!(Inventory::from_targets("web1:notaport").is_err());
    }

    #[test]
    fn test_resolve_unknown_machine() {
        let inv = Inventory::from_targets("web1").unwrap();
        let err = inv
            .resolve(&["web1".to_string(), "ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, PorterError::NotFound { .. }));
    }
}
