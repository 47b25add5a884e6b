//! Configuration handling for the tunnel binary.
//!
//! Settings come from three layers, strongest last: built-in defaults, the
//! YAML config file, environment variables. Command-line flags given
//! explicitly override all of them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Tunnel binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Control-plane section
    pub server: ServerSection,
    /// Agent section
    pub agent: AgentSection,
}

/// Control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Endpoint listen address
    pub listen: String,
    /// Agent credential accepted by the built-in token index
    pub token: String,
    /// Cluster name the credential maps to
    pub cluster: String,
    /// Shared inter-replica credential; empty disables the relay endpoint
    pub peer_token: String,
    /// This replica's identifier
    pub peer_id: String,
    /// Peer replica addresses known at startup
    pub peers: Vec<String>,
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Tunnel endpoint URL
    pub connect: String,
    /// Credential presented on connect
    pub token: String,
    /// Hostname to register under
    pub hostname: String,
    /// Unix socket paths the control plane may dial
    pub allow_unix: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8123".to_string(),
            token: String::new(),
            cluster: "local".to_string(),
            peer_token: String::new(),
            peer_id: "replica-0".to_string(),
            peers: Vec::new(),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            connect: "ws://127.0.0.1:8123/connect".to_string(),
            token: String::new(),
            hostname: "agent".to_string(),
            allow_unix: Vec::new(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            agent: AgentSection::default(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<TunnelConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({e}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("REDIAL_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(token) = std::env::var("REDIAL_TOKEN") {
            self.server.token = token.clone();
            self.agent.token = token;
        }
        if let Ok(peer_token) = std::env::var("REDIAL_PEER_TOKEN") {
            self.server.peer_token = peer_token;
        }
        if let Ok(connect) = std::env::var("REDIAL_CONNECT") {
            self.agent.connect = connect;
        }
        if let Ok(hostname) = std::env::var("REDIAL_HOSTNAME") {
            self.agent.hostname = hostname;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = TunnelConfig::load_from_file("/definitely/not/here.yaml").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8123");
        assert_eq!(config.agent.hostname, "agent");
    }

    #[test]
    fn test_yaml_sections_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  listen: 127.0.0.1:9999\n  token: tok1\nagent:\n  connect: ws://cp/connect\n  allow_unix:\n    - /run/docker.sock"
        )
        .unwrap();

        let config = TunnelConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9999");
        assert_eq!(config.server.token, "tok1");
        assert_eq!(config.agent.connect, "ws://cp/connect");
        assert_eq!(config.agent.allow_unix, vec!["/run/docker.sock"]);
        // untouched fields keep defaults
        assert_eq!(config.server.peer_id, "replica-0");
    }
}
