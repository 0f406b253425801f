use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the mesh. Every field has a default, so a partial JSON file is fine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
    /// how long an edge may stay Connecting before it is failed. None disables the timer
    pub connect_timeout_ms: Option<u64>,
    /// recommended upper bound for a full mesh
    pub max_peers: usize,
    /// above this many active edges a PeerLimitWarning is emitted
    pub warning_threshold: usize,
    pub data_channel_label: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
            ],
            connect_timeout_ms: Some(30_000),
            max_peers: 6,
            warning_threshold: 4,
            data_channel_label: "mesh".into(),
        }
    }
}

impl MeshConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"connect_timeout_ms": 5000, "max_peers": 8}"#).unwrap();
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.warning_threshold, 4);
        assert_eq!(config.ice_servers.len(), 3);
    }

    #[test]
    fn null_timeout_disables_the_timer() {
        let config: MeshConfig = serde_json::from_str(r#"{"connect_timeout_ms": null}"#).unwrap();
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(&path, r#"{"ice_servers": ["stun:example.org:3478"]}"#).unwrap();
        let config = MeshConfig::load(&path).unwrap();
        assert_eq!(config.ice_servers, vec!["stun:example.org:3478".to_string()]);
        assert!(MeshConfig::load(dir.path().join("missing.json")).is_err());
    }
}
