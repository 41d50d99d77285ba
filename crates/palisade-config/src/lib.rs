//! Configuration management for Palisade.
//!
//! Two kinds of files, both generated by `palisade keygen`:
//!
//! - `palisade.toml` — the shared cluster file: sizing (`n`, `f`), the
//!   address book with every node's role, host, port, and Ed25519
//!   verifying key, and the threshold group public key. Distributed to
//!   every node and every user.
//! - `node-<id>.toml` — one per node, holding that node's secret material:
//!   its Ed25519 signing seed and (for replicas) its threshold key share.
//!   Never distributed.
//!
//! Loading layers built-in defaults, the file, and `PALISADE_*` environment
//! variables, highest precedence last. [`ClusterConfig::validate`] checks
//! the quorum arithmetic and address book before a node starts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use palisade_types::NodeId;

/// Environment variable prefix for overrides (`PALISADE_CLUSTER_N`, ...).
const ENV_PREFIX: &str = "PALISADE";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("failed to parse TOML at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("invalid base64 key material for {what}: {source}")]
    Decode {
        what: String,
        source: base64::DecodeError,
    },

    #[error("key material for {what} has length {len}, expected {expected}")]
    KeyLength {
        what: String,
        len: usize,
        expected: usize,
    },
}

// ============================================================================
// Cluster File
// ============================================================================

/// The shared cluster configuration (`palisade.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Total replicas.
    pub n: usize,
    /// Tolerated Byzantine faults; `n ≥ 3f + 1`.
    pub f: usize,
    /// First replica port; replica `i` listens on `base_port + i` and the
    /// gateway on `base_port + n` unless the address book says otherwise.
    pub base_port: u16,
    /// Base64 compressed threshold group public key.
    pub threshold_public_key: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            n: 4,
            f: 1,
            base_port: 7400,
            threshold_public_key: String::new(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterSection::default(),
            nodes: Vec::new(),
        }
    }
}

/// The role a configured node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Replica,
    Gateway,
}

/// One node in the address book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: u8,
    pub role: Role,
    pub host: String,
    pub port: u16,
    /// Base64 Ed25519 verifying key.
    pub verifying_key: String,
}

impl ClusterConfig {
    /// Loads defaults, then `path`, then `PALISADE_*` environment
    /// variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&ClusterConfig::default())?);

        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true),
        );

        let loaded: ClusterConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Writes the cluster file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let body = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(format!("unserializable config: {e}")))?;
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks quorum arithmetic and address book consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (n, f) = (self.cluster.n, self.cluster.f);
        if n < 3 * f + 1 {
            return Err(ConfigError::Validation(format!(
                "{n} replicas cannot tolerate {f} Byzantine faults (need n ≥ 3f + 1)"
            )));
        }

        let replicas = self.nodes.iter().filter(|e| e.role == Role::Replica).count();
        if replicas != n {
            return Err(ConfigError::Validation(format!(
                "address book lists {replicas} replicas, cluster.n is {n}"
            )));
        }
        let gateways = self.nodes.iter().filter(|e| e.role == Role::Gateway).count();
        if gateways != 1 {
            return Err(ConfigError::Validation(format!(
                "address book must list exactly one gateway, found {gateways}"
            )));
        }

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for entry in &self.nodes {
            if !ids.insert(entry.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate node id {} in address book",
                    entry.id
                )));
            }
            if !ports.insert((entry.host.clone(), entry.port)) {
                return Err(ConfigError::Validation(format!(
                    "duplicate address {}:{} in address book",
                    entry.host, entry.port
                )));
            }
            match entry.role {
                Role::Replica if usize::from(entry.id) >= n => {
                    return Err(ConfigError::Validation(format!(
                        "replica id {} outside 0..{n}",
                        entry.id
                    )));
                }
                Role::Gateway if usize::from(entry.id) != n => {
                    return Err(ConfigError::Validation(format!(
                        "gateway id {} must be {n}",
                        entry.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Looks up a node's address book entry.
    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|e| e.id == id.as_u8())
    }

    /// The threshold group public key.
    pub fn threshold_public_key(&self) -> Result<[u8; 32], ConfigError> {
        decode_key32("threshold public key", &self.cluster.threshold_public_key)
    }

    /// A node's verifying key.
    pub fn verifying_key(&self, entry: &NodeEntry) -> Result<[u8; 32], ConfigError> {
        decode_key32(&format!("node {} verifying key", entry.id), &entry.verifying_key)
    }
}

// ============================================================================
// Node Secret File
// ============================================================================

/// One node's secret material (`node-<id>.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSecrets {
    pub id: u8,
    /// Base64 Ed25519 signing seed.
    pub signing_seed: String,
    /// Base64 threshold key share; absent for the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_share: Option<String>,
}

impl NodeSecrets {
    /// Conventional filename next to the cluster file.
    pub fn filename(id: NodeId) -> String {
        format!("node-{id}.toml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&body).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let body = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(format!("unserializable secrets: {e}")))?;
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn signing_seed(&self) -> Result<[u8; 32], ConfigError> {
        decode_key32(&format!("node {} signing seed", self.id), &self.signing_seed)
    }

    pub fn threshold_share(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        self.threshold_share
            .as_deref()
            .map(|share| decode_key32(&format!("node {} threshold share", self.id), share))
            .transpose()
    }
}

/// Base64 encoding for the key material stored in config files.
pub fn encode_key(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode_key32(what: &str, encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = STANDARD.decode(encoded).map_err(|source| ConfigError::Decode {
        what: what.to_string(),
        source,
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::KeyLength {
        what: what.to_string(),
        len: bytes.len(),
        expected: 32,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(n: usize, f: usize) -> ClusterConfig {
        let mut nodes: Vec<NodeEntry> = (0..n)
            .map(|i| NodeEntry {
                id: i as u8,
                role: Role::Replica,
                host: "127.0.0.1".to_string(),
                port: 7400 + i as u16,
                verifying_key: encode_key(&[i as u8; 32]),
            })
            .collect();
        nodes.push(NodeEntry {
            id: n as u8,
            role: Role::Gateway,
            host: "127.0.0.1".to_string(),
            port: 7400 + n as u16,
            verifying_key: encode_key(&[0xAA; 32]),
        });
        ClusterConfig {
            cluster: ClusterSection {
                n,
                f,
                base_port: 7400,
                threshold_public_key: encode_key(&[7u8; 32]),
            },
            nodes,
        }
    }

    #[test]
    fn valid_config_passes() {
        sample_config(4, 1).validate().unwrap();
    }

    #[test]
    fn undersized_cluster_rejected() {
        let config = sample_config(4, 1);
        let mut bad = config;
        bad.cluster.f = 2;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut config = sample_config(4, 1);
        config.nodes[1].id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut config = sample_config(4, 1);
        config.nodes[1].port = config.nodes[0].port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_gateway_rejected() {
        let mut config = sample_config(4, 1);
        config.nodes.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palisade.toml");
        let config = sample_config(4, 1);
        config.save(&path).unwrap();

        let loaded = ClusterConfig::load(&path).unwrap();
        assert_eq!(loaded.cluster.n, 4);
        assert_eq!(loaded.nodes.len(), 5);
        assert_eq!(loaded.node(NodeId::new(4)).unwrap().role, Role::Gateway);
    }

    #[test]
    fn node_secrets_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-0.toml");
        let secrets = NodeSecrets {
            id: 0,
            signing_seed: encode_key(&[1u8; 32]),
            threshold_share: Some(encode_key(&[2u8; 32])),
        };
        secrets.save(&path).unwrap();

        let loaded = NodeSecrets::load(&path).unwrap();
        assert_eq!(loaded.signing_seed().unwrap(), [1u8; 32]);
        assert_eq!(loaded.threshold_share().unwrap(), Some([2u8; 32]));
    }

    #[test]
    fn short_key_material_rejected() {
        assert!(matches!(
            decode_key32("test key", &STANDARD.encode([0u8; 16])),
            Err(ConfigError::KeyLength { len: 16, .. })
        ));
    }
}
