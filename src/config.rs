use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ed25519_dalek::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{address_from_key_bytes, public_key_from_hex};
use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub lock_file: PathBuf,
    pub tcp_listen: SocketAddr,
    pub network_id: i64,
    #[serde(default)]
    pub honor_nodes: Vec<HonorNodeConfig>,
    #[serde(default)]
    pub params: ParamOverrides,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            lock_file: PathBuf::from("./data/palisade.lock"),
            tcp_listen: "127.0.0.1:7078".parse().expect("valid socket addr"),
            network_id: 1,
            honor_nodes: Vec::new(),
            params: ParamOverrides::default(),
        }
    }
}

/// Static description of one member of the producer set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HonorNodeConfig {
    pub tcp_address: String,
    pub api_address: String,
    pub public_key: String,
    #[serde(default)]
    pub unban_time: i64,
}

#[derive(Clone, Debug)]
pub struct HonorNode {
    pub tcp_address: String,
    pub api_address: String,
    pub public_key: PublicKey,
    pub key_id: i64,
    pub unban_time: i64,
}

impl HonorNodeConfig {
    pub fn resolve(&self) -> ChainResult<HonorNode> {
        let public_key = public_key_from_hex(&self.public_key)?;
        Ok(HonorNode {
            tcp_address: self.tcp_address.clone(),
            api_address: self.api_address.clone(),
            key_id: address_from_key_bytes(public_key.as_bytes()),
            public_key,
            unban_time: self.unban_time,
        })
    }
}

/// Optional overrides for the stored system parameters; anything left unset
/// falls back to the table value or the built-in default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamOverrides {
    pub gap_between_blocks: Option<i64>,
    pub block_gen_time: Option<i64>,
    pub max_tx_count: Option<usize>,
    pub max_block_size: Option<u64>,
    pub max_tx_size: Option<u64>,
    pub max_fuel: Option<i64>,
    pub rollback_blocks: Option<u64>,
    pub min_confirmed_nodes: Option<i32>,
    pub wait_confirmed_nodes: Option<u64>,
}

/// Runtime system parameters. Values come from the `system_parameters` table
/// with config overrides applied on top; the honor-node set is read from the
/// node configuration at startup and refreshed after on-chain updates.
#[derive(Clone, Debug)]
pub struct SysParams {
    pub network_id: i64,
    pub gap_between_blocks: i64,
    pub block_gen_time: i64,
    pub max_tx_count: usize,
    pub max_block_size: u64,
    pub max_tx_size: u64,
    pub max_fuel: i64,
    pub rollback_blocks: u64,
    pub min_confirmed_nodes: i32,
    pub wait_confirmed_nodes: u64,
    pub bad_tx_count: usize,
    pub bad_tx_window_minutes: i64,
    pub ban_duration_minutes: i64,
    pub local_ban_minutes: i64,
    pub honor_nodes: Vec<HonorNode>,
}

impl SysParams {
    /// Resolves the effective parameters: built-in defaults, overlaid by the
    /// stored `system_parameters` table, overlaid by config overrides.
    pub fn load(config: &NodeConfig, storage: &crate::storage::Storage) -> ChainResult<Self> {
        let mut sys = Self::from_config(config)?;
        let stored = |name: &str| -> ChainResult<Option<i64>> {
            Ok(storage
                .system_parameter(name)?
                .and_then(|value| value.trim().parse().ok()))
        };
        let ov = &config.params;
        if ov.gap_between_blocks.is_none() {
            if let Some(value) = stored("gap_between_blocks")? {
                sys.gap_between_blocks = value;
            }
        }
        if ov.block_gen_time.is_none() {
            if let Some(value) = stored("block_gen_time")? {
                sys.block_gen_time = value;
            }
        }
        if ov.max_tx_count.is_none() {
            if let Some(value) = stored("max_tx_count")? {
                sys.max_tx_count = value.max(1) as usize;
            }
        }
        if ov.max_block_size.is_none() {
            if let Some(value) = stored("max_block_size")? {
                sys.max_block_size = value.max(1) as u64;
            }
        }
        if ov.max_tx_size.is_none() {
            if let Some(value) = stored("max_tx_size")? {
                sys.max_tx_size = value.max(1) as u64;
            }
        }
        if ov.max_fuel.is_none() {
            if let Some(value) = stored("max_fuel")? {
                sys.max_fuel = value;
            }
        }
        if ov.rollback_blocks.is_none() {
            if let Some(value) = stored("rollback_blocks")? {
                sys.rollback_blocks = value.max(1) as u64;
            }
        }
        if ov.min_confirmed_nodes.is_none() {
            if let Some(value) = stored("min_confirmed_nodes")? {
                sys.min_confirmed_nodes = value as i32;
            }
        }
        if ov.wait_confirmed_nodes.is_none() {
            if let Some(value) = stored("wait_confirmed_nodes")? {
                sys.wait_confirmed_nodes = value.max(1) as u64;
            }
        }
        Ok(sys)
    }

    pub fn from_config(config: &NodeConfig) -> ChainResult<Self> {
        let mut honor_nodes = Vec::with_capacity(config.honor_nodes.len());
        for node in &config.honor_nodes {
            honor_nodes.push(node.resolve()?);
        }
        let ov = &config.params;
        Ok(Self {
            network_id: config.network_id,
            gap_between_blocks: ov.gap_between_blocks.unwrap_or(2),
            block_gen_time: ov.block_gen_time.unwrap_or(2),
            max_tx_count: ov.max_tx_count.unwrap_or(1000),
            max_block_size: ov.max_block_size.unwrap_or(1 << 20),
            max_tx_size: ov.max_tx_size.unwrap_or(32 << 10),
            max_fuel: ov.max_fuel.unwrap_or(2_000_000),
            rollback_blocks: ov.rollback_blocks.unwrap_or(60),
            min_confirmed_nodes: ov.min_confirmed_nodes.unwrap_or(0),
            wait_confirmed_nodes: ov.wait_confirmed_nodes.unwrap_or(8),
            bad_tx_count: 5,
            bad_tx_window_minutes: 30,
            ban_duration_minutes: 30,
            local_ban_minutes: 30,
            honor_nodes,
        })
    }

    pub fn nodes_count(&self) -> usize {
        self.honor_nodes.len().max(1)
    }

    pub fn node_position_by_key(&self, key_id: i64) -> Option<u16> {
        self.honor_nodes
            .iter()
            .position(|node| node.key_id == key_id)
            .map(|pos| pos as u16)
    }

    pub fn node_by_position(&self, position: u16) -> ChainResult<&HonorNode> {
        self.honor_nodes.get(position as usize).ok_or_else(|| {
            ChainError::Config(format!("no honor node at position {position}"))
        })
    }

    pub fn node_by_host(&self, host: &str) -> ChainResult<&HonorNode> {
        self.honor_nodes
            .iter()
            .find(|node| node.tcp_address == host)
            .ok_or_else(|| ChainError::Config(format!("no honor node with host {host}")))
    }

    pub fn remote_hosts(&self, own_key_id: i64) -> Vec<String> {
        self.honor_nodes
            .iter()
            .filter(|node| node.key_id != own_key_id)
            .map(|node| node.tcp_address.clone())
            .collect()
    }

    /// Half of the honor set, the default confirmation quorum when the
    /// parameter is left at zero.
    pub fn confirmation_quorum(&self) -> i32 {
        if self.min_confirmed_nodes > 0 {
            self.min_confirmed_nodes
        } else {
            (self.honor_nodes.len() as i32) / 2
        }
    }
}

/// Exclusive process guard. Holds a lock file containing the pid; the file is
/// removed on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> ChainResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| {
                ChainError::Config(format!(
                    "lock file {} is busy: {err}",
                    path.display()
                ))
            })?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn node_config(count: usize) -> NodeConfig {
        let mut config = NodeConfig::default();
        for i in 0..count {
            let keypair = generate_keypair();
            config.honor_nodes.push(HonorNodeConfig {
                tcp_address: format!("127.0.0.1:70{i:02}"),
                api_address: format!("127.0.0.1:71{i:02}"),
                public_key: hex::encode(keypair.public.to_bytes()),
                unban_time: 0,
            });
        }
        config
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let config = node_config(2);
        config.save(&path).expect("save");
        let loaded = NodeConfig::load(&path).expect("load");
        assert_eq!(loaded.honor_nodes.len(), 2);
        assert_eq!(loaded.tcp_listen, config.tcp_listen);
    }

    #[test]
    fn sys_params_resolves_positions() {
        let config = node_config(3);
        let sys = SysParams::from_config(&config).expect("params");
        assert_eq!(sys.nodes_count(), 3);
        let key_id = sys.honor_nodes[1].key_id;
        assert_eq!(sys.node_position_by_key(key_id), Some(1));
        assert!(sys.node_position_by_key(key_id + 1).is_none());
    }

    #[test]
    fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.lock");
        let guard = LockFile::acquire(&path).expect("first acquire");
        assert!(LockFile::acquire(&path).is_err());
        drop(guard);
        LockFile::acquire(&path).expect("acquire after release");
    }
}
