//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! Everything here is resolved before the master starts; the controllers only
//! ever see an immutable `Arc<Config>`.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete application master configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Job-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Application id; generated at startup when absent
    pub app_id: Option<String>,
    /// Number of containers in the cohort
    #[serde(default = "default_num_containers")]
    pub num_containers: usize,
    /// Scheduling priority of every container request
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Port every worker listens on (written into the peer list)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// RPC port reported at registration (-1 when the master serves none)
    #[serde(default = "default_rpc_port")]
    pub rpc_port: i32,
    /// Tracking URL reported at registration
    #[serde(default)]
    pub tracking_url: String,
}

fn default_num_containers() -> usize {
    1
}

fn default_priority() -> i32 {
    10
}

fn default_listen_port() -> u16 {
    9999
}

fn default_rpc_port() -> i32 {
    -1
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            num_containers: default_num_containers(),
            priority: default_priority(),
            listen_port: default_listen_port(),
            rpc_port: default_rpc_port(),
            tracking_url: String::new(),
        }
    }
}

/// Per-container resource request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Memory per container in MB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Virtual cores per container
    #[serde(default = "default_vcores")]
    pub vcores: u32,
}

fn default_memory_mb() -> u64 {
    1000
}

fn default_vcores() -> u32 {
    2
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            vcores: default_vcores(),
        }
    }
}

/// How each worker is started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Interpreter or executable that runs the launch script
    #[serde(default = "default_shell_command")]
    pub shell_command: String,
    /// Launch script location in shared storage
    #[serde(default)]
    pub script_path: PathBuf,
    /// Name the script is staged under in the container workspace
    #[serde(default = "default_script_name")]
    pub script_name: String,
    /// Extra arguments appended after the hostfile argument
    #[serde(default)]
    pub script_args: String,
    /// Environment handed to every worker
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell_command() -> String {
    "python".to_string()
}

fn default_script_name() -> String {
    "launch.py".to_string()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            shell_command: default_shell_command(),
            script_path: PathBuf::new(),
            script_name: default_script_name(),
            script_args: String::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Shared storage layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the shared filesystem
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Directory (relative to the root) that holds the hostfile
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_path_prefix() -> String {
    "cohort/".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            path_prefix: default_path_prefix(),
        }
    }
}

/// Timing knobs of the controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Delay between submitting rank 0 and any other rank
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Upper bound on waiting for in-flight launch tasks at shutdown
    #[serde(default = "default_launch_join_timeout_ms")]
    pub launch_join_timeout_ms: u64,
    /// Interval between progress heartbeats to the resource manager
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Verbose logging and environment dump
    #[serde(default)]
    pub debug: bool,
}

fn default_settle_delay_ms() -> u64 {
    3000
}

fn default_launch_join_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            launch_join_timeout_ms: default_launch_join_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            debug: false,
        }
    }
}

impl RuntimeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn launch_join_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Local cluster backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Directory under which container workspaces are created
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Nodes the local resource manager pretends to own
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,
}

/// One node of the local cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_node_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_node_vcores")]
    pub vcores: u32,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("cohort-master")
}

fn default_node_memory_mb() -> u64 {
    8192
}

fn default_node_vcores() -> u32 {
    8
}

fn default_nodes() -> Vec<NodeConfig> {
    vec![NodeConfig::new("localhost")]
}

impl NodeConfig {
    /// Node with the default capability
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            memory_mb: default_node_memory_mb(),
            vcores: default_node_vcores(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            nodes: default_nodes(),
        }
    }
}

/// Outcome reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Write a JSON outcome report to this path
    pub json_output: Option<PathBuf>,
}

impl Config {
    /// Application id, generating one from the current time when unset
    pub fn resolve_app_id(&mut self) -> String {
        if let Some(ref id) = self.job.app_id {
            return id.clone();
        }
        let id = format!("application_{}_0001", chrono::Utc::now().timestamp_millis());
        self.job.app_id = Some(id.clone());
        id
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cohort:     {} containers", self.job.num_containers)?;
        writeln!(
            f,
            "Container:  {} MB, {} vcores, priority {}",
            self.container.memory_mb, self.container.vcores, self.job.priority
        )?;
        writeln!(
            f,
            "Launch:     {} {} (args: {:?})",
            self.launch.shell_command,
            self.launch.script_path.display(),
            self.launch.script_args
        )?;
        writeln!(f, "Port:       {}", self.job.listen_port)?;
        write!(
            f,
            "Storage:    {} (prefix {:?})",
            self.storage.root.display(),
            self.storage.path_prefix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.job.num_containers, 1);
        assert_eq!(config.job.priority, 10);
        assert_eq!(config.job.listen_port, 9999);
        assert_eq!(config.container.memory_mb, 1000);
        assert_eq!(config.container.vcores, 2);
        assert_eq!(config.storage.path_prefix, "cohort/");
        assert_eq!(config.runtime.settle_delay(), Duration::from_secs(3));
        assert_eq!(config.runtime.launch_join_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_resolve_app_id_is_stable() {
        let mut config = Config::default();
        let first = config.resolve_app_id();
        assert!(first.starts_with("application_"));
        assert_eq!(config.resolve_app_id(), first);
    }
}
