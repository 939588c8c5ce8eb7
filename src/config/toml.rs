//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use crate::config::cli_convert::{parse_duration_ms, parse_env_pair, parse_memory_mb};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the config file named on the command line (if any) and apply CLI overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(ref app_id) = cli.app_id {
        config.job.app_id = Some(app_id.clone());
    }
    if let Some(n) = cli.num_containers {
        config.job.num_containers = n;
    }
    if let Some(priority) = cli.priority {
        config.job.priority = priority;
    }
    if let Some(port) = cli.listen_port {
        config.job.listen_port = port;
    }

    // Container resources
    if let Some(ref memory) = cli.container_memory {
        config.container.memory_mb = parse_memory_mb(memory)
            .context("Invalid --container-memory")?;
    }
    if let Some(vcores) = cli.container_vcores {
        config.container.vcores = vcores;
    }

    // Launch
    if let Some(ref path) = cli.script_path {
        config.launch.script_path = path.clone();
    }
    if let Some(ref shell) = cli.shell_command {
        config.launch.shell_command = shell.clone();
    }
    if let Some(ref args) = cli.shell_args {
        config.launch.script_args = args.clone();
    }
    for pair in &cli.shell_env {
        let (key, value) = parse_env_pair(pair)?;
        config.launch.env.insert(key, value);
    }

    // Storage
    if let Some(ref root) = cli.storage_root {
        config.storage.root = root.clone();
    }
    if let Some(ref prefix) = cli.path_prefix {
        config.storage.path_prefix = prefix.clone();
    }

    // Cluster
    if !cli.nodes.is_empty() {
        config.cluster.nodes = cli.nodes.iter().map(|h| NodeConfig::new(h.trim())).collect();
    }
    if let Some(ref work_dir) = cli.work_dir {
        config.cluster.work_dir = work_dir.clone();
    }

    // Runtime
    if let Some(ref delay) = cli.settle_delay {
        config.runtime.settle_delay_ms = parse_duration_ms(delay)
            .context("Invalid --settle-delay")?;
    }
    if let Some(ref timeout) = cli.launch_join_timeout {
        config.runtime.launch_join_timeout_ms = parse_duration_ms(timeout)
            .context("Invalid --launch-join-timeout")?;
    }
    if cli.debug {
        config.runtime.debug = true;
    }

    if let Some(ref path) = cli.json_output {
        config.output.json_output = Some(path.clone());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_string() {
        let toml_str = r#"
            [job]
            num_containers = 4
            listen_port = 7777

            [container]
            memory_mb = 2048

            [launch]
            shell_command = "sh"
            script_path = "jobs/run.sh"
            env = { OMP_NUM_THREADS = "4" }

            [[cluster.nodes]]
            host = "node-a"

            [[cluster.nodes]]
            host = "node-b"
            memory_mb = 1024
            vcores = 1
        "#;

        let config = parse_toml_string(toml_str).unwrap();
        assert_eq!(config.job.num_containers, 4);
        assert_eq!(config.job.listen_port, 7777);
        assert_eq!(config.job.priority, 10);
        assert_eq!(config.container.memory_mb, 2048);
        assert_eq!(config.container.vcores, 2);
        assert_eq!(config.launch.shell_command, "sh");
        assert_eq!(config.launch.env.get("OMP_NUM_THREADS").map(String::as_str), Some("4"));
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.cluster.nodes[0].memory_mb, 8192);
        assert_eq!(config.cluster.nodes[1].vcores, 1);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let config = parse_toml_string("[job]\nnum_containers = 4\n").unwrap();
        let cli = Cli {
            num_containers: Some(2),
            container_memory: Some("1g".to_string()),
            shell_env: vec!["A=1".to_string(), "B".to_string()],
            nodes: vec!["n1".to_string(), " n2".to_string()],
            settle_delay: Some("250ms".to_string()),
            ..Default::default()
        };

        let merged = merge_cli_with_config(&cli, config).unwrap();
        assert_eq!(merged.job.num_containers, 2);
        assert_eq!(merged.container.memory_mb, 1024);
        assert_eq!(merged.launch.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.launch.env.get("B").map(String::as_str), Some(""));
        assert_eq!(merged.cluster.nodes, vec![NodeConfig::new("n1"), NodeConfig::new("n2")]);
        assert_eq!(merged.runtime.settle_delay_ms, 250);
    }

    #[test]
    fn test_invalid_memory_rejected() {
        let cli = Cli {
            container_memory: Some("huge".to_string()),
            ..Default::default()
        };
        assert!(merge_cli_with_config(&cli, Config::default()).is_err());
    }
}
