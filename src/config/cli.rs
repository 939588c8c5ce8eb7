//! CLI argument parsing using clap

use clap::Parser;
use std::path::PathBuf;

/// cohort-master - launch and supervise a fixed cohort of workers
#[derive(Parser, Debug, Default)]
#[command(name = "cohort-master")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file (CLI flags override its values)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Application id (normally injected by the cluster)
    #[arg(long, env = "COHORT_APP_ID")]
    pub app_id: Option<String>,

    // === Cohort Options ===
    /// Number of containers (one worker per container)
    #[arg(short = 'n', long)]
    pub num_containers: Option<usize>,

    /// Memory per container (e.g., 1000, 512m, 2g)
    #[arg(long)]
    pub container_memory: Option<String>,

    /// Virtual cores per container
    #[arg(long)]
    pub container_vcores: Option<u32>,

    /// Priority of the container requests
    #[arg(long)]
    pub priority: Option<i32>,

    /// Port every worker listens on
    #[arg(long)]
    pub listen_port: Option<u16>,

    // === Launch Options ===
    /// Launch script path in shared storage
    #[arg(long)]
    pub script_path: Option<PathBuf>,

    /// Command that runs the launch script (e.g., python, sh)
    #[arg(long)]
    pub shell_command: Option<String>,

    /// Extra arguments for the launch script
    #[arg(long, allow_hyphen_values = true)]
    pub shell_args: Option<String>,

    /// Environment for the workers, as KEY=VALUE (repeatable)
    #[arg(long = "shell-env", value_name = "KEY=VALUE")]
    pub shell_env: Vec<String>,

    // === Storage Options ===
    /// Root of the shared filesystem
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Directory prefix for the hostfile, relative to the storage root
    #[arg(long)]
    pub path_prefix: Option<String>,

    // === Cluster Options ===
    /// Local cluster node hosts (comma-separated, e.g., "node1,node2")
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Work directory for local container workspaces
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    // === Runtime Options ===
    /// Delay after launching rank 0 (e.g., 3s, 500ms)
    #[arg(long)]
    pub settle_delay: Option<String>,

    /// Bound on joining launch tasks at shutdown (e.g., 10s)
    #[arg(long)]
    pub launch_join_timeout: Option<String>,

    // === Output Options ===
    /// Write a JSON outcome report to this path
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose logging and environment dump
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Flag combinations clap cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(n) = self.num_containers {
            if n == 0 {
                anyhow::bail!("--num-containers must be at least 1");
            }
        }
        if self.nodes.iter().any(|h| h.trim().is_empty()) {
            anyhow::bail!("--nodes contains an empty host name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repeatable_flags() {
        let cli = Cli::try_parse_from([
            "cohort-master",
            "-n",
            "3",
            "--script-path",
            "jobs/launch.py",
            "--shell-env",
            "A=1",
            "--shell-env",
            "B",
            "--nodes",
            "n1,n2,n3",
        ])
        .unwrap();

        assert_eq!(cli.num_containers, Some(3));
        assert_eq!(cli.shell_env, vec!["A=1", "B"]);
        assert_eq!(cli.nodes, vec!["n1", "n2", "n3"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_zero_containers_rejected() {
        let cli = Cli::try_parse_from(["cohort-master", "-n", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
