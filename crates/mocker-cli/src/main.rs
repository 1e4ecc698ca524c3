//! mocker CLI - run a command in a throwaway container

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mocker_core::{IdMap, LaunchConfig, RootfsProvisioner, Sandbox};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "mocker")]
#[command(author, version, about = "Minimal container launcher built on namespaces and cgroups")]
struct Cli {
    /// Hostname inside the container
    #[arg(long)]
    hostname: Option<String>,

    /// Memory limit in bytes
    #[arg(long)]
    memory: Option<u64>,

    /// CPU quota in microseconds per period
    #[arg(long)]
    cpu_quota: Option<u64>,

    /// CPU period in microseconds
    #[arg(long)]
    cpu_period: Option<u64>,

    /// uid map, e.g. "0 1000 1" (segments may be separated by commas)
    #[arg(long)]
    uid_map: Option<IdMap>,

    /// gid map, same format as --uid-map
    #[arg(long)]
    gid_map: Option<IdMap>,

    /// cgroup v2 hierarchy to create the container's group in
    /// (defaults to MOCKER_CGROUP_ROOT env var or /sys/fs/cgroup)
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    /// Name of the container's cgroup
    #[arg(long)]
    cgroup_name: Option<String>,

    /// Copy this directory as the rootfs instead of installing busybox
    /// (busybox comes from MOCKER_BUSYBOX or PATH)
    #[arg(long)]
    rootfs_template: Option<PathBuf>,

    /// JSON file with launch settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay in the caller's user namespace (needs root)
    #[arg(long)]
    no_user_ns: bool,

    /// Share the host network stack
    #[arg(long)]
    no_net_ns: bool,

    /// Share the host SysV IPC namespace
    #[arg(long)]
    no_ipc_ns: bool,

    /// Log setup steps to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command in a new container
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Command to execute, looked up on PATH inside the container
    command: String,

    /// Arguments passed to the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    /// Layer command-line overrides on top of file settings
    fn apply(&self, config: &mut LaunchConfig) {
        if let Some(hostname) = &self.hostname {
            config.hostname.clone_from(hostname);
        }
        if let Some(bytes) = self.memory {
            config.limits.memory_max = Some(bytes);
        }
        if let Some(quota) = self.cpu_quota {
            config.limits.cpu_quota_us = Some(quota);
        }
        if let Some(period) = self.cpu_period {
            config.limits.cpu_period_us = period;
        }
        if let Some(map) = &self.uid_map {
            config.uid_map = Some(map.clone());
        }
        if let Some(map) = &self.gid_map {
            config.gid_map = Some(map.clone());
        }
        if let Some(root) = &self.cgroup_root {
            config.cgroup.root.clone_from(root);
        }
        if let Some(name) = &self.cgroup_name {
            config.cgroup.name.clone_from(name);
        }
        if let Some(template) = &self.rootfs_template {
            config.rootfs_template = Some(template.clone());
        }
        if self.no_user_ns {
            config.namespaces.user = false;
        }
        if self.no_net_ns {
            config.namespaces.net = false;
        }
        if self.no_ipc_ns {
            config.namespaces.ipc = false;
        }
    }

    fn launch_config(&self) -> anyhow::Result<LaunchConfig> {
        let mut config = match &self.config {
            Some(path) => LaunchConfig::from_json_file(path)?,
            None => LaunchConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("mocker: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mocker=debug" } else { "mocker=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<u8> {
    let Commands::Run(args) = &cli.command;
    let config = cli.launch_config()?;
    tracing::debug!(?config, "launch configuration");

    let provisioner = match &config.rootfs_template {
        Some(template) => RootfsProvisioner::template(template),
        None => RootfsProvisioner::from_env()?,
    };
    let rootfs = provisioner
        .provision()
        .context("failed to provision rootfs")?;

    let spec = config
        .spec_builder(args.command.clone(), args.args.iter().cloned())
        .rootfs(rootfs.path())
        .build()
        .context("invalid launch settings")?;

    let outcome = Sandbox::new(spec, config.cgroup.clone())
        .with_rootfs(rootfs)
        .run()
        .with_context(|| format!("failed to run {}", args.command))?;

    Ok(exit_code(outcome.exit_code))
}

/// Process exit status for a child code; anything out of range is a failure
fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
