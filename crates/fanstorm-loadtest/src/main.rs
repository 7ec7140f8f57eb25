//! # Fanstorm CLI
//!
//! ```bash
//! # Full experiment, results on stdout
//! fanstorm --users 50 --ramp 500ms --email owner@e.com --token $TOKEN --videopath 640.flv
//!
//! # Viewer side only, as launched on worker nodes
//! fanstorm fan --users 16 --ramp 1500ms --existingoffset 200 --influencerid 42
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fanstorm_client::HttpPlatformClient;
use fanstorm_core::{NodeFailurePolicy, RunConfig};
use fanstorm_loadtest::{CsvSink, FanoutCoordinator, SshShell, TestRun};
use fanstorm_media::{EncoderPush, RtmpdumpObserver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Config file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG_FILE: &str = "fanstorm.toml";

/// Decoders and sockets per viewer add up quickly
const OPEN_FILE_LIMIT: u64 = 8192;

#[derive(Parser)]
#[command(name = "fanstorm")]
#[command(author = "Fanstorm Load Testing Team")]
#[command(version)]
#[command(about = "Viewer load test for live-stream broadcasts", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a broadcast, push video to it and ramp viewers (default)
    Runtest(RunArgs),

    /// Ramp viewers against an existing broadcast
    Fan(RunArgs),
}

#[derive(Args, Clone, Debug, Default)]
struct RunArgs {
    /// Maximum concurrent users
    #[arg(long)]
    users: Option<usize>,

    /// Delay between user admissions, e.g. 500ms
    #[arg(long, value_parser = humantime::parse_duration)]
    ramp: Option<Duration>,

    /// Sequence number of the first existing fan account
    #[arg(long = "existingoffset")]
    existing_offset: Option<u64>,

    /// Percentage of users that sign up as new accounts
    #[arg(long = "percentnew", value_parser = clap::value_parser!(u8).range(0..=100))]
    percent_new: Option<u8>,

    /// Space-separated ssh destinations to spread users over
    #[arg(long = "sshhosts")]
    ssh_hosts: Option<String>,

    /// Private key for the ssh destinations
    #[arg(long = "sshkeyfile")]
    ssh_key_file: Option<PathBuf>,

    /// Broadcast to watch in fan mode
    #[arg(long = "influencerid")]
    influencer_id: Option<u64>,

    /// Broadcast owner email
    #[arg(long)]
    email: Option<String>,

    /// Broadcast owner OAuth token
    #[arg(long, env = "FANSTORM_OWNER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Video file pushed to the broadcast
    #[arg(long = "videopath")]
    video_path: Option<PathBuf>,

    /// Sign up the existing account pool before ramping
    #[arg(long = "precreatefans")]
    precreate_fans: bool,

    /// Stop after admitting this many users
    #[arg(long = "maxusers")]
    max_users: Option<u64>,

    /// What to do with unreachable ssh hosts: abort or degrade
    #[arg(long = "nodefailure")]
    node_failure: Option<NodeFailurePolicy>,

    /// TOML config file
    #[arg(long, env = "FANSTORM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "jsonlogs")]
    json_logs: bool,
}

impl RunArgs {
    /// Flags win over the config file
    fn apply(&self, config: &mut RunConfig) {
        if let Some(users) = self.users {
            config.ramp.concurrency = users;
        }
        if let Some(ramp) = self.ramp {
            config.ramp.ramp_interval = ramp;
        }
        if let Some(max_users) = self.max_users {
            config.ramp.max_users = Some(max_users);
        }
        if let Some(offset) = self.existing_offset {
            config.identity.existing_offset = offset;
        }
        if let Some(percent_new) = self.percent_new {
            config.identity.percent_new = percent_new;
        }
        if self.precreate_fans {
            config.identity.precreate = true;
        }
        if let Some(hosts) = &self.ssh_hosts {
            config.fleet.hosts = hosts.split_whitespace().map(str::to_string).collect();
        }
        if let Some(key_file) = &self.ssh_key_file {
            config.fleet.key_file = Some(key_file.clone());
        }
        if let Some(policy) = self.node_failure {
            config.fleet.failure_policy = policy;
        }
        if let Some(id) = self.influencer_id {
            config.owner.influencer_id = Some(id);
        }
        if let Some(email) = &self.email {
            config.owner.email = email.clone();
        }
        if let Some(token) = &self.token {
            config.owner.oauth_token = token.clone();
        }
        if let Some(video_path) = &self.video_path {
            config.broadcast.video_path = video_path.clone();
        }
    }

    fn load_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                RunConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => RunConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }
}

enum Mode {
    RunTest,
    Fan,
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the CSV
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
        }))
        .init();
}

#[cfg(unix)]
fn raise_open_file_limit(target: u64) {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let (soft, hard) = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok(limits) => limits,
        Err(e) => {
            warn!("Cannot read open file limit: {}", e);
            return;
        }
    };
    let wanted = target.min(hard);
    if soft >= wanted {
        return;
    }
    match setrlimit(Resource::RLIMIT_NOFILE, wanted, hard) {
        Ok(()) => info!("Raised open file limit from {} to {}", soft, wanted),
        Err(e) => warn!("Cannot raise open file limit to {}: {}", wanted, e),
    }
}

#[cfg(not(unix))]
fn raise_open_file_limit(_target: u64) {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (mode, args) = match cli.command {
        None => (Mode::RunTest, cli.run),
        Some(Commands::Runtest(args)) => (Mode::RunTest, args),
        Some(Commands::Fan(args)) => (Mode::Fan, args),
    };
    init_logging(args.verbose, args.json_logs);
    info!("Fanstorm v{}", fanstorm_core::VERSION);

    raise_open_file_limit(OPEN_FILE_LIMIT);

    let config = args.load_config()?;
    config.validate()?;

    let client = Arc::new(HttpPlatformClient::new(&config.platform)?);
    let observer = Arc::new(RtmpdumpObserver::new(&config.media.decoder_binary)?);
    let mut run = TestRun::new(config.clone(), client.clone(), observer);

    let cancel = run.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping the run");
            cancel.cancel();
        }
    });

    let report = match mode {
        Mode::RunTest => {
            let ingest = Arc::new(EncoderPush::new(
                &config.media.encoder_binary,
                &config.broadcast.video_path,
            )?);
            run = run.with_broadcast(client, ingest);

            let nodes = config.remote_nodes();
            if !nodes.is_empty() {
                let shell = Arc::new(SshShell::new(&config.fleet));
                run = run.with_fleet(FanoutCoordinator::new(shell, nodes, config.fleet.failure_policy));
            }
            run.run_test(CsvSink::stdout()).await?
        }
        Mode::Fan => run.run_fans(CsvSink::stdout()).await?,
    };

    report.print_report();
    Ok(())
}
