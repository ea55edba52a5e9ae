//! wheel-builder-ec2: build aarch64 PyTorch wheels on ephemeral EC2 instances
//!
//! Allocates an EC2 instance, provisions it over SSH, builds a wheel from the
//! requested branch, copies the wheel back locally, and terminates the
//! instance. Also supports allocate-only, list, and terminate-all flows.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;
use wheel_builder_ec2::config::{
    self, OsImage, RunConfig, DEFAULT_BRANCH, DEFAULT_INSTANCE_TYPE, DEFAULT_KEY_NAME,
    DEFAULT_REGION,
};
use wheel_builder_ec2::ec2::Ec2Client;
use wheel_builder_ec2::orchestrator;
use wheel_builder_ec2::wait::WaitConfig;

#[derive(Parser, Debug)]
#[command(name = "wheel-builder-ec2")]
#[command(about = "Build and test aarch64 wheels using EC2")]
#[command(version)]
struct Args {
    /// Verbose (debug-level) logging
    #[arg(long)]
    debug: bool,

    /// Skip provisioning, run the build phase only
    #[arg(long)]
    build_only: bool,

    /// Base OS image for the build instance
    #[arg(long, value_enum, default_value = "ubuntu20_04")]
    os: OsImage,

    /// Allocate an instance and exit without building
    #[arg(long)]
    alloc_instance: bool,

    /// List all instances of the selected type and exit
    #[arg(long)]
    list_instances: bool,

    /// Terminate all instances of the selected type and exit
    #[arg(long)]
    terminate_instances: bool,

    /// EC2 instance type
    #[arg(long, default_value = DEFAULT_INSTANCE_TYPE)]
    instance_type: String,

    /// PyTorch branch to build
    #[arg(long, default_value = DEFAULT_BRANCH)]
    branch: String,

    /// AWS region
    #[arg(long, default_value = DEFAULT_REGION)]
    region: String,

    /// EC2 key pair name
    #[arg(long, default_value = DEFAULT_KEY_NAME)]
    key_name: String,

    /// SSH private key file (default: ~/.ssh/<key-name>.pem)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Known-hosts file for strict host-key checking.
    ///
    /// When unset, host-key verification is disabled: the instance is
    /// ephemeral and disposable, so authenticity checking is traded away
    /// rather than distributing host keys per run.
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Keep the instance running after the build (even on failure)
    #[arg(long)]
    keep: bool,

    /// Write a JSON run summary to this path after a successful build
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .init();

    let run_id = Uuid::now_v7().to_string();
    let ec2 = Ec2Client::new(&args.region, &args.key_name, &run_id).await;

    if args.list_instances {
        orchestrator::list_instances(&ec2, &args.instance_type).await?;
        return Ok(());
    }

    if args.terminate_instances {
        orchestrator::terminate_instances(&ec2, &args.instance_type).await?;
        return Ok(());
    }

    if args.alloc_instance {
        orchestrator::start_instance(&ec2, args.os.ami(), &args.instance_type).await?;
        return Ok(());
    }

    let config = RunConfig {
        run_id: run_id.clone(),
        os: args.os,
        instance_type: args.instance_type,
        branch: args.branch,
        build_only: args.build_only,
        keep: args.keep,
        key_file: args
            .key_file
            .unwrap_or_else(|| config::default_key_file(&args.key_name)),
        known_hosts: args.known_hosts,
        output: args.output,
        reachability: WaitConfig::default(),
    };

    info!(run_id = %run_id, branch = %config.branch, "Starting build");
    orchestrator::run_build(&ec2, &config).await
}
