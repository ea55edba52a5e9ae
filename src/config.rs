//! Run configuration and fixed constants

use crate::wait::WaitConfig;
use clap::ValueEnum;
use std::path::PathBuf;
use thiserror::Error;

/// Ubuntu 18.04 LTS arm64 AMI
pub const UBUNTU_18_04_AMI: &str = "ami-0f2b111fdc1647918";

/// Ubuntu 20.04 LTS arm64 AMI
pub const UBUNTU_20_04_AMI: &str = "ami-0ea142bd244023692";

/// Default EC2 instance type (8-core Graviton2)
pub const DEFAULT_INSTANCE_TYPE: &str = "t4g.2xlarge";

/// Default PyTorch branch to build
pub const DEFAULT_BRANCH: &str = "malfet/static-openblas-detection";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default EC2 key pair name
pub const DEFAULT_KEY_NAME: &str = "wheel-builder";

/// Security group attached to build instances (SSH open to the world)
pub const SECURITY_GROUP: &str = "ssh-allworld";

/// Remote login user on Ubuntu AMIs
pub const SSH_USER: &str = "ubuntu";

/// Remote SSH port
pub const SSH_PORT: u16 = 22;

/// Base OS image for the build instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OsImage {
    #[value(name = "ubuntu18_04")]
    Ubuntu18_04,
    #[value(name = "ubuntu20_04")]
    Ubuntu20_04,
}

impl OsImage {
    /// The fixed AMI id for this image
    pub fn ami(self) -> &'static str {
        match self {
            OsImage::Ubuntu18_04 => UBUNTU_18_04_AMI,
            OsImage::Ubuntu20_04 => UBUNTU_20_04_AMI,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// instance_type field is empty
    #[error("instance type cannot be empty")]
    EmptyInstanceType,

    /// branch field is empty
    #[error("branch cannot be empty")]
    EmptyBranch,

    /// SSH private key file does not exist
    #[error("SSH key file not found: {0}")]
    MissingKeyFile(PathBuf),
}

/// Configuration for one build run, assembled entirely from CLI input
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Unique run identifier for instance tagging
    pub run_id: String,

    /// Base OS image
    pub os: OsImage,

    /// EC2 instance type
    pub instance_type: String,

    /// PyTorch branch to build
    pub branch: String,

    /// Skip provisioning, run the build phase only
    pub build_only: bool,

    /// Keep the instance running after the run (even on failure)
    pub keep: bool,

    /// SSH private key file
    pub key_file: PathBuf,

    /// Known-hosts file for pinned host keys; accept-any when unset
    pub known_hosts: Option<PathBuf>,

    /// Optional JSON run summary output path
    pub output: Option<PathBuf>,

    /// Bounded fixed-interval wait used for SSH reachability
    pub reachability: WaitConfig,
}

impl RunConfig {
    /// Validate the configuration before any billable action is taken
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_type.trim().is_empty() {
            return Err(ConfigError::EmptyInstanceType);
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::EmptyBranch);
        }
        if !self.key_file.exists() {
            return Err(ConfigError::MissingKeyFile(self.key_file.clone()));
        }
        Ok(())
    }
}

/// Default SSH private key path: `~/.ssh/<key-name>.pem`
pub fn default_key_file(key_name: &str) -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".ssh"))
        .unwrap_or_else(|| PathBuf::from(".ssh"))
        .join(format!("{key_name}.pem"))
}
