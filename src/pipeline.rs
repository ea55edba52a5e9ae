//! Declarative provisioning and build pipeline.
//!
//! The remote command sequence is data rather than inline calls, so the
//! steps can be inspected and tested without a live host.

use serde::{Deserialize, Serialize};

/// Remote glob of the wheels produced by the build, relative to the login
/// user's home directory
pub const ARTIFACT_GLOB: &str = "pytorch/dist/*.whl";

/// OpenBLAS release pinned for reproducible math-library builds
const OPENBLAS_TAG: &str = "v0.3.10";

/// Pipeline phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// OS package and toolchain setup
    Provision,
    /// Dependency and wheel compilation
    Build,
}

/// One remote shell command in the fixed pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub phase: Phase,
    pub command: String,
}

impl Step {
    fn new(name: &str, phase: Phase, command: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            phase,
            command: command.into(),
        }
    }
}

/// The fixed, ordered pipeline for building a PyTorch wheel from `branch`.
///
/// Provisioning first stops the background apt units and polls them
/// quiescent; unattended upgrades otherwise hold the dpkg lock right after
/// boot and the installs below fail.
pub fn build_pipeline(branch: &str) -> Vec<Step> {
    vec![
        Step::new(
            "stop-apt-daily",
            Phase::Provision,
            "sudo systemctl stop apt-daily.service || true",
        ),
        Step::new(
            "stop-unattended-upgrades",
            Phase::Provision,
            "sudo systemctl stop unattended-upgrades.service || true",
        ),
        Step::new(
            "wait-apt-daily",
            Phase::Provision,
            "while systemctl is-active --quiet apt-daily.service; do sleep 1; done",
        ),
        Step::new(
            "wait-unattended-upgrades",
            Phase::Provision,
            "while systemctl is-active --quiet unattended-upgrades.service; do sleep 1; done",
        ),
        Step::new("apt-update", Phase::Provision, "sudo apt-get update"),
        Step::new(
            "install-toolchain",
            Phase::Provision,
            "sudo apt-get install -y ninja-build g++ git cmake python3-dev gfortran",
        ),
        Step::new(
            "install-python-packaging",
            Phase::Provision,
            "sudo apt-get install -y python3-yaml python3-setuptools python3-wheel python3-pip",
        ),
        Step::new(
            "pip-dataclasses",
            Phase::Provision,
            "sudo pip3 install dataclasses",
        ),
        Step::new("pip-cython", Phase::Provision, "sudo pip3 install Cython"),
        Step::new("pip-numpy", Phase::Provision, "sudo pip3 install numpy"),
        Step::new(
            "clone-openblas",
            Phase::Build,
            format!("git clone https://github.com/xianyi/OpenBLAS -b {OPENBLAS_TAG}"),
        ),
        Step::new(
            "build-openblas",
            Phase::Build,
            "pushd OpenBLAS; make NO_SHARED=1 -j8; sudo make NO_SHARED=1 install;popd",
        ),
        Step::new(
            "clone-pytorch",
            Phase::Build,
            format!("git clone --recurse-submodules -b {branch} https://github.com/pytorch/pytorch"),
        ),
        Step::new(
            "build-wheel",
            Phase::Build,
            "cd pytorch ; python3 setup.py bdist_wheel",
        ),
    ]
}
