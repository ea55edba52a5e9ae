//! wheel-builder-ec2 - ephemeral EC2 wheel build orchestrator
//!
//! This crate provides the binary that allocates an EC2 instance, provisions
//! it over SSH, builds an aarch64 PyTorch wheel on it, copies the wheel back,
//! and terminates the instance.

pub mod config;
pub mod ec2;
pub mod orchestrator;
pub mod pipeline;
pub mod ssh;
pub mod wait;
