//! Berth - deployment and routing orchestration for a self-hosted PaaS
//!
//! This library turns declared applications and databases into running
//! containers and keeps a shared HAProxy in step with them:
//! - Plans container images from build pack settings (static sites, Node.js)
//! - Builds images through the Docker engine, with an optional cache stage
//! - Generates compose documents for databases and built applications
//! - Reconfigures HAProxy through versioned Data Plane API transactions
//! - Coordinates a whole deployment attempt, logging every step per build

pub mod builder;
pub mod buildlog;
pub mod buildpacks;
pub mod compose;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod error;
pub mod haproxy;
pub mod model;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
