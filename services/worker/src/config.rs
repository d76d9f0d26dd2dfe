//! Configuration for the worker.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::docker::DEFAULT_DOCKER_SOCKET;
use crate::image_cache::parse_image_list;
use crate::resources::ResourceQuantity;

const DEFAULT_WORKLOAD_RETENTION: Duration = Duration::from_secs(3600);

/// Which container engine backs docker workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// The Docker daemon on `docker_socket`.
    Docker,
    /// In-process engine that runs nothing. For local development.
    Mock,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(EngineKind::Docker),
            "mock" => Ok(EngineKind::Mock),
            other => bail!("unknown engine '{other}', expected 'docker' or 'mock'"),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity this worker offers, in millicpu and MiB.
    pub reserved: ResourceQuantity,

    /// Raw supported workload type list; validated by the workload manager.
    pub supported_workloads: Option<String>,

    /// Images already on the host; never pulled.
    pub preinstalled_images: Vec<String>,

    pub docker_socket: PathBuf,

    /// Measured for disk usage at startup.
    pub data_dir: PathBuf,

    pub engine: EngineKind,

    /// How long finished workloads stay queryable before being pruned.
    pub workload_retention: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reserved_cpu = required_quantity(&lookup, "RESERVED_CPU")?;
        let reserved_mem = required_quantity(&lookup, "RESERVED_MEM")?;

        let supported_workloads = lookup("SUPPORTED_WORKLOADS").filter(|v| !v.trim().is_empty());

        let preinstalled_images = lookup("PREINSTALLED_IMAGES")
            .map(|v| parse_image_list(&v))
            .unwrap_or_default();

        let docker_socket = lookup("DOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_SOCKET));

        let data_dir = lookup("WORKER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));

        let engine = lookup("WORKER_ENGINE")
            .map(|v| v.parse::<EngineKind>())
            .transpose()
            .context("WORKER_ENGINE is invalid.")?
            .unwrap_or(EngineKind::Docker);

        let workload_retention = lookup("WORKLOAD_RETENTION_SECS")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .context("WORKLOAD_RETENTION_SECS must be a whole number of seconds.")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_WORKLOAD_RETENTION);

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            reserved: ResourceQuantity::new(reserved_cpu, reserved_mem),
            supported_workloads,
            preinstalled_images,
            docker_socket,
            data_dir,
            engine,
            workload_retention,
            log_level,
        })
    }
}

fn required_quantity<F>(lookup: &F, key: &str) -> Result<i64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).with_context(|| format!("Missing {key}."))?;
    let value: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be an integer."))?;
    if value < 0 {
        bail!("{key} must not be negative.");
    }
    Ok(value)
}
