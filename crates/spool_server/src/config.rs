//! Node configuration: CLI arguments plus `SPOOL_*` environment overrides
//! for the knobs that can change at runtime via `reload`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;

use crate::availability::{AvailabilityPolicy, Status};
use spool_store::{QueueLimits, SyncPolicy};

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
#[command(name = "spool", about = "Durable FIFO message broker speaking the memcache text protocol")]
pub struct NodeArgs {
    /// Address the memcache protocol listener binds to.
    #[arg(long, default_value = "127.0.0.1:22133")]
    pub listen: SocketAddr,

    /// Directory for queue journals. Omit to run without persistence.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Journal fsync period in milliseconds. 0 syncs after every write,
    /// negative disables fsync entirely.
    #[arg(long, default_value_t = 50)]
    pub journal_sync_ms: i64,

    /// Reliable reads one session may hold open across all queues.
    #[arg(long, default_value_t = 128)]
    pub max_open_reads: usize,

    /// Per-queue item cap; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub max_items: usize,

    /// Largest accepted payload in bytes; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub max_item_size: usize,

    /// Session count beyond which new sessions are refused reads; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub max_sessions_for_reads: usize,

    /// Session count beyond which new sessions are refused writes; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub max_sessions_for_writes: usize,

    /// Expiry sweep interval in milliseconds; 0 disables the sweeper.
    #[arg(long, default_value_t = 1_000)]
    pub expiry_sweep_ms: u64,

    /// Delay before a client-requested shutdown takes effect, so the
    /// response can flush.
    #[arg(long, default_value_t = 100)]
    pub shutdown_delay_ms: u64,

    /// Initial server status (up, readonly, quiescent). Omitting leaves the
    /// `status` command unconfigured.
    #[arg(long)]
    pub status: Option<String>,
}

impl NodeArgs {
    pub fn into_config(self) -> anyhow::Result<NodeConfig> {
        let initial_status = match &self.status {
            None => None,
            Some(raw) => Some(
                Status::parse(raw)
                    .ok_or_else(|| anyhow::anyhow!("unknown status {raw:?}"))?,
            ),
        };
        Ok(NodeConfig {
            listen: self.listen,
            data_dir: self.data_dir,
            sync_policy: SyncPolicy::from_period_ms(self.journal_sync_ms),
            limits: QueueLimits {
                max_items: self.max_items,
                max_item_size: self.max_item_size,
            },
            max_open_reads: self.max_open_reads,
            availability: AvailabilityPolicy {
                max_sessions_for_reads: self.max_sessions_for_reads,
                max_sessions_for_writes: self.max_sessions_for_writes,
            },
            expiry_sweep: Duration::from_millis(self.expiry_sweep_ms),
            shutdown_delay: Duration::from_millis(self.shutdown_delay_ms),
            initial_status,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub data_dir: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    pub limits: QueueLimits,
    pub max_open_reads: usize,
    pub availability: AvailabilityPolicy,
    pub expiry_sweep: Duration,
    pub shutdown_delay: Duration,
    pub initial_status: Option<Status>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen: "127.0.0.1:0".parse().expect("loopback addr"),
            data_dir: None,
            sync_policy: SyncPolicy::Never,
            limits: QueueLimits::default(),
            max_open_reads: 128,
            availability: AvailabilityPolicy::default(),
            expiry_sweep: Duration::from_millis(1_000),
            shutdown_delay: Duration::from_millis(100),
            initial_status: None,
        }
    }
}

/// Limits a running node re-reads on `reload`. Environment variables win
/// over the CLI values they shadow.
#[derive(Debug)]
pub struct RuntimeTunables {
    max_open_reads: AtomicUsize,
    expiry_sweep_ms: AtomicU64,
}

impl RuntimeTunables {
    pub fn new(config: &NodeConfig) -> Self {
        let tunables = RuntimeTunables {
            max_open_reads: AtomicUsize::new(config.max_open_reads),
            expiry_sweep_ms: AtomicU64::new(config.expiry_sweep.as_millis() as u64),
        };
        tunables.reload();
        tunables
    }

    pub fn max_open_reads(&self) -> usize {
        self.max_open_reads.load(Ordering::Acquire)
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_ms.load(Ordering::Acquire))
    }

    /// Applies `SPOOL_*` overrides to every runtime-tunable limit.
    pub fn reload(&self) {
        if let Some(value) = read_env_usize("SPOOL_MAX_OPEN_READS") {
            self.max_open_reads.store(value, Ordering::Release);
            tracing::info!(max_open_reads = value, "applied env override");
        }
        if let Some(value) = read_env_u64("SPOOL_EXPIRY_SWEEP_MS") {
            self.expiry_sweep_ms.store(value, Ordering::Release);
            tracing::info!(expiry_sweep_ms = value, "applied env override");
        }
    }
}

fn read_env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| usize::from_str(&v).ok())
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| u64::from_str(&v).ok())
}
