//! Server core for the spool broker: per-session command handling with
//! reliable-read bookkeeping, the memcache-framing protocol adapter, and the
//! node wiring (accept loop, availability gating, expiry sweeper, shutdown).

pub mod availability;
pub mod config;
mod memcache;
pub mod metrics;
pub mod pending_reads;
mod server;
mod session;

pub use config::{NodeArgs, NodeConfig, RuntimeTunables};
pub use pending_reads::PendingReadSet;
pub use server::{start_node, NodeHandle, ShutdownHandle};
pub use session::{SessionError, SessionHandler};
