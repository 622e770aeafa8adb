//! Node wiring: the accept loop, per-connection session spawning, the expiry
//! sweeper, and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::availability::{AvailabilityPolicy, ServerStatus};
use crate::config::{NodeConfig, RuntimeTunables};
use crate::memcache;
use crate::metrics;
use crate::session::SessionHandler;
use spool_store::{CollectionConfig, QueueCollection};

/// One-shot, clonable shutdown signal shared by the accept loop, the
/// sweeper, and every session.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    fired: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        ShutdownHandle {
            notify: Arc::new(Notify::new()),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.fired.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        ShutdownHandle::new()
    }
}

/// A running node. Dropping the handle does not stop the node; call
/// [`shutdown`](NodeHandle::shutdown) or [`run`](NodeHandle::run).
pub struct NodeHandle {
    addr: std::net::SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl NodeHandle {
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Triggers shutdown and waits for the node to drain and close its
    /// journals.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.shutdown.trigger();
        join_node(&mut self.task).await
    }

    /// Runs until the node stops on its own (client `shutdown` command) or
    /// the process receives an interrupt.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::select! {
            res = &mut self.task => {
                return res.context("node task panicked")?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
            }
        }
        self.shutdown.trigger();
        join_node(&mut self.task).await
    }
}

async fn join_node(task: &mut JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    task.await.context("node task panicked")?
}

/// Opens the collection (replaying journals), binds the listener, and spawns
/// the accept loop plus the expiry sweeper.
pub async fn start_node(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    metrics::mark_started();
    let collection = Arc::new(
        QueueCollection::open(CollectionConfig {
            data_dir: config.data_dir.clone(),
            sync_policy: config.sync_policy,
            limits: config.limits,
            ..CollectionConfig::default()
        })
        .context("open queue collection")?,
    );
    let status = config.initial_status.map(|s| Arc::new(ServerStatus::new(s)));
    let tunables = Arc::new(RuntimeTunables::new(&config));
    let shutdown = ShutdownHandle::new();

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    let addr = listener.local_addr().context("listener local addr")?;

    if !config.expiry_sweep.is_zero() {
        tokio::spawn(sweep_expired(
            Arc::clone(&collection),
            Arc::clone(&tunables),
            shutdown.clone(),
        ));
    }

    let task = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&collection),
        status,
        tunables,
        config.availability,
        shutdown.clone(),
        config.shutdown_delay,
    ));

    Ok(NodeHandle {
        addr,
        shutdown,
        task,
    })
}

async fn sweep_expired(
    collection: Arc<QueueCollection>,
    tunables: Arc<RuntimeTunables>,
    shutdown: ShutdownHandle,
) {
    loop {
        let interval = tunables.expiry_sweep().max(Duration::from_millis(10));
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let swept = collection.flush_all_expired(SystemTime::now());
        if swept > 0 {
            tracing::debug!(swept, "expired items discarded");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    collection: Arc<QueueCollection>,
    status: Option<Arc<ServerStatus>>,
    tunables: Arc<RuntimeTunables>,
    policy: AvailabilityPolicy,
    shutdown: ShutdownHandle,
    shutdown_delay: Duration,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                spawn_session(
                    stream,
                    peer,
                    Arc::clone(&collection),
                    status.clone(),
                    Arc::clone(&tunables),
                    policy,
                    shutdown.clone(),
                    shutdown_delay,
                );
            }
        }
    }
    drop(listener);
    collection.close().await;
    tracing::info!("node stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_session(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    collection: Arc<QueueCollection>,
    status: Option<Arc<ServerStatus>>,
    tunables: Arc<RuntimeTunables>,
    policy: AvailabilityPolicy,
    shutdown: ShutdownHandle,
    shutdown_delay: Duration,
) {
    let id = metrics::next_session_id();
    let sessions = metrics::session_opened();
    let availability = policy.at_connect(sessions);
    let session = SessionHandler::new(
        id,
        &peer.to_string(),
        collection,
        status,
        availability,
        tunables,
        shutdown,
        shutdown_delay,
    );
    tokio::spawn(async move {
        tracing::debug!(session = id, peer = %peer, "session opened");
        if let Err(err) = memcache::serve(stream, session).await {
            tracing::debug!(session = id, error = %err, "session closed with error");
        } else {
            tracing::debug!(session = id, "session closed");
        }
    });
}
