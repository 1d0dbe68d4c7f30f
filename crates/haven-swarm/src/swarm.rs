/// Async swarm driver.
///
/// One task per source, all sharing the coordinator and the file set:
///
/// ```text
///   register ─► became_active ─┬─► fetch ─► write_at ─► write_completed ─┐
///                    ▲         │                                         │
///                    │         └─► idle: wait on wakeup / cancellation   │
///                    └──── queued: sleep retry hint ◄────────────────────┘
/// ```
///
/// Network I/O happens in the task, never under the coordinator lock.
/// Physical writes run on the blocking pool with positioned I/O.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::connection::{ConnectionId, QueueInfo};
use crate::coordinator::{SwarmCoordinator, SwarmOutcome};
use crate::error::{Result, SwarmError};
use crate::logging::SwarmLogger;
use crate::range::{Range, RangeSet};
use crate::storage::FileSet;
use crate::verifier::{BlockVerifier, RandomFailVerifier};

/// What a source answered to one fetch.
#[derive(Debug, Clone)]
pub enum FetchReply {
    /// Bytes starting at the requested offset. May be shorter than asked.
    Data(Bytes),
    /// Remote paused us.
    Queued(QueueInfo),
    /// Remote closed cleanly; nothing more from this source.
    Exhausted,
}

/// The network side of one source. Implementations own their socket or
/// file handle; the driver calls `fetch` from a single task.
pub trait SourceTransport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn label(&self) -> String;

    /// Bytes this source holds, `None` for a complete copy.
    fn available(&self) -> Option<RangeSet> {
        None
    }

    fn fetch(&mut self, range: Range) -> impl Future<Output = std::result::Result<FetchReply, Self::Error>> + Send;
}

#[derive(Clone)]
struct SourceContext {
    coordinator: Arc<SwarmCoordinator>,
    files: Arc<FileSet>,
    cancel: CancellationToken,
    queue_retry: Duration,
}

pub struct Swarm {
    coordinator: Arc<SwarmCoordinator>,
    files: Arc<FileSet>,
    config: SwarmConfig,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Swarm {
    /// Swarm writing into `files`. A positive `config.fail_rate` wraps the
    /// verifier with random fault injection.
    pub fn new(
        files: FileSet,
        verifier: Arc<dyn BlockVerifier>,
        config: SwarmConfig,
        logger: Arc<dyn SwarmLogger>,
    ) -> Result<Self> {
        let files = Arc::new(files);
        let verifier: Arc<dyn BlockVerifier> = if config.fail_rate > 0.0 {
            warn!(fail_rate = config.fail_rate, "fault injection enabled");
            Arc::new(RandomFailVerifier::new(verifier, config.fail_rate))
        } else {
            verifier
        };
        let coordinator = SwarmCoordinator::new(files.total_length(), verifier, files.clone())?
            .with_config(&config)
            .with_logger(logger);

        info!(
            transfer_id = %coordinator.transfer_id(),
            bytes = files.total_length(),
            files = files.map().entries().len(),
            "swarm created"
        );

        Ok(Self {
            coordinator: Arc::new(coordinator),
            files,
            config,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        })
    }

    pub fn coordinator(&self) -> Arc<SwarmCoordinator> {
        self.coordinator.clone()
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    /// Register `transport` and start its task.
    pub fn add_source<T: SourceTransport>(&mut self, transport: T) -> Result<ConnectionId> {
        let id = self
            .coordinator
            .register(transport.label(), transport.available())?;
        let ctx = SourceContext {
            coordinator: self.coordinator.clone(),
            files: self.files.clone(),
            cancel: self.cancel.child_token(),
            queue_retry: self.config.queue_retry(),
        };
        self.tasks.spawn(drive_source(ctx, id, transport));
        Ok(id)
    }

    /// Resolve with the terminal outcome, then stop every task.
    pub async fn wait(&mut self) -> SwarmOutcome {
        self.coordinator.check_liveness();
        let outcome = self.coordinator.finished().await;
        self.shutdown().await;
        outcome
    }

    /// Stop all sources. In-flight writes finish and report before the
    /// remaining assignments are discarded.
    pub async fn cancel(&mut self) -> SwarmOutcome {
        info!(transfer_id = %self.coordinator.transfer_id(), "cancelling swarm");
        self.shutdown().await;
        self.coordinator.finished().await
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("source task ended abnormally: {}", e);
            }
        }
        self.coordinator.cancel();
        if let Err(e) = self.files.sync() {
            warn!("failed to sync output files: {}", e);
        }
    }
}

/// Reports a source that vanished without a clean exit (panic or abort).
struct ExitGuard {
    coordinator: Arc<SwarmCoordinator>,
    id: ConnectionId,
    armed: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.coordinator.failed(self.id, "source task aborted") {
                debug!(id = %self.id, "abort not recorded: {}", e);
            }
        }
    }
}

async fn drive_source<T: SourceTransport>(ctx: SourceContext, id: ConnectionId, mut transport: T) {
    let mut guard = ExitGuard {
        coordinator: ctx.coordinator.clone(),
        id,
        armed: true,
    };
    let result = run_source(&ctx, id, &mut transport).await;
    guard.armed = false;

    // After cancellation the coordinator closes every connection itself.
    if ctx.cancel.is_cancelled() {
        return;
    }
    let reported = match result {
        Ok(()) => ctx.coordinator.closed(id),
        Err(SwarmError::SourceFailed { reason, .. }) => ctx.coordinator.failed(id, reason),
        Err(e) => ctx.coordinator.failed(id, e.to_string()),
    };
    if let Err(e) = reported {
        debug!(%id, "exit not recorded: {}", e);
    }
}

async fn run_source<T: SourceTransport>(ctx: &SourceContext, id: ConnectionId, transport: &mut T) -> Result<()> {
    let coordinator = &ctx.coordinator;
    loop {
        if ctx.cancel.is_cancelled() || coordinator.outcome().is_some() {
            return Ok(());
        }

        // Registered before asking so a release in between is not missed.
        let notified = coordinator.wakeup().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let Some(mut range) = coordinator.became_active(id)? else {
            if !coordinator.can_contribute(id) {
                debug!(%id, "source has nothing left to offer");
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.cancel.cancelled() => return Ok(()),
            }
            continue;
        };

        loop {
            let reply = tokio::select! {
                reply = transport.fetch(range) => reply,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };
            let reply = reply.map_err(|e| SwarmError::SourceFailed {
                id,
                reason: e.to_string(),
            })?;

            match reply {
                FetchReply::Data(bytes) => {
                    if bytes.is_empty() {
                        return Err(SwarmError::SourceFailed {
                            id,
                            reason: format!("empty reply for {}", range),
                        });
                    }
                    let len = (bytes.len() as u64).min(range.len());
                    let offset = range.start();
                    write_chunk(&ctx.files, offset, bytes.slice(..len as usize)).await?;
                    match coordinator.write_completed(id, offset, len)? {
                        Some(next) => range = next,
                        None => break,
                    }
                }
                FetchReply::Queued(info) => {
                    let wait = info.retry_after.unwrap_or(ctx.queue_retry);
                    debug!(%id, position = ?info.position, ?wait, "source queued");
                    coordinator.became_queued(id, info)?;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => break,
                        _ = ctx.cancel.cancelled() => return Ok(()),
                    }
                }
                FetchReply::Exhausted => {
                    debug!(%id, "source exhausted");
                    return Ok(());
                }
            }
        }
    }
}

async fn write_chunk(files: &Arc<FileSet>, offset: u64, data: Bytes) -> Result<()> {
    let files = files.clone();
    tokio::task::spawn_blocking(move || files.write_at(offset, &data))
        .await
        .map_err(|e| SwarmError::Io(std::io::Error::other(e)))?
}
