use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};

use super::Shared;
use crate::{hub::HomeHub, scanner::CapabilitySet, timeline::Command, LightSyncError};

/// A command waiting in a device lane, tagged with the seek generation it
/// was selected under.
#[derive(Debug)]
pub(super) struct Queued {
    pub generation: u64,
    pub command: Command,
}

/// Drains one device's queue in order. Sends are spaced by
/// `min_interval` and bounded by the shared concurrency permits; commands
/// from an older seek generation are discarded unsent.
pub(super) struct Lane {
    pub entity_id: String,
    pub hub: Arc<dyn HomeHub>,
    pub shared: Arc<Shared>,
    pub capabilities: Option<CapabilitySet>,
    pub min_interval: Duration,
    pub dispatch_timeout: Duration,
}

impl Lane {
    pub async fn run(self, mut rx: mpsc::Receiver<Queued>) {
        let token = self.shared.token.clone();
        let stats = &self.shared.stats;
        let mut last_sent: Option<Instant> = None;

        loop {
            let queued = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = rx.recv() => match item {
                    Some(queued) => queued,
                    None => break,
                },
            };

            if self.is_outdated(&queued) {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(capabilities) = &self.capabilities {
                if let Err(err) = queued.command.check_supported(&self.entity_id, capabilities) {
                    tracing::debug!(%err, "dropping unsupported command");
                    stats.unsupported.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if let Some(last) = last_sent {
                let ready_at = last + self.min_interval;
                if ready_at > Instant::now() {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
            }

            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = self.shared.permits.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.is_outdated(&queued) {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let (service, payload) = queued.command.to_service_call(&self.entity_id);
            last_sent = Some(Instant::now());
            let outcome = tokio::time::timeout(
                self.dispatch_timeout,
                self.hub.invoke_service("light", service, payload),
            )
            .await;
            drop(permit);

            if token.is_cancelled() {
                tracing::debug!(entity_id = %self.entity_id, "discarding dispatch result after stop");
                break;
            }
            match outcome {
                Ok(Ok(())) => {
                    stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        entity_id = %self.entity_id,
                        at = queued.command.timestamp_seconds,
                        service,
                        "dispatched"
                    );
                }
                Ok(Err(err)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(entity_id = %self.entity_id, %err, "dispatch failed");
                }
                Err(_) => {
                    stats.timed_out.fetch_add(1, Ordering::Relaxed);
                    let err = LightSyncError::DeviceUnresponsive {
                        entity_id: self.entity_id.clone(),
                        timeout_ms: self.dispatch_timeout.as_millis() as u64,
                    };
                    tracing::warn!(%err, "dispatch timed out");
                }
            }
        }

        tracing::debug!(entity_id = %self.entity_id, "lane closed");
    }

    fn is_outdated(&self, queued: &Queued) -> bool {
        queued.generation != self.shared.generation.load(Ordering::SeqCst)
    }
}
