use std::sync::Arc;

use aura_core::Envelope;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::registry::{PoolKind, Registry};

pub const DEFAULT_STATS_ATTEMPTS: usize = 3;

/// Result of a single `announce` pass over the clients pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceOutcome {
    pub delivered: usize,
    pub purged: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempts: usize,
    pub delivered: usize,
    pub purged: usize,
    /// False when every attempt saw at least one failed send.
    pub settled: bool,
}

/// Pushes pool sizes to every connected client.
pub struct StatsBroadcaster {
    registry: Arc<Registry>,
    max_attempts: usize,
    // Serializes read-sizes-then-send attempts so a later count is never
    // overtaken by an earlier one. Taken before any pool lock.
    round: Mutex<()>,
}

impl StatsBroadcaster {
    pub fn new(registry: Arc<Registry>, max_attempts: usize) -> Self {
        Self {
            registry,
            max_attempts: max_attempts.max(1),
            round: Mutex::new(()),
        }
    }

    /// Sends `{action: <pool>, data: <count>}` to a snapshot of the clients
    /// pool. Clients whose send fails are purged from the live registry.
    pub fn announce(&self, pool: PoolKind, count: usize) -> AnnounceOutcome {
        let mut outcome = AnnounceOutcome::default();
        let frame = match Envelope::stat(pool.stat_action(), count).encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, pool = %pool, "failed to encode stats envelope");
                return outcome;
            }
        };

        for (tag, handle) in self.registry.snapshot(PoolKind::Clients) {
            match handle.send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    if let Some(stale) = self.registry.unregister(PoolKind::Clients, &tag) {
                        stale.evict();
                        counter!("aura_purges_total", 1, "pool" => PoolKind::Clients.as_str());
                    }
                    warn!(
                        tag = %tag,
                        remote_addr = handle.remote_addr(),
                        error = %err,
                        "dropping client that missed a stats update"
                    );
                    outcome.purged += 1;
                }
            }
        }

        outcome
    }

    /// Announces both pool sizes, retrying the pair while any send failed.
    /// Gives up quietly once the attempt budget is spent.
    pub fn broadcast_stats(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        while report.attempts < self.max_attempts {
            report.attempts += 1;
            if report.attempts > 1 {
                counter!("aura_stats_broadcast_retries_total", 1);
            }

            let (clients, providers) = {
                let _round = self.round.lock();
                let clients = self
                    .announce(PoolKind::Clients, self.registry.size(PoolKind::Clients));
                let providers = self
                    .announce(PoolKind::Providers, self.registry.size(PoolKind::Providers));
                (clients, providers)
            };

            report.delivered += clients.delivered + providers.delivered;
            report.purged += clients.purged + providers.purged;

            if clients.purged == 0 && providers.purged == 0 {
                report.settled = true;
                break;
            }
        }

        if !report.settled {
            debug!(
                attempts = report.attempts,
                purged = report.purged,
                "stats broadcast abandoned after retries"
            );
        }

        report
    }
}
