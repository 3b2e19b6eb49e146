use std::sync::Arc;

use aura_core::Envelope;
use metrics::counter;
use tracing::info;

use crate::{
    broadcast::{StatsBroadcaster, DEFAULT_STATS_ATTEMPTS},
    connection::{ConnectionHandle, OutboundReceiver},
    registry::{PoolKind, PoolSizes, Registry, Tag},
    router::{RouteOutcome, Router},
};

pub const DEFAULT_CONNECTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Frames queued per connection before it counts as a slow consumer.
    pub per_connection_buffer: usize,
    pub stats_attempts: usize,
    /// Fixes the registry's random source (tags and provider picks).
    pub rng_seed: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CONNECTION_BUFFER,
            stats_attempts: DEFAULT_STATS_ATTEMPTS,
            rng_seed: None,
        }
    }
}

/// A registered connection as seen by its handler.
pub struct Attachment {
    pub tag: Tag,
    pub handle: ConnectionHandle,
    pub outbound: OutboundReceiver,
}

/// Registry, router and stats broadcaster wired together. Every registry
/// mutation made through the broker is followed by a stats broadcast.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<Registry>,
    router: Router,
    broadcaster: Arc<StatsBroadcaster>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(Registry::new(config.rng_seed));
        let broadcaster = Arc::new(StatsBroadcaster::new(
            Arc::clone(&registry),
            config.stats_attempts,
        ));
        let router = Router::new(Arc::clone(&registry), Arc::clone(&broadcaster));
        Self {
            config,
            registry,
            router,
            broadcaster,
        }
    }

    pub fn sizes(&self) -> PoolSizes {
        self.registry.sizes()
    }

    /// Registers a freshly accepted connection and announces the new sizes.
    pub fn attach(&self, pool: PoolKind, remote_addr: impl Into<String>) -> Attachment {
        let (handle, outbound) =
            ConnectionHandle::channel(remote_addr, self.config.per_connection_buffer);
        let tag = self.registry.register(pool, handle.clone());
        counter!("aura_connections_total", 1, "pool" => pool.as_str());
        info!(
            pool = %pool,
            tag = %tag,
            remote_addr = handle.remote_addr(),
            members = self.registry.size(pool),
            "connection registered"
        );
        self.broadcaster.broadcast_stats();
        Attachment {
            tag,
            handle,
            outbound,
        }
    }

    /// Removes `tag` if it is still registered. Returns whether anything was
    /// removed; only an actual removal triggers a stats broadcast.
    pub fn detach(&self, pool: PoolKind, tag: &str) -> bool {
        match self.registry.unregister(pool, tag) {
            Some(_) => {
                info!(
                    pool = %pool,
                    tag,
                    members = self.registry.size(pool),
                    "connection unregistered"
                );
                self.broadcaster.broadcast_stats();
                true
            }
            None => false,
        }
    }

    pub fn dispatch(&self, origin: PoolKind, origin_tag: &str, envelope: Envelope) -> RouteOutcome {
        self.router.route(origin, origin_tag, envelope)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
