//! Tag-based routing between the clients and providers pools.
//!
//! Every routed envelope is encoded once and queued on the destination
//! handle with a non-blocking send. A failed send purges the destination
//! from the registry and triggers a stats rebroadcast. Requests are never
//! retried against a second provider.

use std::sync::Arc;

use aura_core::{Action, Envelope};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    broadcast::StatsBroadcaster,
    registry::{PoolKind, Registry, Tag},
};

pub const NO_PROVIDERS: &str = "No providers available";
pub const PROVIDER_DISCONNECTED: &str = "Provider disconnected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Client request queued on a single provider.
    Forwarded { provider: Tag },
    /// Providers pool was empty; the client got an error envelope.
    NoProviders,
    /// Selected provider failed the send and was purged.
    ProviderGone { provider: Tag },
    /// `identify` delivered to every live provider.
    FannedOut { delivered: usize, purged: usize },
    /// Provider reply queued on the addressed client.
    Delivered { client: Tag },
    /// Addressed client is no longer registered.
    ClientGone { client: Tag },
    /// Addressed client failed the send and was purged.
    ClientPurged { client: Tag },
    /// Provider envelope without a tag; nowhere to send it.
    Untagged,
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Forwarded { .. } => "forwarded",
            RouteOutcome::NoProviders => "no_providers",
            RouteOutcome::ProviderGone { .. } => "provider_gone",
            RouteOutcome::FannedOut { .. } => "fanned_out",
            RouteOutcome::Delivered { .. } => "delivered",
            RouteOutcome::ClientGone { .. } => "client_gone",
            RouteOutcome::ClientPurged { .. } => "client_purged",
            RouteOutcome::Untagged => "untagged",
        }
    }
}

pub struct Router {
    registry: Arc<Registry>,
    broadcaster: Arc<StatsBroadcaster>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, broadcaster: Arc<StatsBroadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
        }
    }

    /// Routes an envelope that arrived on the connection registered as
    /// `origin_tag` in the `origin` pool.
    pub fn route(&self, origin: PoolKind, origin_tag: &str, envelope: Envelope) -> RouteOutcome {
        let outcome = match origin {
            PoolKind::Clients => self.route_from_client(origin_tag, envelope),
            PoolKind::Providers => self.route_from_provider(envelope),
        };
        counter!("aura_routes_total", 1, "outcome" => outcome.label());
        outcome
    }

    fn route_from_client(&self, client_tag: &str, envelope: Envelope) -> RouteOutcome {
        let envelope = envelope.with_tag(client_tag);
        if envelope.action == Action::Identify {
            return self.fan_out(envelope);
        }

        let Some((provider_tag, provider)) = self.registry.random_member(PoolKind::Providers)
        else {
            debug!(tag = client_tag, "no provider for client request");
            self.reply_to_client(client_tag, Envelope::error(NO_PROVIDERS));
            return RouteOutcome::NoProviders;
        };

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                // Treated like an unreachable provider; the request cannot go anywhere.
                warn!(tag = client_tag, error = %err, "failed to encode client request");
                self.reply_to_client(client_tag, Envelope::error(PROVIDER_DISCONNECTED));
                return RouteOutcome::ProviderGone {
                    provider: provider_tag,
                };
            }
        };

        match provider.send(frame) {
            Ok(()) => {
                debug!(
                    tag = client_tag,
                    provider = %provider_tag,
                    action = %envelope.action,
                    "forwarded client request"
                );
                RouteOutcome::Forwarded {
                    provider: provider_tag,
                }
            }
            Err(err) => {
                warn!(
                    provider = %provider_tag,
                    remote_addr = provider.remote_addr(),
                    error = %err,
                    "provider send failed"
                );
                self.purge(PoolKind::Providers, &provider_tag);
                self.reply_to_client(client_tag, Envelope::error(PROVIDER_DISCONNECTED));
                RouteOutcome::ProviderGone {
                    provider: provider_tag,
                }
            }
        }
    }

    fn fan_out(&self, envelope: Envelope) -> RouteOutcome {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode identify request");
                return RouteOutcome::FannedOut {
                    delivered: 0,
                    purged: 0,
                };
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (tag, provider) in self.registry.snapshot(PoolKind::Providers) {
            match provider.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(provider = %tag, error = %err, "provider missed identify");
                    dead.push(tag);
                }
            }
        }

        let purged = dead.len();
        if purged > 0 {
            for tag in &dead {
                self.remove(PoolKind::Providers, tag);
            }
            self.broadcaster.broadcast_stats();
        }

        RouteOutcome::FannedOut { delivered, purged }
    }

    fn route_from_provider(&self, envelope: Envelope) -> RouteOutcome {
        let Some(client_tag) = envelope.tag().map(str::to_owned) else {
            debug!(action = %envelope.action, "dropping untagged provider envelope");
            return RouteOutcome::Untagged;
        };

        let Some(client) = self.registry.lookup(PoolKind::Clients, &client_tag) else {
            debug!(tag = %client_tag, "client left before its reply arrived");
            return RouteOutcome::ClientGone { client: client_tag };
        };

        // The tag is implicit to the client connection.
        let frame = match envelope.without_tag().encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(tag = %client_tag, error = %err, "failed to encode provider reply");
                return RouteOutcome::ClientGone { client: client_tag };
            }
        };

        match client.send(frame) {
            Ok(()) => RouteOutcome::Delivered { client: client_tag },
            Err(err) => {
                warn!(
                    tag = %client_tag,
                    remote_addr = client.remote_addr(),
                    error = %err,
                    "client send failed"
                );
                self.purge(PoolKind::Clients, &client_tag);
                RouteOutcome::ClientPurged { client: client_tag }
            }
        }
    }

    /// Best-effort synthetic reply to the originating client.
    fn reply_to_client(&self, client_tag: &str, envelope: Envelope) {
        let Some(client) = self.registry.lookup(PoolKind::Clients, client_tag) else {
            return;
        };
        let sent = envelope
            .encode()
            .map_err(|err| err.to_string())
            .and_then(|frame| client.send(frame).map_err(|err| err.to_string()));
        if let Err(err) = sent {
            warn!(tag = client_tag, error = %err, "failed to reply to client");
            self.purge(PoolKind::Clients, client_tag);
        }
    }

    fn purge(&self, pool: PoolKind, tag: &str) {
        if self.remove(pool, tag) {
            self.broadcaster.broadcast_stats();
        }
    }

    fn remove(&self, pool: PoolKind, tag: &str) -> bool {
        match self.registry.unregister(pool, tag) {
            Some(handle) => {
                handle.evict();
                counter!("aura_purges_total", 1, "pool" => pool.as_str());
                info!(
                    pool = %pool,
                    tag,
                    remote_addr = handle.remote_addr(),
                    "purged unreachable connection"
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, OutboundReceiver};
    use aura_core::GenerateRequest;

    struct Fixture {
        registry: Arc<Registry>,
        router: Router,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(Registry::new(Some(1)));
            let broadcaster = Arc::new(StatsBroadcaster::new(Arc::clone(&registry), 3));
            let router = Router::new(Arc::clone(&registry), broadcaster);
            Self { registry, router }
        }

        fn join(&self, pool: PoolKind) -> (Tag, ConnectionHandle, OutboundReceiver) {
            let (handle, rx) = ConnectionHandle::channel("127.0.0.1:4000", 16);
            let tag = self.registry.register(pool, handle.clone());
            (tag, handle, rx)
        }
    }

    /// Envelopes queued on `rx`, ignoring pool-size announcements.
    fn routed(rx: &mut OutboundReceiver) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let envelope = Envelope::decode(frame).unwrap();
            if !matches!(envelope.action, Action::Clients | Action::Providers) {
                out.push(envelope);
            }
        }
        out
    }

    fn generate() -> Envelope {
        Envelope::generate(GenerateRequest::new("m", "p"))
    }

    #[test]
    fn empty_provider_pool_yields_single_error() {
        let fx = Fixture::new();
        let (client_tag, _, mut client_rx) = fx.join(PoolKind::Clients);

        let outcome = fx.router.route(PoolKind::Clients, &client_tag, generate());

        assert_eq!(outcome, RouteOutcome::NoProviders);
        assert_eq!(routed(&mut client_rx), vec![Envelope::error(NO_PROVIDERS)]);
    }

    #[test]
    fn client_request_is_stamped_with_client_tag() {
        let fx = Fixture::new();
        let (client_tag, _, _client_rx) = fx.join(PoolKind::Clients);
        let (provider_tag, _, mut provider_rx) = fx.join(PoolKind::Providers);

        let spoofed = generate().with_tag("someone-else");
        let outcome = fx.router.route(PoolKind::Clients, &client_tag, spoofed);

        assert_eq!(
            outcome,
            RouteOutcome::Forwarded {
                provider: provider_tag
            }
        );
        let received = routed(&mut provider_rx);
        assert_eq!(received, vec![generate().with_tag(client_tag)]);
    }

    #[test]
    fn dead_provider_is_purged_without_failover() {
        let fx = Fixture::new();
        let (client_tag, _, mut client_rx) = fx.join(PoolKind::Clients);
        let (provider_tag, provider, provider_rx) = fx.join(PoolKind::Providers);
        drop(provider_rx);

        let outcome = fx.router.route(PoolKind::Clients, &client_tag, generate());

        assert_eq!(
            outcome,
            RouteOutcome::ProviderGone {
                provider: provider_tag.clone()
            }
        );
        assert!(provider.is_evicted());
        assert!(fx.registry.lookup(PoolKind::Providers, &provider_tag).is_none());
        assert_eq!(
            routed(&mut client_rx),
            vec![Envelope::error(PROVIDER_DISCONNECTED)]
        );
    }

    #[test]
    fn identify_reaches_every_live_provider_and_purges_dead_ones() {
        let fx = Fixture::new();
        let (client_tag, _, mut client_rx) = fx.join(PoolKind::Clients);
        let (_, _, mut first) = fx.join(PoolKind::Providers);
        let (dead_tag, _, dead_rx) = fx.join(PoolKind::Providers);
        let (_, _, mut third) = fx.join(PoolKind::Providers);
        drop(dead_rx);

        let identify = Envelope::new(Action::Identify, "");
        let outcome = fx.router.route(PoolKind::Clients, &client_tag, identify.clone());

        assert_eq!(
            outcome,
            RouteOutcome::FannedOut {
                delivered: 2,
                purged: 1
            }
        );
        let expected = vec![identify.with_tag(client_tag)];
        assert_eq!(routed(&mut first), expected);
        assert_eq!(routed(&mut third), expected);
        assert!(fx.registry.lookup(PoolKind::Providers, &dead_tag).is_none());
        assert!(routed(&mut client_rx).is_empty());
    }

    #[test]
    fn provider_reply_reaches_only_the_tagged_client_without_tag() {
        let fx = Fixture::new();
        let (target, _, mut target_rx) = fx.join(PoolKind::Clients);
        let (_, _, mut bystander_rx) = fx.join(PoolKind::Clients);
        let (provider_tag, _, _provider_rx) = fx.join(PoolKind::Providers);

        let reply = Envelope::new(Action::Response, "chunk").with_tag(target.clone());
        let outcome = fx.router.route(PoolKind::Providers, &provider_tag, reply);

        assert_eq!(outcome, RouteOutcome::Delivered { client: target });
        assert_eq!(
            routed(&mut target_rx),
            vec![Envelope::new(Action::Response, "chunk")]
        );
        assert!(routed(&mut bystander_rx).is_empty());
    }

    #[test]
    fn provider_reply_for_departed_client_is_dropped() {
        let fx = Fixture::new();
        let (provider_tag, _, _provider_rx) = fx.join(PoolKind::Providers);

        let reply = Envelope::new(Action::ResponseEnd, "").with_tag("gone");
        assert_eq!(
            fx.router.route(PoolKind::Providers, &provider_tag, reply),
            RouteOutcome::ClientGone {
                client: "gone".into()
            }
        );

        let untagged = Envelope::new(Action::Response, "lost");
        assert_eq!(
            fx.router.route(PoolKind::Providers, &provider_tag, untagged),
            RouteOutcome::Untagged
        );
    }

    #[test]
    fn failed_client_delivery_purges_client_and_rebroadcasts() {
        let fx = Fixture::new();
        let (dead, dead_handle, dead_rx) = fx.join(PoolKind::Clients);
        let (_, _, mut observer_rx) = fx.join(PoolKind::Clients);
        let (provider_tag, _, _provider_rx) = fx.join(PoolKind::Providers);
        drop(dead_rx);

        let reply = Envelope::new(Action::Response, "x").with_tag(dead.clone());
        let outcome = fx.router.route(PoolKind::Providers, &provider_tag, reply);

        assert_eq!(outcome, RouteOutcome::ClientPurged { client: dead });
        assert!(dead_handle.is_evicted());
        let mut stats = Vec::new();
        while let Ok(frame) = observer_rx.try_recv() {
            stats.push(Envelope::decode(frame).unwrap());
        }
        assert_eq!(
            stats,
            vec![
                Envelope::stat(Action::Clients, 1),
                Envelope::stat(Action::Providers, 1)
            ]
        );
    }

    #[test]
    fn replies_from_one_provider_keep_their_order() {
        let fx = Fixture::new();
        let (client_tag, _, mut client_rx) = fx.join(PoolKind::Clients);
        let (provider_tag, _, _provider_rx) = fx.join(PoolKind::Providers);

        let stream = [
            Envelope::new(Action::Response, "a"),
            Envelope::new(Action::Response, "b"),
            Envelope::new(Action::ResponseEnd, ""),
        ];
        for envelope in stream.iter().cloned() {
            fx.router.route(
                PoolKind::Providers,
                &provider_tag,
                envelope.with_tag(client_tag.clone()),
            );
        }

        assert_eq!(routed(&mut client_rx), stream.to_vec());
    }

    #[test]
    fn stop_and_ping_are_forwarded_like_any_request() {
        let fx = Fixture::new();
        let (client_tag, _, _client_rx) = fx.join(PoolKind::Clients);
        let (_, _, mut provider_rx) = fx.join(PoolKind::Providers);

        for action in [Action::Stop, Action::Ping] {
            let outcome = fx
                .router
                .route(PoolKind::Clients, &client_tag, Envelope::new(action, ""));
            assert!(matches!(outcome, RouteOutcome::Forwarded { .. }));
        }
        let actions: Vec<_> = routed(&mut provider_rx)
            .into_iter()
            .map(|envelope| envelope.action)
            .collect();
        assert_eq!(actions, vec![Action::Stop, Action::Ping]);
    }
}
