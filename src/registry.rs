//! The delegation registry: which tunnel and which endpoint currently serve
//! each connection id.
//!
//! The connecting role shards ids over a bounded pool of tunnels per relay,
//! so that many flows share a few physical links. The accepting role keys
//! every id to the tunnel that announced it.
//!
//! Binding rules for an id that is already bound:
//!
//! * on a different tunnel, registration fails and the existing binding
//!   stays;
//! * on the same tunnel with a different endpoint, the old endpoint is
//!   evicted and handed back to the caller to close;
//! * the same tunnel and endpoint again is a no-op.
use std::{collections::HashMap, net::SocketAddr};

use mio::Token;
use tracing::{debug, info};

use crate::{
    config::Role,
    endpoint::EndpointKind,
    error::RegistryError,
    frame::ConnectionId,
    tunnel::{Tunnel, TunnelId},
};

/// Where the registry looks up the tunnel serving an id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShardKey {
    /// One slot of the tunnel pool towards `relay`.
    Pool {
        /// The relay the pool connects to.
        relay: SocketAddr,
        /// The id modulo the pool size.
        slot: u32,
    },
    /// The id itself.
    Connection(ConnectionId),
}

/// A connection's real-world side, tagged with its id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogicalEndpoint {
    /// The id of the flow.
    pub id: ConnectionId,
    /// The endpoint serving it. Several flows may share one endpoint.
    pub token: Token,
    /// What the endpoint wraps.
    pub kind: EndpointKind,
    /// The tunnel carrying the flow.
    pub tunnel: TunnelId,
    /// Where payloads for this flow are sent on a shared datagram endpoint.
    pub reply_to: Option<SocketAddr>,
    /// The peer already closed the flow; no close is echoed back.
    pub closed_by_peer: bool,
}

impl LogicalEndpoint {
    /// A flow served by `token`, not yet bound to a tunnel.
    pub fn new(id: ConnectionId, token: Token, kind: EndpointKind, tunnel: TunnelId) -> Self {
        Self {
            id,
            token,
            kind,
            tunnel,
            reply_to: None,
            closed_by_peer: false,
        }
    }

    /// Replies for this flow go to `addr`.
    pub fn with_reply_to(mut self, addr: SocketAddr) -> Self {
        self.reply_to = Some(addr);
        self
    }
}

/// The process-wide routing table.
#[derive(Debug)]
pub struct Registry {
    pool_size: Option<u32>,
    tunnels: HashMap<TunnelId, Tunnel>,
    shards: HashMap<ShardKey, TunnelId>,
    endpoints: HashMap<ConnectionId, LogicalEndpoint>,
}

impl Registry {
    /// An empty registry for `role`.
    pub fn new(role: &Role) -> Self {
        let pool_size = match role {
            Role::Connect { pool_size } => Some((*pool_size).max(1)),
            Role::Accept { .. } => None,
        };
        Self {
            pool_size,
            tunnels: HashMap::new(),
            shards: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    /// The shard of `id` for a tunnel towards `relay`.
    ///
    /// Ids are pooled only on the connecting role and only for tunnels that
    /// originate the link.
    pub fn shard_key(&self, id: ConnectionId, relay: Option<SocketAddr>) -> ShardKey {
        match (self.pool_size, relay) {
            (Some(pool_size), Some(relay)) => ShardKey::Pool {
                relay,
                slot: (id.as_u128() % u128::from(pool_size)) as u32,
            },
            _ => ShardKey::Connection(id),
        }
    }

    /// Starts tracking a tunnel.
    pub fn add_tunnel(&mut self, tunnel: Tunnel) {
        info!(tunnel = %tunnel.id(), relay = ?tunnel.relay(), "tunnel added");
        self.tunnels.insert(tunnel.id(), tunnel);
    }

    /// The tunnel with this id.
    pub fn tunnel(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(&id)
    }

    /// The tunnel with this id.
    pub fn tunnel_mut(&mut self, id: TunnelId) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(&id)
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// The tunnel that serves, or would serve, `id` towards `relay`.
    pub fn tunnel_for(&self, id: ConnectionId, relay: Option<SocketAddr>) -> Option<TunnelId> {
        let key = self.shard_key(id, relay);
        self.shards
            .get(&key)
            .copied()
            .filter(|tunnel| self.tunnels.contains_key(tunnel))
    }

    /// Binds `endpoint.id` to `endpoint.tunnel` and `endpoint.token`.
    ///
    /// Returns the endpoint evicted by this binding, which the caller
    /// closes.
    pub fn register(
        &mut self,
        endpoint: LogicalEndpoint,
    ) -> Result<Option<LogicalEndpoint>, RegistryError> {
        let id = endpoint.id;
        let tunnel_id = endpoint.tunnel;
        let Some(tunnel) = self.tunnels.get(&tunnel_id) else {
            return Err(RegistryError::UnknownTunnel);
        };
        let key = self.shard_key(id, tunnel.relay());

        if let Some(existing) = self.endpoints.get(&id) {
            if existing.tunnel != tunnel_id {
                return Err(RegistryError::ConflictingTunnel);
            }
            if existing.token == endpoint.token {
                return Ok(None);
            }
        }
        if let Some(owner) = self.shards.get(&key) {
            if *owner != tunnel_id && self.tunnels.contains_key(owner) {
                return Err(RegistryError::ShardConflict);
            }
        }

        let Some(tunnel) = self.tunnels.get_mut(&tunnel_id) else {
            return Err(RegistryError::UnknownTunnel);
        };
        let evicted = match self.endpoints.remove(&id) {
            Some(old) => {
                debug!(%id, old = old.token.0, new = endpoint.token.0, "evicting endpoint");
                tunnel.rebind(id, endpoint.token);
                Some(old)
            }
            None => {
                tunnel.register(id, endpoint.token)?;
                None
            }
        };
        self.shards.insert(key, tunnel_id);
        self.endpoints.insert(id, endpoint);
        Ok(evicted)
    }

    /// Unbinds `id` everywhere.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<LogicalEndpoint> {
        let endpoint = self.endpoints.remove(&id)?;
        if let Some(tunnel) = self.tunnels.get_mut(&endpoint.tunnel) {
            tunnel.deregister(id);
        }
        self.shards.remove(&ShardKey::Connection(id));
        Some(endpoint)
    }

    /// The endpoint bound to `id`.
    ///
    /// The lookup goes through the shard's tunnel when it is known; the
    /// tunnel's own connections are authoritative.
    pub fn query_endpoint(&self, id: ConnectionId) -> Option<&LogicalEndpoint> {
        let endpoint = self.endpoints.get(&id)?;
        match self.tunnels.get(&endpoint.tunnel) {
            Some(tunnel) if tunnel.get_connection(id) == Some(endpoint.token) => Some(endpoint),
            Some(_) => None,
            None => Some(endpoint),
        }
    }

    /// The endpoint bound to `id`.
    pub fn query_endpoint_mut(&mut self, id: ConnectionId) -> Option<&mut LogicalEndpoint> {
        self.endpoints.get_mut(&id)
    }

    /// The flows served by the endpoint `token`.
    pub fn served_by(&self, token: Token) -> Vec<ConnectionId> {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.token == token)
            .map(|endpoint| endpoint.id)
            .collect()
    }

    /// The endpoints bound to `tunnel`.
    pub fn connections_of(&self, tunnel: TunnelId) -> Vec<Token> {
        self.tunnels
            .get(&tunnel)
            .map(|tunnel| tunnel.connections().map(|(_, token)| token).collect())
            .unwrap_or_default()
    }

    /// Forgets a tunnel whose physical endpoint closed.
    ///
    /// Every endpoint still bound to it is unbound and returned, so the
    /// caller can notify it.
    pub fn on_tunnel_closed(&mut self, id: TunnelId) -> Vec<LogicalEndpoint> {
        let Some(mut tunnel) = self.tunnels.remove(&id) else {
            return Vec::new();
        };
        self.shards.retain(|_, owner| *owner != id);
        let orphans: Vec<LogicalEndpoint> = tunnel
            .clear_connections()
            .into_iter()
            .filter_map(|(conn, _)| self.endpoints.remove(&conn))
            .collect();
        info!(tunnel = %id, orphans = orphans.len(), "tunnel removed");
        orphans
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn relay() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    fn id(n: u128) -> ConnectionId {
        ConnectionId::from_bytes(n.to_be_bytes())
    }

    fn logical(id: ConnectionId, token: usize, tunnel: TunnelId) -> LogicalEndpoint {
        LogicalEndpoint::new(id, Token(token), EndpointKind::Stream, tunnel)
    }

    fn accepting() -> (Registry, TunnelId, TunnelId) {
        let mut registry = Registry::new(&Role::Accept { fallback: None });
        let (t1, t2) = (TunnelId(Token(1)), TunnelId(Token(2)));
        registry.add_tunnel(Tunnel::accepted(t1));
        registry.add_tunnel(Tunnel::accepted(t2));
        (registry, t1, t2)
    }

    #[test]
    fn test_conflicting_tunnel_keeps_binding() {
        let (mut registry, t1, t2) = accepting();
        let u = id(5);
        assert_eq!(registry.register(logical(u, 10, t1)), Ok(None));
        assert_eq!(
            registry.register(logical(u, 11, t2)),
            Err(RegistryError::ConflictingTunnel)
        );
        let bound = registry.query_endpoint(u).unwrap();
        assert_eq!((bound.token, bound.tunnel), (Token(10), t1));
        assert_eq!(registry.tunnel(t2).unwrap().get_connection(u), None);
    }

    #[test]
    fn test_same_tunnel_evicts_old_endpoint() {
        let (mut registry, t1, _) = accepting();
        let u = id(5);
        registry.register(logical(u, 10, t1)).unwrap();
        // The same pair again is a no-op.
        assert_eq!(registry.register(logical(u, 10, t1)), Ok(None));

        let evicted = registry.register(logical(u, 12, t1)).unwrap().unwrap();
        assert_eq!(evicted.token, Token(10));
        assert_eq!(registry.query_endpoint(u).unwrap().token, Token(12));
        assert_eq!(registry.tunnel(t1).unwrap().get_connection(u), Some(Token(12)));
    }

    #[test]
    fn test_unknown_tunnel() {
        let mut registry = Registry::new(&Role::connect());
        assert_eq!(
            registry.register(logical(id(1), 1, TunnelId(Token(9)))),
            Err(RegistryError::UnknownTunnel)
        );
    }

    #[test]
    fn test_connect_role_shards_by_pool_slot() {
        let mut registry = Registry::new(&Role::Connect { pool_size: 4 });
        let t1 = TunnelId(Token(1));
        let t2 = TunnelId(Token(2));
        registry.add_tunnel(Tunnel::connecting(t1, relay()));
        registry.add_tunnel(Tunnel::connecting(t2, relay()));

        assert_eq!(registry.tunnel_for(id(1), Some(relay())), None);
        registry.register(logical(id(1), 10, t1)).unwrap();
        // 5 % 4 == 1 % 4: same slot, same tunnel.
        assert_eq!(registry.tunnel_for(id(5), Some(relay())), Some(t1));
        assert_eq!(registry.tunnel_for(id(2), Some(relay())), None);
        assert_eq!(
            registry.register(logical(id(5), 11, t2)),
            Err(RegistryError::ShardConflict)
        );
        registry.register(logical(id(5), 11, t1)).unwrap();
        assert_eq!(registry.connections_of(t1).len(), 2);
        let mut served = registry.served_by(Token(11));
        served.sort();
        assert_eq!(served, vec![id(5)]);

        // Another relay has its own pool.
        let other = SocketAddr::from(([127, 0, 0, 1], 7001));
        assert_eq!(registry.tunnel_for(id(1), Some(other)), None);
    }

    #[test]
    fn test_accept_role_keys_by_id() {
        let (mut registry, t1, t2) = accepting();
        registry.register(logical(id(1), 10, t1)).unwrap();
        registry.register(logical(id(2), 11, t2)).unwrap();
        assert_eq!(registry.tunnel_for(id(1), None), Some(t1));
        assert_eq!(registry.tunnel_for(id(2), None), Some(t2));

        let removed = registry.deregister(id(1)).unwrap();
        assert_eq!(removed.token, Token(10));
        assert_eq!(registry.tunnel_for(id(1), None), None);
        assert!(registry.query_endpoint(id(1)).is_none());
        // Rebinding on another tunnel is fine once unbound.
        registry.register(logical(id(1), 12, t2)).unwrap();
    }

    #[test]
    fn test_tunnel_closed_returns_orphans() {
        let (mut registry, t1, t2) = accepting();
        registry.register(logical(id(1), 10, t1)).unwrap();
        registry.register(logical(id(2), 11, t1)).unwrap();
        registry.register(logical(id(3), 12, t2)).unwrap();

        let mut orphans: Vec<Token> = registry
            .on_tunnel_closed(t1)
            .into_iter()
            .map(|e| e.token)
            .collect();
        orphans.sort();
        assert_eq!(orphans, vec![Token(10), Token(11)]);
        assert!(registry.tunnel(t1).is_none());
        assert!(registry.query_endpoint(id(1)).is_none());
        assert_eq!(registry.query_endpoint(id(3)).unwrap().token, Token(12));
        assert!(registry.on_tunnel_closed(t1).is_empty());
    }
}
