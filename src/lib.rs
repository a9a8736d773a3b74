use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use ahash::RandomState;
use bon::Builder;
use dashmap::DashMap;

pub mod alias;
pub mod balancer;
pub mod config;
pub mod connection;
mod droppable_handle;
mod error;
pub mod relay;
pub mod tcp_alias;

pub use alias::{
    AliasConnection, AliasHolder, AliasRegistration, ForwardRequest, alias_connection,
    register_alias_listener, remove_backend,
};
pub use config::ApplicationConfig;
pub use connection::{Session, SessionTransport};
pub use droppable_handle::DroppableHandle;
pub use error::ServerError;
pub use relay::{IdleTimeoutStream, RelaySettings, copy_both};
pub use tcp_alias::TcpAlias;

use crate::balancer::{BalancerFactory, RoundRobinFactory};

// Process-wide registries tying sessions and aliases together. Mutated by
// session accept/cleanup and alias registration; lives for the whole
// process.
#[derive(Builder)]
pub struct ServerState {
    // Typed configuration for the core.
    pub config: ApplicationConfig,
    // Factory for the per-alias balancers.
    #[builder(default = Arc::new(RoundRobinFactory))]
    pub(crate) balancer_factory: Arc<dyn BalancerFactory>,
    // Active sessions, keyed by remote address.
    #[builder(skip = DashMap::default())]
    pub(crate) sessions: DashMap<SocketAddr, Arc<Session>, RandomState>,
    // Alias holders, keyed by alias identity.
    #[builder(skip = DashMap::default())]
    pub(crate) aliases: DashMap<TcpAlias, Arc<AliasHolder>, RandomState>,
}

impl ServerState {
    // Create the session state for a freshly authenticated connection and
    // register it. The returned receiver feeds the client's console channel.
    pub fn open_session(
        &self,
        transport: Arc<dyn SessionTransport>,
        proxy_protocol: u8,
    ) -> (Arc<Session>, tokio::sync::mpsc::Receiver<String>) {
        let (session, rx) = Session::open(transport, proxy_protocol, self.config.message_queue_size);
        self.add_session(Arc::clone(&session));
        (session, rx)
    }

    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.peer(), session);
    }

    pub fn session(&self, peer: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions
            .get(peer)
            .map(|session| Arc::clone(session.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn alias_holder(&self, alias: &TcpAlias) -> Option<Arc<AliasHolder>> {
        self.aliases
            .get(alias)
            .map(|holder| Arc::clone(holder.value()))
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    // Snapshot of the alias registry: alias to backend addresses and the
    // users serving them.
    pub fn alias_data(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.aliases
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().backend_data()))
            .collect()
    }
}
