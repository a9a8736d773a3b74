use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use ahash::RandomState;
use color_eyre::eyre::WrapErr;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::{
    ServerState,
    balancer::{Balancer, BackendUrl},
    connection::Session,
    error::ServerError,
    tcp_alias::TcpAlias,
};

// Console tag prepended to alias forwarding notices.
const ALIAS_NOTICE_TAG: &str = "\x1b[44mTCP Alias\x1b[0m";

// An already-parsed TCP alias forwarding request.
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub address: String,
    pub port: u16,
}

// A shared, load-balanced alias endpoint. Independent sessions register
// their listener addresses here and the balancer spreads incoming
// connections across them.
pub struct AliasHolder {
    // Alias identity served by this holder.
    alias: TcpAlias,
    // Backend address to owning session. Routing references only; each
    // session keeps ownership of its listeners.
    backends: DashMap<String, Weak<Session>, RandomState>,
    // Balancer holding the registered backend URLs.
    balancer: Box<dyn Balancer>,
}

impl AliasHolder {
    fn new(alias: TcpAlias, balancer: Box<dyn Balancer>) -> Self {
        AliasHolder {
            alias,
            backends: DashMap::default(),
            balancer,
        }
    }

    pub fn alias(&self) -> &TcpAlias {
        &self.alias
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    // Session serving the given backend address, if it is still alive.
    pub fn session_for(&self, address: &str) -> Option<Arc<Session>> {
        self.backends
            .get(address)
            .and_then(|session| session.upgrade())
    }

    pub(crate) fn backend_data(&self) -> std::collections::BTreeMap<String, String> {
        self.backends
            .iter()
            .map(|entry| {
                let user = entry
                    .value()
                    .upgrade()
                    .map(|session| session.user())
                    .unwrap_or_default();
                (entry.key().clone(), user)
            })
            .collect()
    }
}

// Successful registration of one backend under an alias.
pub struct AliasRegistration {
    pub holder: Arc<AliasHolder>,
    pub backend_url: BackendUrl,
    pub alias: TcpAlias,
    pub notice_text: String,
}

// Register a session's listener as a backend for the requested alias.
//
// The holder for the alias identity is created on first registration and
// shared by every later one; the get-or-create happens under the registry's
// entry lock, so concurrent registrations for a new alias all land in the
// same holder, and a failed balancer construction leaves no trace in the
// global state. A backend the balancer rejects stays recorded in the holder;
// the rejection is logged and registration proceeds.
pub fn register_alias_listener(
    request: &ForwardRequest,
    listener_address: SocketAddr,
    notice_text: String,
    state: &ServerState,
    session: &Arc<Session>,
) -> color_eyre::Result<AliasRegistration> {
    let alias = TcpAlias(request.address.clone(), request.port);
    let backend_address = listener_address.to_string();
    let backend_url = BackendUrl::encode(&backend_address);
    let register_backend = |holder: &AliasHolder| {
        holder
            .backends
            .insert(backend_address.clone(), Arc::downgrade(session));
        if let Err(error) = holder.balancer.upsert_server(backend_url.clone()) {
            warn!(%alias, %error, "Unable to add server to balancer.");
        }
    };
    let holder = match state.aliases.entry(alias.clone()) {
        Entry::Occupied(entry) => {
            let holder = Arc::clone(entry.get());
            register_backend(&holder);
            holder
        }
        Entry::Vacant(entry) => {
            let balancer = state
                .balancer_factory
                .create()
                .inspect_err(|error| error!(%alias, %error, "Error initializing alias balancer."))?;
            let holder = Arc::new(AliasHolder::new(alias.clone(), balancer));
            register_backend(&holder);
            entry.insert(Arc::clone(&holder));
            holder
        }
    };
    session.track_alias(alias.clone(), listener_address);
    let notice_text = format!("{notice_text}{ALIAS_NOTICE_TAG}: {alias}\r\n");
    info!(
        %alias,
        address = %listener_address,
        peer = %session.peer(),
        "TCP alias forwarding started."
    );
    Ok(AliasRegistration {
        holder,
        backend_url,
        alias,
        notice_text,
    })
}

// Drop one backend from an alias, removing the holder entirely once its last
// backend is gone. Used by session cleanup and by forward cancellation.
pub fn remove_backend(state: &ServerState, alias: &TcpAlias, address: &SocketAddr) {
    let backend_address = address.to_string();
    state.aliases.remove_if(alias, |_, holder| {
        holder.backends.remove(&backend_address);
        let url = BackendUrl::encode(&backend_address);
        if let Err(error) = holder.balancer.remove_server(&url) {
            warn!(%alias, %error, "Unable to remove server from balancer.");
        }
        holder.backends.is_empty()
    });
}

// An accepted alias connection: the dialed backend stream, plus the session
// serving the chosen backend for routing decisions.
pub struct AliasConnection {
    pub stream: TcpStream,
    pub session: Option<Arc<Session>>,
    pub backend_address: String,
}

impl std::fmt::Debug for AliasConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasConnection")
            .field("stream", &self.stream)
            .field("session", &self.session.is_some())
            .field("backend_address", &self.backend_address)
            .finish()
    }
}

// Dial the next backend for an alias, as picked by its balancer.
pub async fn alias_connection(
    state: &ServerState,
    alias: &TcpAlias,
) -> color_eyre::Result<AliasConnection> {
    let holder = state
        .aliases
        .get(alias)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or(ServerError::AliasNotFound)?;
    let url = holder
        .balancer
        .next_server()
        .ok_or(ServerError::NoBackendAvailable)?;
    let backend_address = url.decode()?;
    let stream = TcpStream::connect(&backend_address)
        .await
        .wrap_err_with(|| format!("Error dialing backend for alias {alias}"))?;
    let session = holder.session_for(&backend_address);
    Ok(AliasConnection {
        stream,
        session,
        backend_address,
    })
}
