use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::RandomState;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tokio::{
    sync::mpsc::{self, Receiver, Sender, error::TrySendError},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    ServerState, alias, droppable_handle::DroppableHandle, tcp_alias::TcpAlias,
};

// Interval between delivery attempts for non-blocking notifications.
const NOTIFY_RETRY_INTERVAL: Duration = Duration::from_millis(100);
// How many delivery attempts before a non-blocking notification is dropped.
const NOTIFY_RETRY_ATTEMPTS: usize = 5;

// Secured transport underneath a session. The SSH handshake and channel
// machinery belong to the embedding server; the core only needs the peer
// identity, the authenticated user, and a close operation that must be safe
// to call during cleanup.
#[cfg_attr(test, automock)]
pub trait SessionTransport: Send + Sync {
    fn peer(&self) -> SocketAddr;
    fn user(&self) -> String;
    fn close(&self);
}

// State for one accepted SSH connection.
pub struct Session {
    // Transport handle owning the underlying socket.
    transport: Arc<dyn SessionTransport>,
    // Accept tasks for the forwarding listeners this session owns. Dropping
    // an entry aborts its task.
    listeners: DashMap<SocketAddr, DroppableHandle<()>, RandomState>,
    // Close signal observed by every task tied to this session.
    cancellation_token: CancellationToken,
    // Outbound console messages, delivered in submission order.
    messages: Sender<String>,
    // Aliases this session registered, by listener address. Undone on cleanup.
    aliases: DashMap<TcpAlias, SocketAddr, RandomState>,
    // Proxy protocol version byte for connections dialed to this session's
    // listeners, zero when disabled.
    proxy_protocol: u8,
    // Whether the client has opened its console session channel.
    session_open: AtomicBool,
    // Single-execution gate for clean_up.
    cleanup_done: AtomicBool,
}

impl Session {
    // Create the session state once handshake and authentication have
    // succeeded. The returned receiver feeds the client's console channel.
    pub fn open(
        transport: Arc<dyn SessionTransport>,
        proxy_protocol: u8,
        queue_size: usize,
    ) -> (Arc<Self>, Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let session = Arc::new(Session {
            transport,
            listeners: DashMap::default(),
            cancellation_token: CancellationToken::new(),
            messages: tx,
            aliases: DashMap::default(),
            proxy_protocol,
            session_open: AtomicBool::new(false),
            cleanup_done: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.transport.peer()
    }

    pub fn user(&self) -> String {
        self.transport.user()
    }

    pub fn proxy_protocol(&self) -> u8 {
        self.proxy_protocol
    }

    // Signal fired once this session starts closing. Cloning is cheap; every
    // task tied to the session should select on it.
    pub fn closed(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn mark_session_open(&self) {
        self.session_open.store(true, Ordering::Release);
    }

    pub fn is_session_open(&self) -> bool {
        self.session_open.load(Ordering::Acquire)
    }

    // Take ownership of the accept task for a forwarding listener.
    pub fn track_listener(&self, address: SocketAddr, handle: DroppableHandle<()>) {
        self.listeners.insert(address, handle);
    }

    pub(crate) fn track_alias(&self, alias: TcpAlias, address: SocketAddr) {
        self.aliases.insert(alias, address);
    }

    // Append a line to the client's console stream.
    //
    // When `block` is set, waits for queue space or for the session to close,
    // whichever comes first. Otherwise makes a bounded number of attempts
    // with short cancellation-aware pauses in between, then drops the
    // message; a stalled client can never block the caller for more than
    // half a second.
    pub async fn notify(&self, message: impl Into<String>, block: bool) {
        let mut message = message.into();
        if block {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => (),
                _ = self.messages.send(message) => (),
            }
            return;
        }
        for _ in 0..NOTIFY_RETRY_ATTEMPTS {
            match self.messages.try_send(message) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(returned)) => {
                    message = returned;
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => return,
                        _ = sleep(NOTIFY_RETRY_INTERVAL) => (),
                    }
                }
            }
        }
        debug!(peer = %self.transport.peer(), "Dropped console message for stalled client.");
    }

    // Close this session and release everything it registered: fire the
    // close signal, close the transport, deregister from the global state,
    // and pull this session's backends out of every alias it served. Calling
    // it a second time is a no-op.
    pub fn clean_up(&self, state: &ServerState) {
        if self.cleanup_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation_token.cancel();
        self.transport.close();
        let peer = self.transport.peer();
        state.sessions.remove(&peer);
        for entry in self.aliases.iter() {
            alias::remove_backend(state, entry.key(), entry.value());
        }
        self.aliases.clear();
        self.listeners.clear();
        info!(%peer, user = %self.transport.user(), "Closed SSH connection.");
    }
}
