//! Client lifecycle and local acceptor
//!
//! A [`MeekClient`] owns a loopback listener and one independent session
//! task per accepted connection. `start` is idempotent (it stops any prior
//! run first); `stop` closes the listener, waits the acceptor out, then
//! force-closes every live session without joining it. Session tasks are
//! bounded by the per-request timeout, so shutdown never hangs on them.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{MeekConfig, MeekMode};
use crate::dns::DnsResolver;
use crate::protect::SocketProtector;
use crate::session;
use crate::MeekResult;

const LISTEN_BACKLOG: u32 = 50;

type SessionMap = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

struct Running {
    acceptor: JoinHandle<()>,
    sessions: SessionMap,
}

/// One relay's local tunnel endpoint.
///
/// Everything that connects to the published loopback port is carried to
/// the relay as an opaque byte stream; each connection gets its own
/// session and cookie.
pub struct MeekClient {
    config: Arc<MeekConfig>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn DnsResolver>,
    state: Mutex<Option<Running>>,
    // Mirrors the lifecycle state for lock-free reads; -1 while stopped
    local_port: AtomicI32,
}

impl MeekClient {
    pub fn new(
        config: MeekConfig,
        protector: Arc<dyn SocketProtector>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            protector,
            resolver,
            state: Mutex::new(None),
            local_port: AtomicI32::new(-1),
        }
    }

    /// The configured transport mode.
    pub fn mode(&self) -> &MeekMode {
        &self.config.mode
    }

    /// The loopback port clients should connect to, while running.
    pub fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::Acquire) {
            -1 => None,
            port => Some(port as u16),
        }
    }

    /// Bind the loopback listener and launch the acceptor. Stops any prior
    /// run first, so calling this twice is safe.
    pub async fn start(&self) -> MeekResult<u16> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state, &self.local_port).await;

        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let port = listener.local_addr()?.port();

        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.protector.clone(),
            self.resolver.clone(),
            sessions.clone(),
        ));

        *state = Some(Running { acceptor, sessions });
        self.local_port.store(port as i32, Ordering::Release);

        log::info!(
            "Meek: listening on 127.0.0.1:{} for {}",
            port,
            self.config.url()
        );
        Ok(port)
    }

    /// Close the listener and tear down live sessions. No-op when stopped.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state, &self.local_port).await;
    }

    async fn stop_locked(state: &mut Option<Running>, local_port: &AtomicI32) {
        let Some(running) = state.take() else {
            return;
        };
        local_port.store(-1, Ordering::Release);

        // Cancelling the acceptor closes the listener; wait for it so the
        // port is released before start() rebinds
        running.acceptor.abort();
        let _ = running.acceptor.await;

        // Force-close live sessions by cancelling their tasks, which drops
        // their sockets and any in-flight request. They are intentionally
        // not awaited.
        let mut sessions = running.sessions.lock().await;
        let live = sessions.len();
        for (_, handle) in sessions.drain() {
            handle.abort();
        }
        if live > 0 {
            log::info!("Meek: stopped with {} live sessions closed", live);
        } else {
            log::info!("Meek: stopped");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<MeekConfig>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn DnsResolver>,
    sessions: SessionMap,
) {
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Meek: accept failed: {}", e);
                break;
            }
        };
        log::debug!("Meek: accepted local connection from {}", peer);

        let id = next_id;
        next_id += 1;
        let config = config.clone();
        let protector = protector.clone();
        let resolver = resolver.clone();
        let session_registry = sessions.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = session::run_session(stream, config, protector, resolver).await {
                log::warn!("Meek: session error: {}", e);
            }
            session_registry.lock().await.remove(&id);
        });

        let mut registry = sessions.lock().await;
        if !handle.is_finished() {
            registry.insert(id, handle);
        }
    }
}
