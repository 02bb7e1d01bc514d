use std::{net::SocketAddr, sync::Arc, time::Duration};

use mailgate_common::{
    Counter, Gauge, Observer, Signal,
    error::{ConfigError, ListenerError},
    internal,
};
use mailgate_queue::Publisher;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinSet,
};

use crate::{
    config::TcpConfig,
    connection::Connection,
    session::{Session, SessionConfig},
    tls::CertificateStore,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Mode {
    Plain,
    Tls(Arc<CertificateStore>),
}

/// Holds one open-connection gauge up for as long as it lives.
struct Open {
    observer: Arc<dyn Observer>,
    gauge: Gauge,
}

impl Open {
    fn new(observer: Arc<dyn Observer>, gauge: Gauge) -> Self {
        observer.adjust(gauge, 1.0);
        Self { observer, gauge }
    }
}

impl Drop for Open {
    fn drop(&mut self) {
        self.observer.adjust(self.gauge, -1.0);
    }
}

/// Accepts gateway clients, in plaintext or TLS mode.
pub struct Listener {
    socket: TcpListener,
    mode: Mode,
    session: Arc<SessionConfig>,
    reload_interval: Duration,
    observer: Arc<dyn Observer>,
}

impl Listener {
    /// Validate the configuration, load TLS material and bind the socket.
    ///
    /// # Errors
    /// If neither mode is enabled, the secret is missing, TLS material cannot
    /// be loaded, or the address cannot be bound.
    pub async fn bind(
        config: &TcpConfig,
        publisher: Publisher,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ListenerError> {
        if !config.enabled && !config.tls.enabled {
            return Err(ConfigError::NoListenerEnabled.into());
        }

        if config.auth_secret.is_empty() {
            return Err(ConfigError::Missing(vec!["TCP_AUTH_SECRET"]).into());
        }

        let mode = if config.tls.enabled {
            if config.enabled {
                internal!(
                    level = WARN,
                    "Both plaintext and TLS listening are enabled; serving TLS only"
                );
            }

            let store = CertificateStore::load(&config.tls, Arc::clone(&observer))
                .map_err(|e| ListenerError::Tls(e.to_string()))?;
            Mode::Tls(Arc::new(store))
        } else {
            Mode::Plain
        };

        let address = config.address();
        let socket = TcpListener::bind(address)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: address.to_string(),
                source,
            })?;

        Ok(Self {
            socket,
            mode,
            session: Arc::new(SessionConfig {
                secret: Arc::from(config.auth_secret.as_str()),
                timeouts: config.timeouts.clone(),
                max_frame_bytes: config.max_frame_bytes,
                publisher,
                observer: Arc::clone(&observer),
            }),
            reload_interval: config.tls.reload_interval(),
            observer,
        })
    }

    /// The bound address.
    ///
    /// # Errors
    /// If the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The certificate store, in TLS mode.
    pub fn certificates(&self) -> Option<Arc<CertificateStore>> {
        match &self.mode {
            Mode::Plain => None,
            Mode::Tls(store) => Some(Arc::clone(store)),
        }
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.mode, Mode::Tls(_))
    }

    /// Accept connections until `shutdown` fires, then wait a bounded time for
    /// open connections to finish. The signal only stops the accept loop;
    /// connections still open after the grace period keep running detached.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        let address = self
            .local_addr()
            .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
        internal!(
            level = INFO,
            "Listening on {address} ({})",
            if self.is_tls() { "TLS" } else { "plaintext" }
        );

        if let Mode::Tls(store) = &self.mode {
            tokio::spawn(Arc::clone(store).watch(self.reload_interval, shutdown.resubscribe()));
        }

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Listener {address} received shutdown signal, no longer accepting");
                        break;
                    }
                }

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                accepted = self.socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.dispatch(&mut sessions, stream, peer);
                        self.observer.increment(Counter::ConnectionsAccepted);
                    }
                    Err(err) => {
                        self.observer.increment(Counter::AcceptErrors);
                        internal!(level = ERROR, "Failed to accept connection: {err}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let grace = self.session.timeouts.drain();
        drop(self.socket);

        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            internal!(
                level = WARN,
                "{} connection(s) still open after {grace:?}; leaving them to finish",
                sessions.len()
            );
            sessions.detach_all();
        }

        internal!(level = INFO, "Listener {address} stopped");
    }

    fn dispatch(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let config = Arc::clone(&self.session);
        let observer = Arc::clone(&self.observer);

        match &self.mode {
            Mode::Plain => {
                sessions.spawn(async move {
                    let _open = Open::new(observer, Gauge::PlainConnections);
                    // Errors are logged by the session.
                    let _ = Session::new(peer, Connection::Plain(stream), config)
                        .run()
                        .await;
                });
            }
            Mode::Tls(store) => {
                let acceptor = store.snapshot().acceptor();

                sessions.spawn(async move {
                    let handshake = tokio::time::timeout(
                        config.timeouts.idle(),
                        Connection::accept(stream, &acceptor),
                    )
                    .await;

                    let connection = match handshake {
                        Ok(Ok(connection)) => connection,
                        Ok(Err(err)) => {
                            observer.increment(Counter::HandshakeErrors);
                            internal!(level = WARN, "TLS handshake with {peer} failed: {err}");
                            return;
                        }
                        Err(_) => {
                            observer.increment(Counter::HandshakeErrors);
                            internal!(level = WARN, "TLS handshake with {peer} timed out");
                            return;
                        }
                    };
                    drop(acceptor);

                    let _open = Open::new(observer, Gauge::TlsConnections);
                    let _ = Session::new(peer, connection, config).run().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("socket", &self.socket)
            .field("tls", &self.is_tls())
            .finish_non_exhaustive()
    }
}
