//! Integration tests for the gateway listener.
//!
//! Every test binds a real listener on an ephemeral loopback port and talks to
//! it with [`GatewayClient`].

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use mailgate_common::{
    Counter, EmailRequest, Gauge, RecordingObserver, Signal,
    error::{ConfigError, ListenerError},
};
use mailgate_queue::{MemoryQueue, Publisher};
use mailgate_tcp::{
    GatewayClient, Listener, Reply, TcpConfig, TlsConfig, TlsOptions,
    codec::{AUTH_INVALID, AUTH_REQUIRED, AUTH_SUCCESS, EMAIL_QUEUED},
    config::LOOPBACK,
};
use tokio::{net::TcpStream, sync::broadcast, task::JoinHandle};

const WAIT: Duration = Duration::from_secs(5);

struct Certificates {
    _dir: tempfile::TempDir,
    certificate: PathBuf,
    key: PathBuf,
}

impl Certificates {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let certificates = Self {
            certificate: dir.path().join("server-cert.pem"),
            key: dir.path().join("server-key.pem"),
            _dir: dir,
        };
        certificates.issue("localhost");
        certificates
    }

    /// Write a fresh self-signed pair, returning the DER of the certificate.
    fn issue(&self, name: &str) -> Vec<u8> {
        let generated = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        std::fs::write(&self.certificate, generated.cert.pem()).unwrap();
        std::fs::write(&self.key, generated.key_pair.serialize_pem()).unwrap();
        generated.cert.der().to_vec()
    }
}

struct Gateway {
    address: SocketAddr,
    queue: MemoryQueue,
    observer: RecordingObserver,
    shutdown: broadcast::Sender<Signal>,
    listener: Option<Arc<mailgate_tcp::CertificateStore>>,
    handle: JoinHandle<()>,
}

impl Gateway {
    fn config() -> TcpConfig {
        let mut config = TcpConfig {
            bind: LOOPBACK.ip(),
            port: 0,
            auth_secret: "topsecret".to_string(),
            ..TcpConfig::default()
        };
        config.timeouts.drain_secs = 1;
        config
    }

    async fn start(config: TcpConfig) -> Self {
        let queue = MemoryQueue::new();
        let observer = RecordingObserver::new();
        let publisher = Publisher::new(Arc::new(queue.clone()), Arc::new(observer.clone()));

        let listener = Listener::bind(&config, publisher, Arc::new(observer.clone()))
            .await
            .unwrap();
        let address = listener.local_addr().unwrap();
        let certificates = listener.certificates();

        let (shutdown, receiver) = broadcast::channel(4);
        let handle = tokio::spawn(listener.serve(receiver));

        Self {
            address,
            queue,
            observer,
            shutdown,
            listener: certificates,
            handle,
        }
    }

    async fn plain() -> Self {
        Self::start(Self::config()).await
    }

    async fn tls(certificates: &Certificates) -> Self {
        let mut config = Self::config();
        config.tls = TlsConfig {
            enabled: true,
            certificate: certificates.certificate.clone(),
            key: certificates.key.clone(),
            reload_interval_secs: 3600,
        };
        Self::start(config).await
    }

    async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("listener should stop")
            .unwrap();
    }
}

fn options() -> TlsOptions {
    TlsOptions::new("localhost").accept_invalid_certs(true)
}

fn request() -> EmailRequest {
    EmailRequest::new(["a@example.com"], "Hi", "Hello")
}

#[tokio::test]
async fn plaintext_scenario() {
    let gateway = Gateway::plain().await;
    let mut client = GatewayClient::connect(gateway.address).await.unwrap();

    assert_eq!(
        client.authenticate("topsecret").await.unwrap(),
        Reply::message(AUTH_SUCCESS)
    );
    assert_eq!(
        client.send(&request()).await.unwrap(),
        Reply::message(EMAIL_QUEUED)
    );

    assert_eq!(gateway.queue.len(), 1);
    let queued: EmailRequest = serde_json::from_slice(&gateway.queue.published()[0]).unwrap();
    assert_eq!(queued.recipients, vec!["a@example.com".to_string()]);
    assert!(queued.queued_at.is_some());

    drop(client);
    gateway.stop().await;
}

#[tokio::test]
async fn email_first_is_refused_and_closed() {
    let gateway = Gateway::plain().await;
    let mut client = GatewayClient::connect(gateway.address).await.unwrap();

    client
        .write(br#"{"to":[],"subject":"x","body":"y"}"#)
        .await
        .unwrap();
    assert_eq!(client.reply().await.unwrap(), Reply::error(AUTH_REQUIRED));
    assert!(matches!(
        client.reply().await,
        Err(mailgate_tcp::ClientError::Closed)
    ));
    assert!(gateway.queue.is_empty());

    gateway.stop().await;
}

#[tokio::test]
async fn wrong_secret_counts_one_failure() {
    let gateway = Gateway::plain().await;
    let mut client = GatewayClient::connect(gateway.address).await.unwrap();

    assert_eq!(
        client.authenticate("guess").await.unwrap(),
        Reply::error(AUTH_INVALID)
    );
    assert!(client.reply().await.is_err());
    assert_eq!(gateway.observer.count(Counter::AuthFailure), 1);
    assert_eq!(gateway.observer.count(Counter::AuthSuccess), 0);

    gateway.stop().await;
}

#[tokio::test]
async fn connection_gauge_follows_sessions() {
    let gateway = Gateway::plain().await;
    let mut client = GatewayClient::connect(gateway.address).await.unwrap();
    client.authenticate("topsecret").await.unwrap();

    assert_eq!(gateway.observer.gauge(Gauge::PlainConnections), Some(1.0));

    drop(client);
    assert!(
        gateway
            .observer
            .wait_for_gauge(Gauge::PlainConnections, |open| open < 0.5, WAIT)
            .await
    );

    gateway.stop().await;
}

#[tokio::test]
async fn no_mode_enabled_fails_fast() {
    let mut config = Gateway::config();
    config.enabled = false;

    let observer = Arc::new(RecordingObserver::new());
    let publisher = Publisher::new(Arc::new(MemoryQueue::new()), observer.clone());
    let err = Listener::bind(&config, publisher, observer).await.unwrap_err();

    assert!(matches!(
        err,
        ListenerError::Config(ConfigError::NoListenerEnabled)
    ));
}

#[tokio::test]
async fn unreadable_certificate_is_fatal() {
    let mut config = Gateway::config();
    config.tls.enabled = true;
    config.tls.certificate = PathBuf::from("/nonexistent/cert.pem");

    let observer = Arc::new(RecordingObserver::new());
    let publisher = Publisher::new(Arc::new(MemoryQueue::new()), observer.clone());
    let err = Listener::bind(&config, publisher, observer).await.unwrap_err();

    assert!(matches!(err, ListenerError::Tls(_)));
}

#[tokio::test]
async fn tls_takes_precedence() {
    let certificates = Certificates::new();
    let gateway = Gateway::tls(&certificates).await;
    assert!(gateway.listener.is_some());

    let mut client = GatewayClient::connect_tls(gateway.address, &options())
        .await
        .unwrap();
    assert_eq!(
        client.authenticate("topsecret").await.unwrap(),
        Reply::message(AUTH_SUCCESS)
    );
    assert_eq!(
        client.send(&request()).await.unwrap(),
        Reply::message(EMAIL_QUEUED)
    );
    assert_eq!(gateway.observer.gauge(Gauge::TlsConnections), Some(1.0));

    drop(client);
    gateway.stop().await;
}

#[tokio::test]
async fn plaintext_client_fails_tls_handshake() {
    let certificates = Certificates::new();
    let gateway = Gateway::tls(&certificates).await;

    let mut client = GatewayClient::connect(gateway.address).await.unwrap();
    client.write(br#"{"secret":"topsecret"}"#).await.unwrap();
    assert!(client.reply().await.is_err());

    assert!(
        gateway
            .observer
            .wait_for(Counter::HandshakeErrors, 1, WAIT)
            .await
    );
    gateway.stop().await;
}

#[tokio::test]
async fn reload_does_not_disturb_pending_handshakes() {
    const PENDING: usize = 4;

    let certificates = Certificates::new();
    let gateway = Gateway::tls(&certificates).await;
    let store = gateway.listener.clone().unwrap();
    let before = store.snapshot().leaf().as_ref().to_vec();

    let mut pending = Vec::new();
    for _ in 0..PENDING {
        pending.push(TcpStream::connect(gateway.address).await.unwrap());
    }
    assert!(
        gateway
            .observer
            .wait_for(Counter::ConnectionsAccepted, PENDING as u64, WAIT)
            .await
    );

    let renewed = certificates.issue("localhost");
    store.reload().unwrap();
    assert_eq!(gateway.observer.count(Counter::CertificateReloads), 1);

    for stream in pending {
        let mut client = GatewayClient::handshake(stream, &options()).await.unwrap();
        assert_eq!(
            client.peer_certificate().unwrap().as_ref(),
            before.as_slice()
        );
        assert_eq!(
            client.authenticate("topsecret").await.unwrap(),
            Reply::message(AUTH_SUCCESS)
        );
    }

    let client = GatewayClient::connect_tls(gateway.address, &options())
        .await
        .unwrap();
    assert_eq!(
        client.peer_certificate().unwrap().as_ref(),
        renewed.as_slice()
    );
    assert_eq!(gateway.observer.count(Counter::HandshakeErrors), 0);

    drop(client);
    gateway.stop().await;
}

#[tokio::test]
async fn watcher_picks_up_changed_files() {
    let certificates = Certificates::new();
    let mut config = Gateway::config();
    config.tls = TlsConfig {
        enabled: true,
        certificate: certificates.certificate.clone(),
        key: certificates.key.clone(),
        reload_interval_secs: 1,
    };
    let gateway = Gateway::start(config).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let renewed = certificates.issue("localhost");

    assert!(
        gateway
            .observer
            .wait_for(Counter::CertificateReloads, 1, WAIT)
            .await
    );

    let client = GatewayClient::connect_tls(gateway.address, &options())
        .await
        .unwrap();
    assert_eq!(
        client.peer_certificate().unwrap().as_ref(),
        renewed.as_slice()
    );

    drop(client);
    gateway.stop().await;
}

#[tokio::test]
async fn open_session_outlives_listener() {
    let gateway = Gateway::plain().await;
    let address = gateway.address;
    let queue = gateway.queue.clone();

    let mut client = GatewayClient::connect(address).await.unwrap();
    client.authenticate("topsecret").await.unwrap();

    gateway.stop().await;
    assert!(TcpStream::connect(address).await.is_err());

    assert_eq!(
        client.send(&request()).await.unwrap(),
        Reply::message(EMAIL_QUEUED)
    );
    assert_eq!(queue.len(), 1);
}
