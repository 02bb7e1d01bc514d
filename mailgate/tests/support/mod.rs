//! End-to-end harness for the mailgate gateway.
//!
//! Runs a full [`Gateway`] on an ephemeral loopback port with an in-memory
//! queue, a recording transport and a recording observer in place of
//! RabbitMQ, SMTP and the metrics exporter.

#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use mailgate::{Config, Gateway, Running};
use mailgate_common::RecordingObserver;
use mailgate_delivery::RecordingTransport;
use mailgate_queue::MemoryQueue;
use mailgate_tcp::{GatewayClient, TlsConfig, TlsOptions, config::LOOPBACK};

pub const SECRET: &str = "topsecret";
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub queue: MemoryQueue,
    pub transport: RecordingTransport,
    pub observer: RecordingObserver,
    pub running: Running,
}

pub struct HarnessBuilder {
    dir: tempfile::TempDir,
    config: Config,
    transport: RecordingTransport,
}

impl HarnessBuilder {
    /// Serve TLS with a fresh self-signed certificate for `localhost`.
    pub fn with_tls(mut self) -> Self {
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate = self.dir.path().join("server-cert.pem");
        let key = self.dir.path().join("server-key.pem");
        std::fs::write(&certificate, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

        self.config.tcp.tls = TlsConfig {
            enabled: true,
            certificate,
            key,
            reload_interval_secs: 3600,
        };
        self
    }

    /// Fail the first `count` delivery attempts.
    pub fn with_failing_transport(mut self, count: usize) -> Self {
        self.transport = RecordingTransport::new().failing(count);
        self
    }

    pub fn with_notifications(mut self, recipient: &str) -> Self {
        self.config.notifications.recipient = Some(recipient.to_string());
        self
    }

    pub async fn build(self) -> Harness {
        let queue = MemoryQueue::new();
        let observer = RecordingObserver::new();

        let running = Gateway::new(self.config)
            .with_queue(Arc::new(queue.clone()))
            .with_transport(Arc::new(self.transport.clone()))
            .with_observer(Arc::new(observer.clone()))
            .start()
            .await
            .expect("gateway should start");

        Harness {
            dir: self.dir,
            queue,
            transport: self.transport,
            observer,
            running,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.tcp.bind = LOOPBACK.ip();
        config.tcp.port = 0;
        config.tcp.auth_secret = SECRET.to_string();
        config.tcp.timeouts.drain_secs = 1;
        config.queue.requeue_delay_ms = 10;
        config.queue.backlog_interval_secs = 1;
        config.metrics.enabled = false;
        config.notifications.path = dir.path().join("certificate_notification.json");
        config.notifications.ca_certificate = dir.path().join("ca-cert.pem");
        config.notifications.poll_interval_secs = 1;

        HarnessBuilder {
            dir,
            config,
            transport: RecordingTransport::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Poll until `name` no longer exists in the harness directory.
    pub async fn wait_for_removal(&self, name: &str, timeout: Duration) -> bool {
        let path = self.path(name);
        tokio::time::timeout(timeout, async {
            while path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// A plaintext client that has already authenticated.
    pub async fn client(&self) -> GatewayClient {
        let mut client = GatewayClient::connect(self.running.address()).await.unwrap();
        let reply = client.authenticate(SECRET).await.unwrap();
        assert!(!reply.is_error(), "authentication failed: {reply:?}");
        client
    }

    pub async fn tls_client(&self) -> GatewayClient {
        let options = TlsOptions::new("localhost").ca(self.path("server-cert.pem"));
        let mut client = GatewayClient::connect_tls(self.running.address(), &options)
            .await
            .unwrap();
        let reply = client.authenticate(SECRET).await.unwrap();
        assert!(!reply.is_error(), "authentication failed: {reply:?}");
        client
    }

    pub async fn shutdown(self) {
        tokio::time::timeout(WAIT, self.running.shutdown())
            .await
            .expect("gateway should stop in time")
            .expect("gateway should stop cleanly");
    }
}
