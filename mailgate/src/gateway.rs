//! Composition root.
//!
//! Wires the listener, the delivery worker, the backlog sampler and the
//! certificate notification watcher to one queue and one observer, and
//! stops them together.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, anyhow};
use mailgate_common::{NoopObserver, Observer, Signal, internal};
use mailgate_delivery::{BacklogSampler, Consumer, MailTransport, SmtpTransport};
use mailgate_metrics::Metrics;
use mailgate_queue::{AmqpQueue, MessageQueue, Publisher};
use mailgate_tcp::{CertificateStore, Listener};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
    task::JoinSet,
};

use crate::{config::Config, notify::CertificateNotifier};

type Task = (&'static str, anyhow::Result<()>);

/// A gateway waiting to be started.
///
/// The queue, transport and observer default to RabbitMQ, SMTP and the
/// configured metrics exporter; each can be replaced before starting.
#[derive(Debug)]
pub struct Gateway {
    config: Config,
    queue: Option<Arc<dyn MessageQueue>>,
    transport: Option<Arc<dyn MailTransport>>,
    observer: Option<Arc<dyn Observer>>,
    metrics: Option<Metrics>,
}

impl Gateway {
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            queue: None,
            transport: None,
            observer: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use `metrics` instead of initialising them from the configuration.
    /// An injected observer takes precedence for observations, but `metrics`
    /// are still flushed on shutdown.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bring every component up and return once the listener is bound.
    ///
    /// # Errors
    ///
    /// This function will return an error if metrics cannot be initialised,
    /// the queue is unreachable, the SMTP transport cannot be built, or the
    /// listener cannot be bound (including unreadable TLS material).
    pub async fn start(self) -> anyhow::Result<Running> {
        let Self {
            config,
            queue,
            transport,
            observer,
            metrics,
        } = self;

        let metrics = match metrics {
            Some(metrics) => Some(metrics),
            None if observer.is_none() => Some(mailgate_metrics::init(&config.metrics)?),
            None => None,
        };
        let observer = observer
            .or_else(|| metrics.as_ref().map(Metrics::observer))
            .unwrap_or_else(|| Arc::new(NoopObserver));

        match Self::launch(&config, queue, transport, observer).await {
            Ok(mut running) => {
                running.metrics = metrics;
                Ok(running)
            }
            Err(err) => {
                if let Some(Err(flush)) = metrics.map(Metrics::shutdown) {
                    internal!(level = WARN, "Failed to flush metrics: {flush}");
                }
                Err(err)
            }
        }
    }

    async fn launch(
        config: &Config,
        queue: Option<Arc<dyn MessageQueue>>,
        transport: Option<Arc<dyn MailTransport>>,
        observer: Arc<dyn Observer>,
    ) -> anyhow::Result<Running> {
        let queue: Arc<dyn MessageQueue> = match queue {
            Some(queue) => queue,
            None => Arc::new(
                AmqpQueue::connect(&config.queue)
                    .await
                    .context("Unable to reach the message queue")?,
            ),
        };

        let transport: Arc<dyn MailTransport> = match transport {
            Some(transport) => transport,
            None => Arc::new(
                SmtpTransport::new(&config.smtp).context("Unable to configure SMTP transport")?,
            ),
        };

        let publisher = Publisher::new(Arc::clone(&queue), Arc::clone(&observer));
        let listener = Listener::bind(&config.tcp, publisher.clone(), Arc::clone(&observer)).await?;
        let address = listener.local_addr()?;
        let certificates = listener.certificates();

        let (signal, _) = broadcast::channel(16);
        let mut tasks: JoinSet<Task> = JoinSet::new();

        tasks.spawn({
            let shutdown = signal.subscribe();
            async move {
                listener.serve(shutdown).await;
                ("listener", Ok(()))
            }
        });

        tasks.spawn({
            let consumer = Consumer::new(Arc::clone(&queue), transport, Arc::clone(&observer))
                .with_prefetch(config.queue.prefetch)
                .with_requeue_delay(config.queue.requeue_delay());
            let shutdown = signal.subscribe();
            async move { ("delivery", consumer.run(shutdown).await.map_err(Into::into)) }
        });

        tasks.spawn({
            let sampler = BacklogSampler::new(
                Arc::clone(&queue),
                Arc::clone(&observer),
                config.queue.backlog_interval(),
            );
            let shutdown = signal.subscribe();
            async move {
                sampler.run(shutdown).await;
                ("backlog", Ok(()))
            }
        });

        if let Some(recipient) = config.notifications.recipient.clone() {
            let notifier = CertificateNotifier::new(recipient, config.notifications.clone(), publisher);
            let shutdown = signal.subscribe();
            tasks.spawn(async move {
                notifier.run(shutdown).await;
                ("certificate notifications", Ok(()))
            });
        }

        internal!(
            level = INFO,
            "Gateway accepting {} connections on {address}",
            if certificates.is_some() { "TLS" } else { "plaintext" }
        );

        Ok(Running {
            address,
            certificates,
            signal,
            tasks,
            metrics: None,
        })
    }

    /// Start, then run until interrupted or until a component stops on its
    /// own, and shut everything down.
    ///
    /// # Errors
    ///
    /// This function will return an error if startup fails or a component
    /// stops unexpectedly.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut running = self.start().await?;

        let outcome = tokio::select! {
            r = running.stopped() => r,
            r = terminated() => r.map_err(Into::into),
        };

        let stopped = running.shutdown().await;
        outcome.and(stopped)
    }
}

/// A started gateway.
#[derive(Debug)]
pub struct Running {
    address: SocketAddr,
    certificates: Option<Arc<CertificateStore>>,
    signal: broadcast::Sender<Signal>,
    tasks: JoinSet<Task>,
    metrics: Option<Metrics>,
}

impl Running {
    /// Where the listener is bound.
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// The served certificate material, in TLS mode.
    pub fn certificates(&self) -> Option<Arc<CertificateStore>> {
        self.certificates.clone()
    }

    /// Wait for the first component to stop. Before shutdown, any component
    /// stopping is a failure.
    ///
    /// # Errors
    ///
    /// Always, unless there was nothing running.
    pub async fn stopped(&mut self) -> anyhow::Result<()> {
        match self.tasks.join_next().await {
            Some(Ok((name, Ok(())))) => Err(anyhow!("{name} stopped unexpectedly")),
            Some(Ok((name, Err(err)))) => Err(err.context(format!("{name} failed"))),
            Some(Err(err)) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Signal every component to stop, wait for them, and flush metrics.
    ///
    /// # Errors
    ///
    /// This function will return an error if a component failed while
    /// stopping or the final metrics export fails.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        internal!(level = INFO, "Shutting down...");

        // Nobody left to tell when every component has already returned.
        let _ = self.signal.send(Signal::Shutdown);

        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => internal!(level = DEBUG, "{name} stopped"),
                Ok((name, Err(err))) => {
                    internal!(level = ERROR, "{name} failed while stopping: {err:#}");
                    result = Err(err.context(format!("{name} failed")));
                }
                Err(err) => {
                    internal!(level = ERROR, "Task failed while stopping: {err}");
                    result = Err(err.into());
                }
            }
        }

        if let Some(metrics) = self.metrics {
            metrics.shutdown()?;
        }

        internal!(level = INFO, "Gateway stopped");

        result
    }
}

async fn terminated() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use mailgate_delivery::RecordingTransport;
    use mailgate_queue::MemoryQueue;
    use mailgate_tcp::config::LOOPBACK;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.tcp.bind = LOOPBACK.ip();
        config.tcp.port = 0;
        config.tcp.auth_secret = "topsecret".to_string();
        config.tcp.timeouts.drain_secs = 1;
        config
    }

    fn gateway(config: Config, provider: &SdkMeterProvider) -> Gateway {
        Gateway::new(config)
            .with_queue(Arc::new(MemoryQueue::new()))
            .with_transport(Arc::new(RecordingTransport::new()))
            .with_metrics(Metrics::from_provider(provider.clone()))
    }

    #[tokio::test]
    async fn failed_start_flushes_metrics() {
        let mut config = config();
        config.tcp.tls.enabled = true;
        config.tcp.tls.certificate = "/nonexistent/server-cert.pem".into();
        config.tcp.tls.key = "/nonexistent/server-key.pem".into();

        let provider = SdkMeterProvider::builder().build();
        assert!(gateway(config, &provider).start().await.is_err());

        // Already shut down by the failed start.
        assert!(provider.shutdown().is_err());
    }

    #[tokio::test]
    async fn shutdown_flushes_metrics() {
        let provider = SdkMeterProvider::builder().build();
        let running = gateway(config(), &provider).start().await.unwrap();

        running.shutdown().await.unwrap();
        assert!(provider.shutdown().is_err());
    }
}
