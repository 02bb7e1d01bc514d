//! Live TLS material and its reload poller.
//!
//! The active [`CertificateMaterial`] sits behind a short-held lock as an
//! `Arc`. The accept loop clones the `Arc` once per connection, so a
//! handshake always completes with the material it started with, while a
//! reload swaps in a fresh `Arc` for every later connection.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use mailgate_common::{Counter, Gauge, Observer, Signal, internal};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::{CryptoProvider, aws_lc_rs},
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};

use crate::{
    config::TlsConfig,
    error::{TlsError, TlsResult},
};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// The crypto provider used for every TLS configuration built here.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

pub(crate) fn load_certs(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let error = |reason: String| TlsError::CertificateLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| error(e.to_string()))?;
    let chain = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| error(e.to_string()))?;

    if chain.is_empty() {
        return Err(error("no PEM certificates found".to_string()));
    }

    Ok(chain)
}

fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let error = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| error(e.to_string()))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| error(e.to_string()))? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }

    Err(error(
        "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
    ))
}

fn not_after(path: &Path, leaf: &CertificateDer<'_>) -> TlsResult<DateTime<Utc>> {
    let error = |reason: String| TlsError::InvalidCertificate {
        path: path.display().to_string(),
        reason,
    };

    let (_, certificate) =
        x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| error(e.to_string()))?;

    DateTime::from_timestamp(certificate.validity().not_after.timestamp(), 0)
        .ok_or_else(|| error("expiry is out of range".to_string()))
}

/// Most recent modification time of the certificate and key files.
fn modified(certificate: &Path, key: &Path) -> std::io::Result<SystemTime> {
    let certificate = std::fs::metadata(certificate)?.modified()?;
    let key = std::fs::metadata(key)?.modified()?;
    Ok(certificate.max(key))
}

/// One loaded certificate chain and key, ready to accept handshakes.
pub struct CertificateMaterial {
    acceptor: TlsAcceptor,
    chain: Vec<CertificateDer<'static>>,
    not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("chain", &self.chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateMaterial {
    /// Load and validate a certificate chain and its private key.
    ///
    /// # Errors
    /// If either file is unreadable or malformed, the leaf is not valid
    /// X.509, or rustls refuses the pair.
    pub fn load(certificate: &Path, key: &Path) -> TlsResult<Self> {
        let chain = load_certs(certificate)?;
        let private_key = load_key(key)?;
        let not_after = not_after(certificate, &chain[0])?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), private_key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            chain,
            not_after,
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// The end-entity certificate
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Fractional days from `now` until the leaf expires; negative once expired
    #[allow(clippy::cast_precision_loss)]
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> f64 {
        (self.not_after - now).num_seconds() as f64 / SECONDS_PER_DAY
    }
}

/// Owner of the active TLS material.
pub struct CertificateStore {
    certificate: PathBuf,
    key: PathBuf,
    active: RwLock<Arc<CertificateMaterial>>,
    seen: Mutex<Option<SystemTime>>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("certificate", &self.certificate)
            .field("key", &self.key)
            .field("active", &*self.active.read())
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    /// Load the configured material.
    ///
    /// # Errors
    /// If the initial material cannot be loaded.
    pub fn load(config: &TlsConfig, observer: Arc<dyn Observer>) -> TlsResult<Self> {
        let seen = modified(&config.certificate, &config.key).ok();
        let material = CertificateMaterial::load(&config.certificate, &config.key)?;

        let store = Self {
            certificate: config.certificate.clone(),
            key: config.key.clone(),
            active: RwLock::new(Arc::new(material)),
            seen: Mutex::new(seen),
            observer,
        };

        store.publish_expiry();
        internal!(
            level = INFO,
            "Loaded certificate {}, expires {} ({:.0} days)",
            store.certificate.display(),
            store.snapshot().not_after().format("%Y-%m-%d"),
            store.days_until_expiry()
        );

        Ok(store)
    }

    /// The material new handshakes should use
    pub fn snapshot(&self) -> Arc<CertificateMaterial> {
        Arc::clone(&self.active.read())
    }

    pub fn days_until_expiry(&self) -> f64 {
        self.snapshot().days_until_expiry(Utc::now())
    }

    fn publish_expiry(&self) {
        self.observer
            .set(Gauge::CertificateExpiryDays, self.days_until_expiry());
    }

    /// Load the files again and make them active.
    ///
    /// The previous material stays active when loading fails.
    ///
    /// # Errors
    /// If the new material cannot be loaded.
    pub fn reload(&self) -> TlsResult<()> {
        match CertificateMaterial::load(&self.certificate, &self.key) {
            Ok(material) => {
                *self.active.write() = Arc::new(material);
                self.observer.increment(Counter::CertificateReloads);
                self.publish_expiry();

                internal!(
                    level = INFO,
                    "Reloaded certificate {}, expires in {:.0} days",
                    self.certificate.display(),
                    self.days_until_expiry()
                );
                Ok(())
            }
            Err(err) => {
                self.observer.increment(Counter::CertificateReloadErrors);
                internal!(
                    level = ERROR,
                    "Failed to reload certificate {}: {err}; keeping the current one",
                    self.certificate.display()
                );
                Err(err)
            }
        }
    }

    /// Reload if either file changed since it was last seen.
    ///
    /// A change is only acted on once, so a broken file is not retried
    /// until it changes again.
    ///
    /// # Errors
    /// If the files changed and the new material cannot be loaded.
    pub fn poll(&self) -> TlsResult<bool> {
        let current = match modified(&self.certificate, &self.key) {
            Ok(current) => current,
            Err(err) => {
                internal!(
                    level = WARN,
                    "Unable to stat {} or {}: {err}",
                    self.certificate.display(),
                    self.key.display()
                );
                return Ok(false);
            }
        };

        {
            let mut seen = self.seen.lock();
            if *seen == Some(current) {
                return Ok(false);
            }
            *seen = Some(current);
        }

        self.reload().map(|()| true)
    }

    /// Poll for changes every `interval` until shutdown.
    pub async fn watch(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        internal!(
            level = DEBUG,
            "Watching {} every {interval:?}",
            self.certificate.display()
        );

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!("Certificate watcher stopping");
                        return;
                    }
                }

                _ = ticker.tick() => {
                    // Failures are reported by `reload`.
                    let _ = self.poll();
                }
            }
        }
    }
}
