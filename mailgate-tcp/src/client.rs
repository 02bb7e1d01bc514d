//! Client side of the gateway protocol, used by `mailgate-send` and tests.

use std::{path::PathBuf, sync::Arc};

use mailgate_common::{EmailRequest, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use crate::{
    codec::{Decoded, FrameDecoder, Reply},
    error::{ClientError, DecodeError, TlsError},
    tls,
};

const READ_BUFFER: usize = 4096;
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// How to establish a TLS session with the gateway.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Name the certificate must be valid for.
    pub server_name: String,
    /// PEM bundle of trusted roots. Required unless `accept_invalid_certs`.
    pub ca: Option<PathBuf>,
    /// Skip certificate verification entirely.
    pub accept_invalid_certs: bool,
}

impl TlsOptions {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ca: None,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub fn ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    fn config(&self) -> Result<ClientConfig, TlsError> {
        let provider = tls::provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        if self.accept_invalid_certs {
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
                .with_no_client_auth());
        }

        let mut roots = RootCertStore::empty();
        if let Some(ca) = &self.ca {
            for certificate in tls::load_certs(ca)? {
                roots.add(certificate)?;
            }
        }

        Ok(builder.with_root_certificates(roots).with_no_client_auth())
    }
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A connection to a running gateway.
pub struct GatewayClient {
    stream: Stream,
    decoder: FrameDecoder,
}

impl GatewayClient {
    /// Connect without TLS.
    ///
    /// # Errors
    /// If the connection cannot be established.
    pub async fn connect(address: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self::new(Stream::Plain(stream)))
    }

    /// Connect and complete a TLS handshake.
    ///
    /// # Errors
    /// If the connection or the handshake fails, or the options are unusable.
    pub async fn connect_tls(
        address: impl ToSocketAddrs,
        options: &TlsOptions,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        Self::handshake(stream, options).await
    }

    /// Complete a TLS handshake over an already connected stream.
    ///
    /// # Errors
    /// If the handshake fails or the options are unusable.
    pub async fn handshake(stream: TcpStream, options: &TlsOptions) -> Result<Self, ClientError> {
        let name = ServerName::try_from(options.server_name.clone())
            .map_err(|_| ClientError::ServerName(options.server_name.clone()))?;
        let connector = TlsConnector::from(Arc::new(options.config()?));

        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;

        Ok(Self::new(Stream::Tls(Box::new(stream))))
    }

    fn new(stream: Stream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(MAX_REPLY_BYTES),
        }
    }

    /// The leaf certificate the server presented, in TLS mode.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match &self.stream {
            Stream::Plain(_) => None,
            Stream::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|leaf| leaf.clone().into_owned()),
        }
    }

    /// Present the shared secret.
    ///
    /// # Errors
    /// If the exchange fails. A refused secret is an `Ok` error reply.
    pub async fn authenticate(&mut self, secret: &str) -> Result<Reply, ClientError> {
        let frame = serde_json::to_vec(&serde_json::json!({ "secret": secret }))
            .map_err(crate::error::ConnectionError::from)?;
        self.write(&frame).await?;
        self.reply().await
    }

    /// Submit one email request.
    ///
    /// # Errors
    /// If the exchange fails. A refused request is an `Ok` error reply.
    pub async fn send(&mut self, request: &EmailRequest) -> Result<Reply, ClientError> {
        let frame =
            serde_json::to_vec(request).map_err(crate::error::ConnectionError::from)?;
        self.write(&frame).await?;
        self.reply().await
    }

    /// Write raw bytes followed by a newline.
    ///
    /// # Errors
    /// If the write fails.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        outgoing!("{}", String::from_utf8_lossy(bytes));

        match &mut self.stream {
            Stream::Plain(stream) => {
                stream.write_all(bytes).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await?;
            }
            Stream::Tls(stream) => {
                stream.write_all(bytes).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await?;
            }
        }

        Ok(())
    }

    /// Wait for the next reply.
    ///
    /// # Errors
    /// If the server closes the connection or sends something that is not a reply.
    pub async fn reply(&mut self) -> Result<Reply, ClientError> {
        let mut buf = [0; READ_BUFFER];

        loop {
            match self.decoder.next_frame()? {
                Some(Decoded::Frame(frame)) => {
                    return serde_json::from_slice(&frame)
                        .map_err(|e| ClientError::Reply(DecodeError::from(e)));
                }
                Some(Decoded::Malformed(err)) => return Err(err.into()),
                None => {}
            }

            let received = match &mut self.stream {
                Stream::Plain(stream) => stream.read(&mut buf).await?,
                Stream::Tls(stream) => stream.read(&mut buf).await?,
            };

            if received == 0 {
                return Err(ClientError::Closed);
            }
            self.decoder.extend(&buf[..received]);
        }
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("tls", &matches!(self.stream, Stream::Tls(_)))
            .finish_non_exhaustive()
    }
}
