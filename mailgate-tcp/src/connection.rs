use std::time::Duration;

use mailgate_common::{internal, outgoing};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{ProtocolVersion, ServerConnection, SupportedCipherSuite},
    server::TlsStream,
};

use crate::{
    codec::Reply,
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
};

/// Negotiated parameters of a TLS connection.
#[derive(Debug)]
pub struct TlsInfo {
    version: Option<ProtocolVersion>,
    cipher: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            cipher: conn.negotiated_cipher_suite(),
        }
    }

    pub fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub fn cipher(&self) -> String {
        self.cipher
            .and_then(|cipher| cipher.suite().as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }
}

/// A client stream, plaintext or after a completed server handshake.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    /// Complete a server handshake on `stream` using `acceptor`.
    ///
    /// # Errors
    /// If the handshake fails.
    pub async fn accept(stream: Stream, acceptor: &TlsAcceptor) -> TlsResult<Self> {
        let stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;

        let info = TlsInfo::of(stream.get_ref().1);
        internal!(
            level = DEBUG,
            "TLS established: proto={} cipher={}",
            info.proto(),
            info.cipher()
        );

        Ok(Self::Tls(Box::new(stream)))
    }

    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Read whatever is available into `buf`; `Ok(0)` means the peer closed.
    ///
    /// # Errors
    /// If the underlying read fails.
    pub async fn receive(&mut self, buf: &mut [u8]) -> ConnectionResult<usize> {
        Ok(match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        })
    }

    /// Write one newline-terminated reply, giving up after `timeout`.
    ///
    /// # Errors
    /// If the reply cannot be encoded, the write fails, or it times out.
    pub async fn send(&mut self, reply: &Reply, timeout: Duration) -> ConnectionResult<()> {
        let bytes = reply.encode()?;
        outgoing!("{}", String::from_utf8_lossy(&bytes).trim_end());

        let write = async {
            match self {
                Self::Plain(stream) => {
                    stream.write_all(&bytes).await?;
                    stream.flush().await
                }
                Self::Tls(stream) => {
                    stream.write_all(&bytes).await?;
                    stream.flush().await
                }
            }
        };

        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| ConnectionError::WriteTimeout(timeout.as_secs()))?
            .map_err(ConnectionError::from)
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) {
        let result = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };

        if let Err(err) = result {
            internal!("Error closing connection: {err}");
        }
    }
}
