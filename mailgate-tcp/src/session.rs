use std::{net::SocketAddr, sync::Arc};

use mailgate_common::{
    Counter, FiniteStateMachine, Observer, error::SessionError, incoming, internal,
};
use mailgate_queue::Publisher;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{self, Decoded, FrameDecoder, Reply},
    config::Timeouts,
    connection::Connection,
    error::DecodeError,
    state::{Action, Authentication, Context, Input, State},
};

const READ_BUFFER: usize = 8192;

/// Everything a session needs that is shared by all connections of a listener.
#[derive(Debug)]
pub struct SessionConfig {
    pub secret: Arc<str>,
    pub timeouts: Timeouts,
    pub max_frame_bytes: usize,
    pub publisher: Publisher,
    pub observer: Arc<dyn Observer>,
}

/// One client connection, from its first frame until it closes.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    decoder: FrameDecoder,
    state: State,
    context: Context,
    config: Arc<SessionConfig>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(peer: SocketAddr, connection: Connection<Stream>, config: Arc<SessionConfig>) -> Self {
        Self {
            peer,
            connection,
            decoder: FrameDecoder::new(config.max_frame_bytes),
            state: State::default(),
            context: Context::new(Arc::clone(&config.secret)),
            config,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Serve the connection until the peer leaves or the protocol closes it.
    /// Stopping the listener does not end a running session.
    ///
    /// # Errors
    /// If the peer idles too long, sends an oversized frame, or the
    /// connection fails.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer, tls = self.connection.is_secure()))]
    pub async fn run(mut self) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.serve().await;
        self.connection.shutdown().await;

        match &result {
            Ok(()) => internal!("Connection closed"),
            Err(err) if err.is_client_error() => {
                internal!(level = DEBUG, "Connection closed: {err}");
            }
            Err(err) => internal!(level = WARN, "Connection failed: {err}"),
        }

        result
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let mut buf = vec![0; READ_BUFFER];
        let idle = self.config.timeouts.idle();

        loop {
            while let Some(decoded) = self.next_frame().await? {
                let input = match decoded {
                    Decoded::Frame(frame) => Input::Frame(frame),
                    Decoded::Malformed(err) => Input::Malformed(err),
                };

                self.step(input).await?;
                if self.state == State::Closed {
                    return Ok(());
                }
            }

            match tokio::time::timeout(idle, self.connection.receive(&mut buf)).await {
                Err(_) => return Err(SessionError::Timeout(idle.as_secs())),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(received)) => {
                    incoming!("{}", String::from_utf8_lossy(&buf[..received]).trim_end());
                    self.decoder.extend(&buf[..received]);
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Decoded>, SessionError> {
        match self.decoder.next_frame() {
            Ok(decoded) => Ok(decoded),
            Err(err @ DecodeError::TooLarge { .. }) => {
                self.reply(Reply::error(codec::FRAME_TOO_LARGE)).await?;
                Err(SessionError::Protocol(err.to_string()))
            }
            Err(err) => Err(SessionError::Protocol(err.to_string())),
        }
    }

    async fn step(&mut self, input: Input) -> Result<(), SessionError> {
        self.state = self.state.transition(input, &mut self.context);

        match self.context.authentication.take() {
            Some(Authentication::Accepted) => {
                internal!(level = DEBUG, "Authenticated");
                self.config.observer.increment(Counter::AuthSuccess);
            }
            Some(Authentication::Rejected) => {
                internal!(level = WARN, "Rejected invalid secret");
                self.config.observer.increment(Counter::AuthFailure);
            }
            None => {}
        }

        let reply = match self.context.action.take() {
            Some(Action::Reply(reply)) => reply,
            Some(Action::Publish(request)) => match self.config.publisher.publish(request).await {
                Ok(()) => Reply::message(codec::EMAIL_QUEUED),
                Err(err) if err.is_validation() => Reply::error(err.to_string()),
                Err(_) => Reply::error(codec::QUEUE_FAILED),
            },
            None => return Ok(()),
        };

        self.reply(reply).await
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), SessionError> {
        self.connection
            .send(&reply, self.config.timeouts.write())
            .await
            .map_err(SessionError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mailgate_common::RecordingObserver;
    use mailgate_queue::MemoryQueue;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::codec::{AUTH_INVALID, AUTH_REQUIRED, AUTH_SUCCESS, EMAIL_QUEUED};

    struct Harness {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        queue: MemoryQueue,
        observer: RecordingObserver,
        session: tokio::task::JoinHandle<Result<(), SessionError>>,
    }

    impl Harness {
        fn start(max_frame_bytes: usize) -> Self {
            Self::with_timeouts(max_frame_bytes, Timeouts::default())
        }

        fn with_timeouts(max_frame_bytes: usize, timeouts: Timeouts) -> Self {
            let queue = MemoryQueue::new();
            let observer = RecordingObserver::new();
            let config = Arc::new(SessionConfig {
                secret: Arc::from("topsecret"),
                timeouts,
                max_frame_bytes,
                publisher: Publisher::new(Arc::new(queue.clone()), Arc::new(observer.clone())),
                observer: Arc::new(observer.clone()),
            });

            let (client, server) = tokio::io::duplex(4096);
            let session = Session::new(
                "127.0.0.1:4000".parse().unwrap(),
                Connection::Plain(server),
                config,
            );
            let (reader, writer) = tokio::io::split(client);

            Self {
                reader: BufReader::new(reader),
                writer,
                queue,
                observer,
                session: tokio::spawn(session.run()),
            }
        }

        async fn send(&mut self, bytes: &str) {
            self.writer.write_all(bytes.as_bytes()).await.unwrap();
        }

        async fn reply(&mut self) -> Option<Reply> {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await.unwrap();
            (read > 0).then(|| serde_json::from_str(&line).unwrap())
        }

        async fn authenticate(&mut self) {
            self.send("{\"secret\":\"topsecret\"}\n").await;
            assert_eq!(self.reply().await, Some(Reply::message(AUTH_SUCCESS)));
        }
    }

    #[tokio::test]
    async fn authenticate_then_queue() {
        let mut harness = Harness::start(64 * 1024);
        harness.authenticate().await;

        harness
            .send(r#"{"to":["a@example.com"],"subject":"Hi","body":"Hello"}"#)
            .await;
        assert_eq!(harness.reply().await, Some(Reply::message(EMAIL_QUEUED)));

        assert_eq!(harness.queue.len(), 1);
        assert_eq!(harness.observer.count(Counter::AuthSuccess), 1);
        assert_eq!(harness.observer.count(Counter::EmailsQueued), 1);
    }

    #[tokio::test]
    async fn wrong_secret_closes_connection() {
        let mut harness = Harness::start(64 * 1024);
        harness.send(r#"{"secret":"guess"}"#).await;

        assert_eq!(harness.reply().await, Some(Reply::error(AUTH_INVALID)));
        assert_eq!(harness.reply().await, None);
        harness.session.await.unwrap().unwrap();
        assert_eq!(harness.observer.count(Counter::AuthFailure), 1);
    }

    #[tokio::test]
    async fn email_before_auth_is_refused() {
        let mut harness = Harness::start(64 * 1024);
        harness
            .send(r#"{"to":["a@example.com"],"subject":"Hi","body":"Hello"}"#)
            .await;

        assert_eq!(harness.reply().await, Some(Reply::error(AUTH_REQUIRED)));
        assert_eq!(harness.reply().await, None);
        assert!(harness.queue.is_empty());
        assert_eq!(harness.observer.count(Counter::AuthFailure), 0);
    }

    #[tokio::test]
    async fn coalesced_frames_get_one_reply_each() {
        let mut harness = Harness::start(64 * 1024);
        harness
            .send(concat!(
                r#"{"secret":"topsecret"}"#,
                r#"{"to":["a@example.com"],"subject":"1","body":"x"}"#,
                "\n",
                r#"{"to":["b@example.com"],"subject":"2","body":"y"}"#,
            ))
            .await;

        assert_eq!(harness.reply().await, Some(Reply::message(AUTH_SUCCESS)));
        assert_eq!(harness.reply().await, Some(Reply::message(EMAIL_QUEUED)));
        assert_eq!(harness.reply().await, Some(Reply::message(EMAIL_QUEUED)));
        assert_eq!(harness.queue.len(), 2);
    }

    #[tokio::test]
    async fn split_frame_is_reassembled() {
        let mut harness = Harness::start(64 * 1024);
        harness.send(r#"{"sec"#).await;
        tokio::task::yield_now().await;
        harness.send(r#"ret":"topsecret"}"#).await;

        assert_eq!(harness.reply().await, Some(Reply::message(AUTH_SUCCESS)));
    }

    #[tokio::test]
    async fn invalid_requests_keep_connection_open() {
        let mut harness = Harness::start(64 * 1024);
        harness.authenticate().await;

        harness.send(r#"{"to":[],"subject":"Hi","body":"Hello"}"#).await;
        assert_eq!(
            harness.reply().await,
            Some(Reply::error("Recipient list is empty"))
        );

        harness.send("not json\n").await;
        assert_eq!(
            harness.reply().await,
            Some(Reply::error(codec::EMAIL_INVALID))
        );

        harness
            .send(r#"{"to":["a@example.com"],"subject":"Hi","body":"Hello"}"#)
            .await;
        assert_eq!(harness.reply().await, Some(Reply::message(EMAIL_QUEUED)));
        assert_eq!(harness.observer.count(Counter::EmailErrors), 0);
    }

    #[tokio::test]
    async fn queue_failure_is_reported() {
        let mut harness = Harness::start(64 * 1024);
        harness.authenticate().await;
        harness.queue.fail_publishes(Some("broker down"));

        harness
            .send(r#"{"to":["a@example.com"],"subject":"Hi","body":"Hello"}"#)
            .await;
        assert_eq!(
            harness.reply().await,
            Some(Reply::error(codec::QUEUE_FAILED))
        );
        assert_eq!(harness.observer.count(Counter::EmailErrors), 1);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let mut harness = Harness::start(64);
        harness.authenticate().await;

        let body = "x".repeat(128);
        harness
            .send(&format!(r#"{{"to":["a@example.com"],"subject":"Hi","body":"{body}"}}"#))
            .await;

        assert_eq!(
            harness.reply().await,
            Some(Reply::error("Message too large"))
        );
        assert_eq!(harness.reply().await, None);
        assert!(matches!(
            harness.session.await.unwrap(),
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let timeouts = Timeouts {
            idle_secs: 1,
            ..Timeouts::default()
        };
        let mut harness = Harness::with_timeouts(64 * 1024, timeouts);
        harness.authenticate().await;

        let result = tokio::time::timeout(Duration::from_secs(5), &mut harness.session)
            .await
            .unwrap();
        assert!(matches!(result.unwrap(), Err(SessionError::Timeout(1))));
        assert_eq!(harness.reply().await, None);
    }
}
