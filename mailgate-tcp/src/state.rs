use std::sync::Arc;

use mailgate_common::{EmailRequest, FiniteStateMachine};

use crate::{
    codec::{self, AUTH_INVALID, AUTH_REQUIRED, AUTH_SUCCESS, EMAIL_INVALID, Frame, Reply},
    error::DecodeError,
};

/// Where a connection is in the authenticate-then-relay protocol.
///
/// The first frame must authenticate the connection. A wrong secret or any
/// other first frame closes it. Afterwards every frame is an email request
/// and the connection stays open until the peer leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Unauthenticated,
    Authenticated,
    Relaying,
    Closed,
}

impl State {
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Relaying)
    }
}

/// What the session received.
#[derive(Debug)]
pub enum Input {
    Frame(Vec<u8>),
    Malformed(DecodeError),
}

/// What the session must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write the reply.
    Reply(Reply),
    /// Hand the request to the producer and reply with the outcome.
    Publish(EmailRequest),
}

/// Result of an authentication attempt, for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authentication {
    Accepted,
    Rejected,
}

#[derive(Debug)]
pub struct Context {
    secret: Arc<str>,
    pub action: Option<Action>,
    pub authentication: Option<Authentication>,
}

impl Context {
    pub const fn new(secret: Arc<str>) -> Self {
        Self {
            secret,
            action: None,
            authentication: None,
        }
    }
}

impl FiniteStateMachine for State {
    type Input = Input;
    type Context = Context;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        match (self, input) {
            (Self::Closed, _) => Self::Closed,

            (Self::Unauthenticated, Input::Frame(frame)) => match codec::classify(&frame) {
                Ok(Frame::Auth(credential)) if credential.matches(&context.secret) => {
                    context.authentication = Some(Authentication::Accepted);
                    context.action = Some(Action::Reply(Reply::message(AUTH_SUCCESS)));
                    Self::Authenticated
                }
                Ok(Frame::Auth(_)) => {
                    context.authentication = Some(Authentication::Rejected);
                    context.action = Some(Action::Reply(Reply::error(AUTH_INVALID)));
                    Self::Closed
                }
                Ok(Frame::Email(_)) | Err(_) => {
                    context.action = Some(Action::Reply(Reply::error(AUTH_REQUIRED)));
                    Self::Closed
                }
            },

            (Self::Unauthenticated, Input::Malformed(_)) => {
                context.action = Some(Action::Reply(Reply::error(AUTH_REQUIRED)));
                Self::Closed
            }

            (Self::Authenticated | Self::Relaying, Input::Frame(frame)) => {
                context.action = Some(match codec::decode_request(&frame) {
                    Ok(request) => Action::Publish(request),
                    Err(DecodeError::AlreadyAuthenticated) => {
                        Action::Reply(Reply::error(codec::ALREADY_AUTHENTICATED))
                    }
                    Err(_) => Action::Reply(Reply::error(EMAIL_INVALID)),
                });
                Self::Relaying
            }

            (Self::Authenticated | Self::Relaying, Input::Malformed(_)) => {
                context.action = Some(Action::Reply(Reply::error(EMAIL_INVALID)));
                Self::Relaying
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> Context {
        Context::new(Arc::from("topsecret"))
    }

    fn frame(json: &str) -> Input {
        Input::Frame(json.as_bytes().to_vec())
    }

    fn reply(context: &mut Context) -> Reply {
        match context.action.take() {
            Some(Action::Reply(reply)) => reply,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[test]
    fn correct_secret_authenticates() {
        let mut context = context();
        let state = State::default().transition(frame(r#"{"secret":"topsecret"}"#), &mut context);

        assert_eq!(state, State::Authenticated);
        assert_eq!(context.authentication, Some(Authentication::Accepted));
        assert_eq!(reply(&mut context), Reply::message(AUTH_SUCCESS));
    }

    #[test]
    fn wrong_secret_closes() {
        let mut context = context();
        let state = State::default().transition(frame(r#"{"secret":"guess"}"#), &mut context);

        assert_eq!(state, State::Closed);
        assert_eq!(context.authentication, Some(Authentication::Rejected));
        assert_eq!(reply(&mut context), Reply::error(AUTH_INVALID));
    }

    #[test]
    fn email_before_auth_closes() {
        let mut context = context();
        let state = State::default().transition(
            frame(r#"{"to":[],"subject":"x","body":"y"}"#),
            &mut context,
        );

        assert_eq!(state, State::Closed);
        assert_eq!(context.authentication, None);
        assert_eq!(reply(&mut context), Reply::error(AUTH_REQUIRED));
    }

    #[test]
    fn garbage_before_auth_closes() {
        let mut context = context();
        let state = State::default().transition(
            Input::Malformed(DecodeError::Malformed("expected a JSON object".to_string())),
            &mut context,
        );

        assert_eq!(state, State::Closed);
        assert_eq!(reply(&mut context), Reply::error(AUTH_REQUIRED));
    }

    #[test]
    fn authenticated_frames_are_published() {
        let mut context = context();
        let state = State::Authenticated.transition(
            frame(r#"{"to":["a@example.com"],"subject":"Hi","body":"Hello"}"#),
            &mut context,
        );

        assert_eq!(state, State::Relaying);
        assert_eq!(
            context.action,
            Some(Action::Publish(EmailRequest::new(
                ["a@example.com"],
                "Hi",
                "Hello"
            )))
        );
    }

    #[test]
    fn resent_secret_is_an_email_without_recipients() {
        let mut context = context();
        let state = State::Relaying.transition(frame(r#"{"secret":"topsecret"}"#), &mut context);

        assert_eq!(state, State::Relaying);
        assert_eq!(context.authentication, None);
        assert_eq!(
            context.action,
            Some(Action::Publish(EmailRequest::default()))
        );
    }

    #[test]
    fn tagged_reauthentication_is_refused() {
        let mut context = context();
        let state = State::Relaying.transition(
            frame(r#"{"type":"auth","secret":"topsecret"}"#),
            &mut context,
        );

        assert_eq!(state, State::Relaying);
        assert_eq!(
            reply(&mut context),
            Reply::error(codec::ALREADY_AUTHENTICATED)
        );
    }

    #[test]
    fn malformed_relay_frame_keeps_connection() {
        let mut context = context();
        let state = State::Relaying.transition(frame(r#"{"to":42}"#), &mut context);

        assert_eq!(state, State::Relaying);
        assert_eq!(reply(&mut context), Reply::error(EMAIL_INVALID));
        assert!(state.is_authenticated());
    }

    #[test]
    fn closed_is_terminal() {
        let mut context = context();
        let state = State::Closed.transition(frame(r#"{"secret":"topsecret"}"#), &mut context);

        assert_eq!(state, State::Closed);
        assert!(context.action.is_none());
    }
}
