//! Framing and decoding of the gateway's JSON wire protocol.
//!
//! Every message in either direction is a single JSON object. Inbound
//! objects are cut out of the byte stream with a streaming parser, so a
//! message split over several reads or several messages in one read are
//! both handled. Outbound replies are terminated with a newline.
//!
//! Two request kinds exist: authentication (`{"secret": ...}`) and email
//! (`{"to": [...], "subject": ..., "body": ...}`). A frame may carry a
//! `"type"` of `"auth"` or `"email"`, which is then authoritative. Untagged
//! frames are classified by trial: a non-empty string `secret` makes an
//! authentication frame, anything else is read as an email request. An
//! untagged email request that happens to carry a non-empty `secret` is
//! therefore read as authentication.

use mailgate_common::{AuthCredential, EmailRequest};
use serde::{Deserialize, Serialize, de::IgnoredAny};
use serde_json::{Map, Value};

use crate::error::DecodeError;

pub const AUTH_SUCCESS: &str = "Authentication successful";
pub const AUTH_INVALID: &str = "Invalid authentication";
pub const AUTH_REQUIRED: &str = "Authentication required";
pub const ALREADY_AUTHENTICATED: &str = "Already authenticated";
pub const EMAIL_QUEUED: &str = "Email queued successfully";
pub const EMAIL_INVALID: &str = "Invalid email data format";
pub const QUEUE_FAILED: &str = "Failed to queue email";
pub const FRAME_TOO_LARGE: &str = "Message too large";

const TYPE_FIELD: &str = "type";

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Auth(AuthCredential),
    Email(EmailRequest),
}

/// A reply written back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Message(String),
    Error(String),
}

impl Reply {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error(text.into())
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Message(text) | Self::Error(text) => text,
        }
    }

    /// Serialize as one newline-terminated JSON object.
    ///
    /// # Errors
    /// If serialization fails.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Auth,
    Email,
}

fn parse_object(frame: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(frame) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(DecodeError::Malformed(format!(
            "expected a JSON object, found {}",
            kind_of(&other)
        ))),
        Err(err) => Err(DecodeError::Malformed(err.to_string())),
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn explicit_kind(object: &Map<String, Value>) -> Result<Option<Kind>, DecodeError> {
    match object.get(TYPE_FIELD) {
        None => Ok(None),
        Some(Value::String(tag)) => match tag.as_str() {
            "auth" => Ok(Some(Kind::Auth)),
            "email" => Ok(Some(Kind::Email)),
            _ => Err(DecodeError::UnknownType(tag.clone())),
        },
        Some(other) => Err(DecodeError::UnknownType(other.to_string())),
    }
}

fn has_secret(object: &Map<String, Value>) -> bool {
    matches!(object.get("secret"), Some(Value::String(secret)) if !secret.is_empty())
}

/// Classify a frame received before the connection is authenticated.
///
/// # Errors
/// If the frame is not a JSON object, carries an unknown `type`, or its
/// fields have the wrong types for its kind.
pub fn classify(frame: &[u8]) -> Result<Frame, DecodeError> {
    let object = parse_object(frame)?;

    let kind = match explicit_kind(&object)? {
        Some(kind) => kind,
        None if has_secret(&object) => Kind::Auth,
        None => Kind::Email,
    };

    let value = Value::Object(object);
    Ok(match kind {
        Kind::Auth => Frame::Auth(AuthCredential::deserialize(value)?),
        Kind::Email => Frame::Email(EmailRequest::deserialize(value)?),
    })
}

/// Decode a frame received after authentication.
///
/// Untagged frames are always read as email requests.
///
/// # Errors
/// If the frame is not a JSON object, is explicitly tagged as an
/// authentication frame, or is not shaped like an email request.
pub fn decode_request(frame: &[u8]) -> Result<EmailRequest, DecodeError> {
    let object = parse_object(frame)?;

    match explicit_kind(&object)? {
        Some(Kind::Auth) => Err(DecodeError::AlreadyAuthenticated),
        Some(Kind::Email) | None => Ok(EmailRequest::deserialize(Value::Object(object))?),
    }
}

/// One unit produced by a [`FrameDecoder`].
#[derive(Debug)]
pub enum Decoded {
    /// The bytes of one complete JSON value.
    Frame(Vec<u8>),
    /// Bytes that can never form a JSON object; they have been discarded.
    Malformed(DecodeError),
}

enum Parsed {
    Complete(usize),
    Incomplete,
    Invalid(String),
}

/// Cuts complete JSON objects out of a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    pub const fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Garbage is discarded up to and including the next newline, or
    /// entirely when there is none.
    ///
    /// # Errors
    /// If an incomplete frame has grown beyond the limit.
    pub fn next_frame(&mut self) -> Result<Option<Decoded>, DecodeError> {
        let start = self
            .buffer
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..start);

        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };

        if first != b'{' {
            self.discard_line();
            return Ok(Some(Decoded::Malformed(DecodeError::Malformed(
                "expected a JSON object".to_string(),
            ))));
        }

        let parsed = {
            let mut values =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<IgnoredAny>();

            match values.next() {
                Some(Ok(IgnoredAny)) => Parsed::Complete(values.byte_offset()),
                Some(Err(err)) if !err.is_eof() => Parsed::Invalid(err.to_string()),
                Some(Err(_)) | None => Parsed::Incomplete,
            }
        };

        match parsed {
            Parsed::Complete(end) if end > self.limit => {
                self.buffer.drain(..end);
                Err(DecodeError::TooLarge { limit: self.limit })
            }
            Parsed::Complete(end) => Ok(Some(Decoded::Frame(self.buffer.drain(..end).collect()))),
            Parsed::Incomplete if self.buffer.len() > self.limit => {
                self.buffer.clear();
                Err(DecodeError::TooLarge { limit: self.limit })
            }
            Parsed::Incomplete => Ok(None),
            Parsed::Invalid(reason) => {
                self.discard_line();
                Ok(Some(Decoded::Malformed(DecodeError::Malformed(reason))))
            }
        }
    }

    fn discard_line(&mut self) {
        match self.buffer.iter().position(|&byte| byte == b'\n') {
            Some(newline) => {
                self.buffer.drain(..=newline);
            }
            None => self.buffer.clear(),
        }
    }
}
