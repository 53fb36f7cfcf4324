use serde_json::Value;
use thiserror::Error;

use crate::event::NormalizedEvent;

/// How many times a body may be JSON-decoded while it keeps decoding to a string.
pub const MAX_UNWRAP_DEPTH: usize = 5;

/// Key of the notification envelope that carries the real payload as text.
pub const ENVELOPE_KEY: &str = "Message";

/// Enumeration of reasons a message body is not a usable event.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("envelope Message is not valid JSON: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("envelope Message is not text")]
    EnvelopeNotText,
    #[error("payload decoded to {0}, expected an object")]
    NotAnObject(&'static str),
}

impl NormalizeError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizeError::Malformed(_) => "malformed_json",
            NormalizeError::MalformedEnvelope(_) => "malformed_envelope",
            NormalizeError::EnvelopeNotText => "envelope_not_text",
            NormalizeError::NotAnObject(_) => "not_an_object",
        }
    }
}

/// Decode a queue message body into an event.
///
/// Producers may JSON-encode an already encoded payload, so the body is decoded
/// repeatedly while it yields a string, at most `MAX_UNWRAP_DEPTH` times. An object
/// carrying a `Message` key is a notification envelope: its text is decoded once
/// more and replaces the envelope.
pub fn normalize(body: &str) -> Result<NormalizedEvent, NormalizeError> {
    let mut value = Value::String(body.to_owned());

    for _ in 0..MAX_UNWRAP_DEPTH {
        let Value::String(text) = &value else {
            break;
        };
        value = serde_json::from_str(text).map_err(NormalizeError::Malformed)?;
    }

    if let Value::Object(fields) = &value {
        if let Some(message) = fields.get(ENVELOPE_KEY) {
            let Value::String(text) = message else {
                return Err(NormalizeError::EnvelopeNotText);
            };
            value = serde_json::from_str(text).map_err(NormalizeError::MalformedEnvelope)?;
        }
    }

    match value {
        Value::Object(fields) => Ok(NormalizedEvent::new(fields)),
        other => Err(NormalizeError::NotAnObject(kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
