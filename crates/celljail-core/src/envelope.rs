//! Result and error envelopes handed back to textual callers.
//!
//! `{"result": <raw>}` embeds already-serialized script output verbatim;
//! `{"error": "<message>"}` escapes the message.

use serde::Serialize;

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
}

/// Wrap raw script output as `{"result": <raw>}`.
///
/// `undefined` is not valid JSON and becomes `null`.
pub fn make_result(raw: &str) -> String {
    let raw = if raw == "undefined" { "null" } else { raw };
    format!(r#"{{"result": {raw}}}"#)
}

/// Wrap a message as `{"error": "<message>"}`.
pub fn make_error(message: &str) -> String {
    serde_json::to_string(&ErrorEnvelope { error: message })
        .unwrap_or_else(|_| r#"{"error":"unserializable error"}"#.to_string())
}

/// Wrap either outcome of a host operation.
pub fn make_outcome<E: std::fmt::Display>(outcome: Result<String, E>) -> String {
    match outcome {
        Ok(raw) => make_result(&raw),
        Err(err) => make_error(&err.to_string()),
    }
}
