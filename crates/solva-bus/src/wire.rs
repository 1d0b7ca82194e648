// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire codec for stream entries.
//!
//! Redis stream values are flat string maps, so every top-level field is
//! stringified on the way out: plain strings pass through, numbers and
//! booleans use their display form, and structured values (objects,
//! arrays) are JSON-encoded into a single string.  On the way in, only
//! values that look structured (`{`/`[` prefix) are JSON-parsed, with a
//! raw-string fallback; scalar fields stay strings and typed struct
//! fields accept both forms through the lenient deserializers in [`de`].
//!
//! Unknown fields survive a decode untouched: [`decode`] returns the full
//! decoded object next to the typed payload so relays can forward fields
//! they do not model.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CodecError;
use crate::messages::Envelope;

/// A typed message decoded from a stream entry, keeping the raw decoded
/// object alongside so unknown fields can be forwarded verbatim.
#[derive(Debug, Clone)]
pub struct Decoded<P> {
    pub envelope: Envelope,
    pub payload: P,
    /// The full decoded field object, including fields the payload type
    /// does not model.
    pub object: Map<String, Value>,
}

/// Encode an envelope plus payload into the flat string map the bus wants.
///
/// Payload fields win over envelope fields on collision (e.g. the
/// `processing_log` payload carries its own `agent_name`).
pub fn encode(
    envelope: &Envelope,
    payload: &impl Serialize,
) -> Result<BTreeMap<String, String>, CodecError> {
    let value =
        serde_json::to_value(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(CodecError::NotAnObject);
    };

    let mut put = |key: &str, v: Option<&String>| {
        if let Some(v) = v {
            object
                .entry(key.to_string())
                .or_insert_with(|| Value::String(v.clone()));
        }
    };
    put("target_agent", envelope.target_agent.as_ref());
    put("session_id", envelope.session_id.as_ref());
    put("request_id", envelope.request_id.as_ref());
    put("agent_name", envelope.agent_name.as_ref());
    object
        .entry("timestamp".to_string())
        .or_insert_with(|| Value::String(envelope.timestamp.clone()));

    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let s = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            structured => serde_json::to_string(&structured)
                .map_err(|e| CodecError::Malformed(e.to_string()))?,
        };
        fields.insert(key, s);
    }
    Ok(fields)
}

/// Decode a flat string map into a JSON object, JSON-parsing only the
/// values that look structured and falling back to the raw string.
pub fn decode_object(fields: &BTreeMap<String, String>) -> Map<String, Value> {
    let mut object = Map::new();
    for (key, raw) in fields {
        let trimmed = raw.trim_start();
        let value = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        } else {
            Value::String(raw.clone())
        };
        object.insert(key.clone(), value);
    }
    object
}

/// Decode a stream entry into a typed payload plus its envelope.
pub fn decode<P: DeserializeOwned>(
    fields: &BTreeMap<String, String>,
) -> Result<Decoded<P>, CodecError> {
    let object = decode_object(fields);
    let envelope = Envelope::from_object(&object);
    let payload = serde_json::from_value(Value::Object(object.clone()))
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(Decoded {
        envelope,
        payload,
        object,
    })
}

/// Lenient deserializers for scalar fields that arrive as strings.
pub mod de {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    pub fn u32_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        match NumOrStr::deserialize(d)? {
            NumOrStr::Num(n) => Ok(n as u32),
            NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }

    pub fn f64_lenient<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match NumOrStr::deserialize(d)? {
            NumOrStr::Num(n) => Ok(n),
            NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStr {
        Bool(bool),
        Str(String),
    }

    pub fn opt_bool_lenient<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<bool>, D::Error> {
        match Option::<BoolOrStr>::deserialize(d)? {
            None => Ok(None),
            Some(BoolOrStr::Bool(b)) => Ok(Some(b)),
            Some(BoolOrStr::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" | "" => Ok(Some(false)),
                other => Err(serde::de::Error::custom(format!(
                    "not a boolean: {other}"
                ))),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
