// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serde helpers for captured bodies.
//!
//! Bodies are kept as raw bytes. They serialize as plain text when they are
//! valid UTF-8 and as `{"base64": "..."}` otherwise, so binary payloads
//! survive a trip through the JSONL journal.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BodyRepr {
    Text(String),
    Binary { base64: String },
}

pub fn serialize_body<S>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let repr = body.as_ref().map(|b| match std::str::from_utf8(b) {
        Ok(text) => BodyRepr::Text(text.to_string()),
        Err(_) => BodyRepr::Binary {
            base64: base64::engine::general_purpose::STANDARD.encode(b),
        },
    });
    repr.serialize(serializer)
}

pub fn deserialize_body<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<BodyRepr>::deserialize(deserializer)?;
    match repr {
        None => Ok(None),
        Some(BodyRepr::Text(text)) => Ok(Some(Bytes::from(text))),
        Some(BodyRepr::Binary { base64 }) => base64::engine::general_purpose::STANDARD
            .decode(base64)
            .map(|v| Some(Bytes::from(v)))
            .map_err(serde::de::Error::custom),
    }
}
