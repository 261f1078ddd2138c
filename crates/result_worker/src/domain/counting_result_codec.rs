use common::domain::CountingResult;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::error::Category;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Reasons a payload cannot become a CountingResult
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not well-formed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("payload must be a JSON object: {0}")]
    NotAnObject(#[source] serde_json::Error),

    #[error("payload does not match the counting result shape: {0}")]
    InvalidShape(#[source] serde_json::Error),
}

/// Wire shape of a counting result; keys are compared after lowercasing
#[derive(Debug, Deserialize)]
struct CountingResultPayload {
    id: String,
    count: i64,
    #[serde(default)]
    producer: Option<String>,
    #[serde(default)]
    kernel: Option<String>,
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<CountingResultPayload> for CountingResult {
    fn from(payload: CountingResultPayload) -> Self {
        CountingResult {
            id: payload.id,
            count: payload.count,
            producer: payload.producer,
            kernel: payload.kernel,
            framework: payload.framework,
            message: payload.message,
        }
    }
}

/// Top-level JSON object with every key lowercased.
///
/// Keys are folded in payload order, so when two keys differ only in case
/// the later one wins.
struct FoldedObject(Map<String, Value>);

impl<'de> Deserialize<'de> for FoldedObject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FoldedObjectVisitor;

        impl<'de> Visitor<'de> for FoldedObjectVisitor {
            type Value = FoldedObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A>(self, mut access: A) -> Result<FoldedObject, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut folded = Map::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    folded.insert(key.to_lowercase(), value);
                }
                Ok(FoldedObject(folded))
            }
        }

        deserializer.deserialize_map(FoldedObjectVisitor)
    }
}

/// Decode a raw queue payload into a CountingResult.
///
/// The payload must be a UTF-8 JSON object. Keys match record fields
/// regardless of case, unknown keys are ignored and missing auxiliary fields
/// stay empty. Decoding either yields a whole record or an error.
pub fn decode_counting_result(payload: &[u8]) -> Result<CountingResult, DecodeError> {
    let text = std::str::from_utf8(payload)?;

    // Values are untyped here, so a data error can only mean a non-object top level
    let FoldedObject(object) = serde_json::from_str(text).map_err(|e| match e.classify() {
        Category::Data => DecodeError::NotAnObject(e),
        _ => DecodeError::MalformedJson(e),
    })?;

    let payload: CountingResultPayload =
        serde_json::from_value(Value::Object(object)).map_err(DecodeError::InvalidShape)?;

    Ok(CountingResult::from(payload))
}
