// Event Codec
//
// Events are stored as (type code, bytes). Decoding goes through a static
// table from type code to decode function, filled once at startup.

use std::collections::HashMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::log::{Event, LogRow};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode `{type_code}`: {source}")]
    Encode {
        type_code: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode `{type_code}`: {source}")]
    Decode {
        type_code: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no decoder registered for event type `{0}`")]
    UnknownType(String),
}

/// A domain event that knows its stable type code and how to encode itself.
pub trait EventPayload: Clone + Debug + Send + Sync + 'static {
    fn type_code(&self) -> &'static str;

    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// JSON-encode one event body under `type_code`.
pub fn encode_json<T: Serialize>(type_code: &str, value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|source| CodecError::Encode {
        type_code: type_code.to_string(),
        source,
    })
}

type DecodeFn<E> = Box<dyn Fn(&[u8]) -> Result<E, serde_json::Error> + Send + Sync>;

pub struct EventCodec<E> {
    decoders: HashMap<&'static str, DecodeFn<E>>,
}

impl<E: EventPayload> Default for EventCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventPayload> EventCodec<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the body type `T` stored under `type_code`, and how it
    /// lifts into the aggregate's event type.
    pub fn register<T, F>(mut self, type_code: &'static str, lift: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.decoders.insert(
            type_code,
            Box::new(move |bytes: &[u8]| serde_json::from_slice::<T>(bytes).map(&lift)),
        );
        self
    }

    pub fn contains(&self, type_code: &str) -> bool {
        self.decoders.contains_key(type_code)
    }

    pub fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        event.encode()
    }

    pub fn decode(&self, type_code: &str, bytes: &[u8]) -> Result<E, CodecError> {
        let decoder = self
            .decoders
            .get(type_code)
            .ok_or_else(|| CodecError::UnknownType(type_code.to_string()))?;
        decoder(bytes).map_err(|source| CodecError::Decode {
            type_code: type_code.to_string(),
            source,
        })
    }

    /// Decode a stored row into an event addressed to `aggregate_id`.
    pub fn decode_row<K: Clone>(
        &self,
        aggregate_id: &K,
        row: &LogRow,
    ) -> Result<Event<K, E>, CodecError> {
        Ok(Event {
            aggregate_id: aggregate_id.clone(),
            version: row.version,
            timestamp: row.timestamp,
            payload: self.decode(&row.type_code, &row.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Shape {
        Renamed(Renamed),
    }

    impl EventPayload for Shape {
        fn type_code(&self) -> &'static str {
            match self {
                Shape::Renamed(_) => "shape.renamed",
            }
        }

        fn encode(&self) -> Result<Vec<u8>, CodecError> {
            match self {
                Shape::Renamed(body) => encode_json(self.type_code(), body),
            }
        }
    }

    fn codec() -> EventCodec<Shape> {
        EventCodec::new().register("shape.renamed", Shape::Renamed)
    }

    #[test]
    fn decodes_registered_type() {
        let codec = codec();
        let event = Shape::Renamed(Renamed { name: "disc".into() });
        let bytes = codec.encode(&event).unwrap();

        assert!(codec.contains("shape.renamed"));
        assert_eq!(codec.decode("shape.renamed", &bytes).unwrap(), event);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = codec().decode("shape.deleted", b"{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(code) if code == "shape.deleted"));
    }

    #[test]
    fn corrupt_body_is_a_decode_error() {
        let err = codec().decode("shape.renamed", b"not json").unwrap_err();
        assert!(err.to_string().contains("shape.renamed"));
    }

    #[test]
    fn row_metadata_is_carried_over() {
        let row = LogRow {
            aggregate_id: "s-1".into(),
            token: String::new(),
            type_code: "shape.renamed".into(),
            payload: br#"{"name":"ring"}"#.to_vec(),
            version: 7,
            timestamp: 1_000,
        };

        let event = codec().decode_row(&"s-1".to_string(), &row).unwrap();
        assert_eq!(event.version, 7);
        assert_eq!(event.timestamp, 1_000);
        assert_eq!(event.payload, Shape::Renamed(Renamed { name: "ring".into() }));
    }
}
