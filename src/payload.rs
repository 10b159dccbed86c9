//! Versioned, schema-tagged payload encoding.
//!
//! Every message body is persisted as a small JSON envelope:
//!
//! ```json
//! { "schema": "order.created", "version": 2, "data": { "order_id": "123" } }
//! ```
//!
//! The schema tag names the payload type independently of any Rust type path, so
//! stored messages stay decodable when code is renamed or moved. Types opt in by
//! implementing [`OutboxPayload`]. Decoding rejects envelopes tagged with another
//! schema or with a version newer than the decoding type understands; older
//! versions are decoded as-is and rely on serde defaults for added fields.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Error;

/// A domain type that can travel through the outbox.
pub trait OutboxPayload: Serialize + DeserializeOwned {
    /// Stable symbolic name of the payload type, e.g. `order.created`.
    const SCHEMA: &'static str;

    /// Current version of the payload layout.
    const VERSION: u32 = 1;
}

/// The serialized form of a message body, as stored in the outbox tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub schema: String,
    pub version: u32,
    pub data: serde_json::Value,
}

impl Payload {
    pub fn new(schema: impl Into<String>, version: u32, data: serde_json::Value) -> Self {
        Self {
            schema: schema.into(),
            version,
            data,
        }
    }

    pub fn encode<T: OutboxPayload>(value: &T) -> Result<Self, Error> {
        Ok(Self {
            schema: T::SCHEMA.to_owned(),
            version: T::VERSION,
            data: serde_json::to_value(value)?,
        })
    }

    pub fn decode<T: OutboxPayload>(&self) -> Result<T, Error> {
        if self.schema != T::SCHEMA {
            return Err(Error::SchemaMismatch {
                expected: T::SCHEMA.to_owned(),
                found: self.schema.clone(),
            });
        }

        if self.version > T::VERSION {
            return Err(Error::UnsupportedVersion {
                schema: self.schema.clone(),
                found: self.version,
                supported: T::VERSION,
            });
        }

        Ok(T::deserialize(&self.data)?)
    }

    /// Whether this payload carries the schema of `T`.
    pub fn is<T: OutboxPayload>(&self) -> bool {
        self.schema == T::SCHEMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        #[serde(default)]
        total_cents: u64,
    }

    impl OutboxPayload for OrderCreated {
        const SCHEMA: &'static str = "order.created";
        const VERSION: u32 = 2;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCancelled {
        order_id: String,
    }

    impl OutboxPayload for OrderCancelled {
        const SCHEMA: &'static str = "order.cancelled";
    }

    #[test]
    fn test_encode_tags_schema_and_version() {
        let payload = Payload::encode(&OrderCreated {
            order_id: "123".to_owned(),
            total_cents: 4200,
        })
        .unwrap();

        assert_eq!(payload.schema, "order.created");
        assert_eq!(payload.version, 2);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "schema": "order.created",
                "version": 2,
                "data": { "order_id": "123", "total_cents": 4200 }
            })
        );
    }

    #[test]
    fn test_decode_older_version_uses_defaults() {
        let payload = Payload::new("order.created", 1, serde_json::json!({ "order_id": "9" }));

        let decoded: OrderCreated = payload.decode().unwrap();

        assert_eq!(
            decoded,
            OrderCreated {
                order_id: "9".to_owned(),
                total_cents: 0,
            }
        );
    }

    #[test]
    fn test_decode_rejects_newer_version() {
        let payload = Payload::new("order.created", 3, serde_json::json!({ "order_id": "9" }));

        match payload.decode::<OrderCreated>() {
            Err(Error::UnsupportedVersion {
                found, supported, ..
            }) => {
                assert_eq!(found, 3);
                assert_eq!(supported, 2);
            }
            other => panic!("Expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_other_schema() {
        let payload = Payload::encode(&OrderCancelled {
            order_id: "1".to_owned(),
        })
        .unwrap();

        assert!(payload.is::<OrderCancelled>());
        assert!(!payload.is::<OrderCreated>());
        assert!(matches!(
            payload.decode::<OrderCreated>(),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_malformed_data() {
        let payload = Payload::new("order.cancelled", 1, serde_json::json!({ "id": 1 }));

        assert!(matches!(
            payload.decode::<OrderCancelled>(),
            Err(Error::Serialization { .. })
        ));
    }
}
