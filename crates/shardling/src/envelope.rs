use crate::error::ShardingError;
use crate::message::WireMessage;
use crate::types::EntityAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message wrapped with the address of its target entity.
///
/// The wire form is a JSON-isomorphic object
/// `{ "address": { "shardId", "entityType", "entityId" }, "message": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub address: EntityAddress,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(address: EntityAddress, message: WireMessage) -> Self {
        Self { address, message }
    }

    /// Encode for transport. Address encoding failures surface as routing
    /// errors, message failures as malformed messages.
    pub fn encode(&self) -> Result<Value, ShardingError> {
        let address = serde_json::to_value(&self.address)
            .map_err(|_| ShardingError::EntityNotManagedByPod { address: None })?;
        let message = serde_json::to_value(&self.message).map_err(|e| {
            ShardingError::MalformedMessage {
                reason: "failed to encode message".to_string(),
                source: Some(Box::new(e)),
            }
        })?;
        Ok(serde_json::json!({ "address": address, "message": message }))
    }

    /// Decode a transported envelope. An undecodable address yields
    /// `EntityNotManagedByPod`, an undecodable message `MalformedMessage`.
    pub fn decode(encoded: &Value) -> Result<Self, ShardingError> {
        let address_value = encoded
            .get("address")
            .ok_or(ShardingError::EntityNotManagedByPod { address: None })?;
        let address: EntityAddress = serde_json::from_value(address_value.clone())
            .map_err(|_| ShardingError::EntityNotManagedByPod { address: None })?;

        let message_value = encoded
            .get("message")
            .ok_or_else(|| ShardingError::malformed("envelope has no message field"))?;
        let message: WireMessage =
            serde_json::from_value(message_value.clone()).map_err(|e| {
                ShardingError::MalformedMessage {
                    reason: "failed to decode message".to_string(),
                    source: Some(Box::new(e)),
                }
            })?;

        Ok(Self { address, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, EntityType, ShardId};
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::new(
            EntityAddress {
                shard_id: ShardId::new(5),
                entity_type: EntityType::new("Counter"),
                entity_id: EntityId::new("c-1"),
            },
            WireMessage::new("1001", "Inc", json!({ "amount": 1 })),
        )
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let envelope = sample();
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn wire_shape() {
        let encoded = sample().encode().unwrap();
        assert_eq!(encoded["address"]["shardId"], 5);
        assert_eq!(encoded["address"]["entityType"], "Counter");
        assert_eq!(encoded["address"]["entityId"], "c-1");
        assert_eq!(encoded["message"]["tag"], "Inc");
        assert_eq!(encoded["message"]["primaryKey"], "1001");
    }

    #[test]
    fn missing_address_is_routing_error() {
        let err = Envelope::decode(&json!({ "message": {} })).unwrap_err();
        assert!(matches!(
            err,
            ShardingError::EntityNotManagedByPod { address: None }
        ));
    }

    #[test]
    fn bad_address_shape_is_routing_error() {
        let err = Envelope::decode(&json!({
            "address": { "shardId": "not-a-number" },
            "message": { "primaryKey": "1", "tag": "Get", "body": null },
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            ShardingError::EntityNotManagedByPod { address: None }
        ));
    }

    #[test]
    fn bad_message_is_malformed() {
        let err = Envelope::decode(&json!({
            "address": { "shardId": 0, "entityType": "Counter", "entityId": "x" },
            "message": { "tag": 42 },
        }))
        .unwrap_err();
        assert!(matches!(err, ShardingError::MalformedMessage { .. }));
    }

    #[test]
    fn missing_message_is_malformed() {
        let err = Envelope::decode(&json!({
            "address": { "shardId": 0, "entityType": "Counter", "entityId": "x" },
        }))
        .unwrap_err();
        assert!(matches!(err, ShardingError::MalformedMessage { .. }));
    }
}
