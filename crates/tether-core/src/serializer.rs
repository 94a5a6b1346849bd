//! Pluggable value serialization, selected per payload by a numeric id.
//!
//! Values cross the serializer boundary as [`serde_json::Value`]; converting
//! them to and from concrete Rust types is left to the endpoint and proxy
//! layers. Argument lists are written as consecutive values with no extra
//! framing, so each serializer must be able to find value boundaries itself.

use crate::error::{Result, TetherError};
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Id of the built-in MessagePack serializer.
pub const MESSAGE_PACK_ID: u32 = 1;
/// Id of the built-in JSON serializer.
pub const JSON_ID: u32 = 2;

/// A value-encoding strategy.
pub trait Serializer: Send + Sync + 'static {
    /// Id carried on the wire next to payloads produced by this serializer.
    fn id(&self) -> u32;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Append one encoded value to `out`.
    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()>;

    /// Decode exactly `count` consecutive values spanning all of `input`.
    fn deserialize(&self, input: &[u8], count: usize) -> Result<Vec<Value>>;

    /// Encode a sequence of values back to back.
    fn serialize_all(&self, values: &[Value]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for value in values {
            self.serialize(value, &mut out)?;
        }
        Ok(out.freeze())
    }
}

/// Compact binary encoding via MessagePack.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn id(&self) -> u32 {
        MESSAGE_PACK_ID
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()> {
        let encoded = rmp_serde::to_vec(value)?;
        out.extend_from_slice(&encoded);
        Ok(())
    }

    fn deserialize(&self, input: &[u8], count: usize) -> Result<Vec<Value>> {
        let mut cursor = Cursor::new(input);
        let mut values = Vec::with_capacity(count);

        for index in 0..count {
            if cursor.position() as usize >= input.len() {
                return Err(ended_early(count, index));
            }
            let value: Value = rmp_serde::decode::from_read(&mut cursor).map_err(|e| {
                TetherError::serialization(format!("value {}: {}", index, e))
            })?;
            values.push(value);
        }

        let consumed = cursor.position() as usize;
        if consumed < input.len() {
            return Err(trailing(input.len() - consumed));
        }
        Ok(values)
    }
}

/// Textual encoding: newline-delimited JSON values.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> u32 {
        JSON_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        out.extend_from_slice(&encoded);
        // Numbers are not self-delimiting.
        out.extend_from_slice(b"\n");
        Ok(())
    }

    fn deserialize(&self, input: &[u8], count: usize) -> Result<Vec<Value>> {
        let mut stream = serde_json::Deserializer::from_slice(input).into_iter::<Value>();
        let mut values = Vec::with_capacity(count);

        for index in 0..count {
            match stream.next() {
                Some(Ok(value)) => values.push(value),
                Some(Err(e)) => {
                    return Err(TetherError::serialization(format!("value {}: {}", index, e)));
                }
                None => return Err(ended_early(count, index)),
            }
        }

        let offset = stream.byte_offset();
        let rest = &input[offset..];
        if rest.iter().any(|b| !b.is_ascii_whitespace()) {
            return Err(trailing(rest.len()));
        }
        Ok(values)
    }
}

fn ended_early(expected: usize, decoded: usize) -> TetherError {
    TetherError::serialization(format!(
        "expected {} values, payload ended after {}",
        expected, decoded
    ))
}

fn trailing(len: usize) -> TetherError {
    TetherError::serialization(format!("{} trailing bytes after last value", len))
}

/// Maps serializer ids to strategies.
///
/// Shared by reference between channels; registration is allowed at any time.
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<u32, Arc<dyn Serializer>>>,
}

impl SerializerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            serializers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the MessagePack and JSON serializers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MessagePackSerializer));
        registry.register(Arc::new(JsonSerializer));
        registry
    }

    /// Register a serializer under its own id, replacing any previous one.
    pub fn register(&self, serializer: Arc<dyn Serializer>) {
        let id = serializer.id();
        let name = serializer.name();
        let mut map = self.serializers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = map.insert(id, serializer) {
            warn!(
                serializer_id = id,
                previous = previous.name(),
                replacement = name,
                "replaced registered serializer"
            );
        } else {
            debug!(serializer_id = id, name, "registered serializer");
        }
    }

    /// Look up a serializer. Unknown ids are protocol errors.
    pub fn get(&self, id: u32) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| TetherError::protocol(format!("unknown serializer id {}", id)))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.serializers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .serializers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mixed_values() -> Vec<Value> {
        vec![
            json!(42),
            json!("thread-1"),
            json!({"name": "cpu", "points": [1.5, 2.5], "tags": {"host": "a"}}),
            json!(null),
            json!(-7),
            json!([true, false]),
        ]
    }

    #[test]
    fn test_msgpack_sequence() {
        let serializer = MessagePackSerializer;
        let encoded = serializer.serialize_all(&mixed_values()).unwrap();
        let decoded = serializer.deserialize(&encoded, 6).unwrap();
        assert_eq!(decoded, mixed_values());
    }

    #[test]
    fn test_json_sequence_with_adjacent_numbers() {
        let serializer = JsonSerializer;
        let values = vec![json!(1), json!(2), json!(3)];
        let encoded = serializer.serialize_all(&values).unwrap();
        assert_eq!(&encoded[..], b"1\n2\n3\n");
        assert_eq!(serializer.deserialize(&encoded, 3).unwrap(), values);
    }

    #[test]
    fn test_zero_values_from_empty_payload() {
        assert!(MessagePackSerializer.deserialize(&[], 0).unwrap().is_empty());
        assert!(JsonSerializer.deserialize(b"", 0).unwrap().is_empty());
    }

    #[test]
    fn test_too_few_values() {
        let encoded = MessagePackSerializer.serialize_all(&[json!(1)]).unwrap();
        let err = MessagePackSerializer.deserialize(&encoded, 2).unwrap_err();
        assert!(err.to_string().contains("ended after 1"));

        let err = JsonSerializer.deserialize(b"1\n", 2).unwrap_err();
        assert!(err.to_string().contains("ended after 1"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let encoded = MessagePackSerializer
            .serialize_all(&[json!(1), json!(2)])
            .unwrap();
        let err = MessagePackSerializer.deserialize(&encoded, 1).unwrap_err();
        assert!(err.to_string().contains("trailing"));

        let err = JsonSerializer.deserialize(b"1\n2\n", 1).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SerializerRegistry::with_defaults();
        assert_eq!(registry.ids(), vec![MESSAGE_PACK_ID, JSON_ID]);
        assert_eq!(registry.get(JSON_ID).unwrap().name(), "json");

        let err = registry.get(99).err().unwrap();
        assert!(matches!(err, TetherError::Protocol { .. }));
    }

    #[test]
    fn test_registry_replaces_same_id() {
        struct LoudJson;
        impl Serializer for LoudJson {
            fn id(&self) -> u32 {
                JSON_ID
            }
            fn name(&self) -> &'static str {
                "loud-json"
            }
            fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()> {
                JsonSerializer.serialize(value, out)
            }
            fn deserialize(&self, input: &[u8], count: usize) -> Result<Vec<Value>> {
                JsonSerializer.deserialize(input, count)
            }
        }

        let registry = SerializerRegistry::with_defaults();
        registry.register(Arc::new(LoudJson));
        assert_eq!(registry.get(JSON_ID).unwrap().name(), "loud-json");
        assert_eq!(registry.ids().len(), 2);
    }
}
