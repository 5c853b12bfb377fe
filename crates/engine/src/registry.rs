use std::{
    any::Any,
    collections::HashMap,
    sync::LazyLock,
};

use parking_lot::RwLock;
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};

use crate::errors::EngineError;

/// A serializable value that can cross the engine's type-erased boundary.
/// The identifier tags serialized payloads so they can be decoded without
/// static type information at the call site.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const IDENTIFIER: &'static str;
}

/// A [`Payload`] that can be requested from the engine. Bumping `VERSION`
/// invalidates every cached evaluation of this key type.
pub trait EngineKey: Payload {
    type Value: Payload;

    const VERSION: &'static str = "0";
}

/// The polymorphic envelope: a typed payload next to its identifier. This is
/// both the engine's in-memory currency and, prost-encoded, the byte layout
/// of every persisted value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Message)]
pub struct AnyValue {
    #[prost(string, tag = "1")]
    pub type_identifier: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl AnyValue {
    pub fn wrap<T: Payload>(value: &T) -> anyhow::Result<Self> {
        Ok(Self {
            type_identifier: T::IDENTIFIER.to_string(),
            payload: serde_json::to_vec(value)?,
        })
    }

    pub fn unpack<T: Payload>(&self) -> anyhow::Result<T> {
        anyhow::ensure!(
            self.type_identifier == T::IDENTIFIER,
            "expected a {} payload but found {}",
            T::IDENTIFIER,
            self.type_identifier,
        );
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode_to_bytes(&self) -> bytes::Bytes {
        use prost::Message;
        self.encode_to_vec().into()
    }

    pub fn decode_from(buf: &[u8]) -> anyhow::Result<Self> {
        use prost::Message;
        Ok(Self::decode(buf)?)
    }
}

struct RegisteredType {
    type_id: std::any::TypeId,
    decode: fn(&[u8]) -> anyhow::Result<Box<dyn Any + Send + Sync>>,
    key_version: Option<&'static str>,
}

static REGISTRY: LazyLock<RwLock<HashMap<&'static str, RegisteredType>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn decode_erased<T: Payload>(buf: &[u8]) -> anyhow::Result<Box<dyn Any + Send + Sync>> {
    let value: T = serde_json::from_slice(buf)?;
    Ok(Box::new(value))
}

fn register(identifier: &'static str, entry: RegisteredType) {
    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(identifier) {
        // Re-registering the same type is idempotent; two types under one
        // identifier is a process-level configuration error.
        assert!(
            existing.type_id == entry.type_id,
            "two distinct types registered under identifier {identifier:?}",
        );
        if existing.key_version.is_some() {
            return;
        }
    }
    registry.insert(identifier, entry);
}

/// Registers a value type. Registration is process-wide, idempotent per
/// type, and never reversed.
pub fn register_value<T: Payload>() {
    register(
        T::IDENTIFIER,
        RegisteredType {
            type_id: std::any::TypeId::of::<T>(),
            decode: decode_erased::<T>,
            key_version: None,
        },
    );
}

/// Registers a key type along with its value type.
pub fn register_key<K: EngineKey>() {
    register(
        K::IDENTIFIER,
        RegisteredType {
            type_id: std::any::TypeId::of::<K>(),
            decode: decode_erased::<K>,
            key_version: Some(K::VERSION),
        },
    );
    register_value::<K::Value>();
}

/// Fails with [`EngineError::UnknownType`] unless the identifier has been
/// registered.
pub fn ensure_registered(identifier: &str) -> anyhow::Result<()> {
    if REGISTRY.read().contains_key(identifier) {
        Ok(())
    } else {
        Err(EngineError::UnknownType(identifier.to_string()).into())
    }
}

/// Decodes an envelope through the registry, with no static type at the
/// call site.
pub fn decode_registered(value: &AnyValue) -> anyhow::Result<Box<dyn Any + Send + Sync>> {
    let registry = REGISTRY.read();
    let entry = registry
        .get(value.type_identifier.as_str())
        .ok_or_else(|| EngineError::UnknownType(value.type_identifier.clone()))?;
    (entry.decode)(&value.payload)
}

/// The cache version a registered key type declared; unregistered key types
/// fail with [`EngineError::UnknownType`].
pub(crate) fn key_version(identifier: &str) -> anyhow::Result<&'static str> {
    let registry = REGISTRY.read();
    registry
        .get(identifier)
        .and_then(|entry| entry.key_version)
        .ok_or_else(|| EngineError::UnknownType(identifier.to_string()).into())
}

#[cfg(test)]
mod tests {
    use serde::{
        Deserialize,
        Serialize,
    };

    use super::{
        decode_registered,
        register_value,
        AnyValue,
        Payload,
    };
    use crate::errors::EngineError;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl Payload for Greeting {
        const IDENTIFIER: &'static str = "test.registry.greeting";
    }

    #[test]
    fn test_wrap_unpack_round_trip() -> anyhow::Result<()> {
        let greeting = Greeting {
            text: "hello".to_string(),
        };
        let envelope = AnyValue::wrap(&greeting)?;
        assert_eq!(envelope.type_identifier, Greeting::IDENTIFIER);
        assert_eq!(envelope.unpack::<Greeting>()?, greeting);
        Ok(())
    }

    #[test]
    fn test_envelope_bytes_round_trip() -> anyhow::Result<()> {
        let envelope = AnyValue::wrap(&Greeting {
            text: "persisted".to_string(),
        })?;
        let decoded = AnyValue::decode_from(&envelope.encode_to_bytes())?;
        assert_eq!(decoded, envelope);
        Ok(())
    }

    #[test]
    fn test_decode_registered_dispatches_by_identifier() -> anyhow::Result<()> {
        register_value::<Greeting>();
        let envelope = AnyValue::wrap(&Greeting {
            text: "dynamic".to_string(),
        })?;
        let decoded = decode_registered(&envelope)?;
        let greeting = decoded.downcast_ref::<Greeting>().expect("wrong type");
        assert_eq!(greeting.text, "dynamic");
        Ok(())
    }

    #[test]
    fn test_unregistered_identifier_is_an_error() {
        let envelope = AnyValue {
            type_identifier: "test.registry.never-registered".to_string(),
            payload: b"{}".to_vec(),
        };
        let err = decode_registered(&envelope).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::UnknownType(
                "test.registry.never-registered".to_string()
            )),
        );
    }
}
