use bytes::Bytes;
use prost::Message;

use crate::data_id::DataId;

/// An immutable stored object: an ordered list of references to other
/// objects plus an opaque byte payload. Objects form an acyclic Merkle DAG;
/// writes are by id, so a cycle is unconstructible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasObject {
    pub refs: Vec<DataId>,
    pub data: Bytes,
}

/// Canonical persisted framing. Field order is load-bearing: the file-backed
/// database round-trips objects through this message, so refs need no
/// sidecar.
#[derive(Clone, PartialEq, ::prost::Message)]
struct StoredObject {
    #[prost(bytes = "vec", repeated, tag = "1")]
    refs: Vec<Vec<u8>>,
    #[prost(bytes = "bytes", tag = "2")]
    data: Bytes,
}

impl CasObject {
    pub fn new(refs: Vec<DataId>, data: Bytes) -> Self {
        Self { refs, data }
    }

    /// The canonical identifier of this object.
    pub fn id(&self) -> DataId {
        DataId::of(&self.refs, &self.data)
    }

    pub fn encode(&self) -> Bytes {
        let stored = StoredObject {
            refs: self.refs.iter().map(|r| r.as_bytes().to_vec()).collect(),
            data: self.data.clone(),
        };
        stored.encode_to_vec().into()
    }

    pub fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let stored = StoredObject::decode(buf)?;
        let refs = stored
            .refs
            .into_iter()
            .map(DataId::from_bytes)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            refs,
            data: stored.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::CasObject;
    use crate::data_id::DataId;

    #[test]
    fn test_encode_round_trip() -> anyhow::Result<()> {
        let leaf = DataId::of(&[], b"leaf");
        let object = CasObject::new(vec![leaf], Bytes::from_static(b"payload"));
        let decoded = CasObject::decode(&object.encode())?;
        assert_eq!(decoded, object);
        assert_eq!(decoded.id(), object.id());
        Ok(())
    }

    #[test]
    fn test_refs_change_the_id() {
        let leaf = DataId::of(&[], b"leaf");
        let with_ref = CasObject::new(vec![leaf], Bytes::from_static(b"payload"));
        let without_ref = CasObject::new(vec![], Bytes::from_static(b"payload"));
        assert_ne!(with_ref.id(), without_ref.id());
    }
}
