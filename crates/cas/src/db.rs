use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    data_id::DataId,
    object::CasObject,
};

/// A `get` came back empty where a present object was required.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no object in the CAS for {0}")]
pub struct MissingObject(pub DataId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CasFeatures {
    /// When true, `put_with_id` only succeeds if the provided id is the true
    /// digest of the object; the database never re-keys.
    pub preserves_ids: bool,
}

/// An associative map from [`DataId`] to immutable [`CasObject`].
///
/// All operations are safe to invoke concurrently. Repeated puts of equal
/// `(refs, data)` yield equal ids and must not corrupt; last-writer-wins is
/// fine because the contents are identical by construction. A `get` miss is
/// absence, not an error.
#[async_trait]
pub trait CasDatabase: Send + Sync {
    fn features(&self) -> CasFeatures;

    async fn contains(&self, id: &DataId) -> anyhow::Result<bool>;

    async fn get(&self, id: &DataId) -> anyhow::Result<Option<CasObject>>;

    /// Computes the id the object would be stored under, without writing.
    async fn identify(&self, refs: &[DataId], data: &[u8]) -> anyhow::Result<DataId>;

    async fn put(&self, refs: Vec<DataId>, data: Bytes) -> anyhow::Result<DataId>;

    /// Stores an object whose id the caller already knows. The database MAY
    /// store under its own id; callers MUST use the returned id for
    /// subsequent `get`s.
    async fn put_with_id(
        &self,
        known: DataId,
        refs: Vec<DataId>,
        data: Bytes,
    ) -> anyhow::Result<DataId>;
}

#[async_trait]
impl<D: CasDatabase + ?Sized> CasDatabase for Arc<D> {
    fn features(&self) -> CasFeatures {
        (**self).features()
    }

    async fn contains(&self, id: &DataId) -> anyhow::Result<bool> {
        (**self).contains(id).await
    }

    async fn get(&self, id: &DataId) -> anyhow::Result<Option<CasObject>> {
        (**self).get(id).await
    }

    async fn identify(&self, refs: &[DataId], data: &[u8]) -> anyhow::Result<DataId> {
        (**self).identify(refs, data).await
    }

    async fn put(&self, refs: Vec<DataId>, data: Bytes) -> anyhow::Result<DataId> {
        (**self).put(refs, data).await
    }

    async fn put_with_id(
        &self,
        known: DataId,
        refs: Vec<DataId>,
        data: Bytes,
    ) -> anyhow::Result<DataId> {
        (**self).put_with_id(known, refs, data).await
    }
}

/// Reference in-memory database: a mutexed map keyed by id.
#[derive(Clone)]
pub struct InMemoryCasDatabase {
    objects: Arc<Mutex<HashMap<DataId, CasObject>>>,
}

impl InMemoryCasDatabase {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl CasDatabase for InMemoryCasDatabase {
    fn features(&self) -> CasFeatures {
        CasFeatures { preserves_ids: true }
    }

    async fn contains(&self, id: &DataId) -> anyhow::Result<bool> {
        Ok(self.objects.lock().contains_key(id))
    }

    async fn get(&self, id: &DataId) -> anyhow::Result<Option<CasObject>> {
        Ok(self.objects.lock().get(id).cloned())
    }

    async fn identify(&self, refs: &[DataId], data: &[u8]) -> anyhow::Result<DataId> {
        Ok(DataId::of(refs, data))
    }

    async fn put(&self, refs: Vec<DataId>, data: Bytes) -> anyhow::Result<DataId> {
        let object = CasObject::new(refs, data);
        let id = object.id();
        self.objects.lock().insert(id.clone(), object);
        Ok(id)
    }

    async fn put_with_id(
        &self,
        known: DataId,
        refs: Vec<DataId>,
        data: Bytes,
    ) -> anyhow::Result<DataId> {
        let object = CasObject::new(refs, data);
        let id = object.id();
        anyhow::ensure!(
            known == id,
            "provided id {known} does not match the object digest {id}",
        );
        self.objects.lock().insert(id.clone(), object);
        Ok(id)
    }
}
