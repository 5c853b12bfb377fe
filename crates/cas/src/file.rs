use std::{
    io,
    path::PathBuf,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    data_id::DataId,
    db::{
        CasDatabase,
        CasFeatures,
    },
    object::CasObject,
};

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reference file-backed database. Each object lives in one file named by
/// the base64url form of its id, holding the canonical framing (refs
/// inline, no sidecar). Writes land in a temp file first and are renamed
/// into place, so concurrent equal puts cannot tear each other.
pub struct FileCasDatabase {
    root: PathBuf,
}

impl FileCasDatabase {
    /// Opens (creating if needed) a database rooted at `root`. Callers
    /// conventionally point this at a `cas/` directory inside their state
    /// root.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating CAS directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &DataId) -> PathBuf {
        self.root.join(id.as_filename())
    }

    async fn write_object(&self, id: &DataId, object: &CasObject) -> anyhow::Result<()> {
        let final_path = self.path_for(id);
        let tmp_path = self.root.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            WRITE_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        tokio::fs::write(&tmp_path, object.encode())
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("renaming into {}", final_path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CasDatabase for FileCasDatabase {
    fn features(&self) -> CasFeatures {
        CasFeatures { preserves_ids: true }
    }

    async fn contains(&self, id: &DataId) -> anyhow::Result<bool> {
        match tokio::fs::metadata(self.path_for(id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &DataId) -> anyhow::Result<Option<CasObject>> {
        let buf = match tokio::fs::read(self.path_for(id)).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = CasObject::decode(&buf).with_context(|| format!("corrupt object {id}"))?;
        Ok(Some(object))
    }

    async fn identify(&self, refs: &[DataId], data: &[u8]) -> anyhow::Result<DataId> {
        Ok(DataId::of(refs, data))
    }

    async fn put(&self, refs: Vec<DataId>, data: Bytes) -> anyhow::Result<DataId> {
        let object = CasObject::new(refs, data);
        let id = object.id();
        self.write_object(&id, &object).await?;
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
        self.write_object(&id, &object).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::FileCasDatabase;
    use crate::{
        data_id::DataId,
        db::CasDatabase,
    };

    #[tokio::test]
    async fn test_round_trip_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = FileCasDatabase::open(dir.path().join("cas")).await?;

        let leaf = db.put(vec![], Bytes::from_static(b"leaf")).await?;
        let id = db
            .put(vec![leaf.clone()], Bytes::from_static(b"parent"))
            .await?;

        let object = db.get(&id).await?.expect("object was just stored");
        assert_eq!(object.refs, vec![leaf]);
        assert_eq!(object.data, Bytes::from_static(b"parent"));

        assert!(db.contains(&id).await?);
        assert!(!db.contains(&DataId::of(&[], b"absent")).await?);
        assert_eq!(db.get(&DataId::of(&[], b"absent")).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_ids_agree_with_the_in_memory_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file_db = FileCasDatabase::open(dir.path().join("cas")).await?;
        let mem_db = crate::db::InMemoryCasDatabase::new();

        let data = b"same content, same id";
        assert_eq!(
            file_db.identify(&[], data).await?,
            mem_db.identify(&[], data).await?,
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_sees_existing_objects() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let id = {
            let db = FileCasDatabase::open(dir.path().join("cas")).await?;
            db.put(vec![], Bytes::from_static(b"durable")).await?
        };
        let db = FileCasDatabase::open(dir.path().join("cas")).await?;
        assert_eq!(
            db.get(&id).await?.unwrap().data,
            Bytes::from_static(b"durable"),
        );
        Ok(())
    }
}
