use std::{
    collections::HashMap,
    fmt,
    io,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use cas::DataId;
use parking_lot::Mutex;

use crate::registry::AnyValue;

/// A stable, content-only hash of a key plus its declared properties. Two
/// structurally equal keys of the same type and version fingerprint
/// identically in every process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(key: &AnyValue, version: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(key.type_identifier.len() as u64).to_le_bytes());
        hasher.update(key.type_identifier.as_bytes());
        hasher.update(&(key.payload.len() as u64).to_le_bytes());
        hasher.update(&key.payload);
        hasher.update(version.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Eight hex characters, for log lines and namespacing.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Advisory map from key fingerprint to the DataId of the cached value. A
/// miss forces re-evaluation; engines tolerate arbitrary misses, so
/// implementations are free to drop entries at any time. Per-entry updates
/// are atomic; there is no ordering across entries.
#[async_trait]
pub trait FunctionCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<DataId>>;

    async fn update(&self, fingerprint: Fingerprint, id: DataId) -> anyhow::Result<()>;
}

#[async_trait]
impl<C: FunctionCache + ?Sized> FunctionCache for Arc<C> {
    async fn get(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<DataId>> {
        (**self).get(fingerprint).await
    }

    async fn update(&self, fingerprint: Fingerprint, id: DataId) -> anyhow::Result<()> {
        (**self).update(fingerprint, id).await
    }
}

#[derive(Clone)]
pub struct InMemoryFunctionCache {
    entries: Arc<Mutex<HashMap<Fingerprint, DataId>>>,
}

impl InMemoryFunctionCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl FunctionCache for InMemoryFunctionCache {
    async fn get(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<DataId>> {
        Ok(self.entries.lock().get(fingerprint).cloned())
    }

    async fn update(&self, fingerprint: Fingerprint, id: DataId) -> anyhow::Result<()> {
        self.entries.lock().insert(fingerprint, id);
        Ok(())
    }
}

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File-backed cache: one file per entry at `<root>/<version>/<fingerprint>`
/// holding the DataId in textual form. The version directory lets a whole
/// cache generation be invalidated by bumping the version string.
pub struct FileFunctionCache {
    dir: PathBuf,
}

impl FileFunctionCache {
    /// Opens (creating if needed) a cache generation under `root`. Callers
    /// conventionally point `root` at a `function-cache/` directory inside
    /// their state root.
    pub async fn open(root: impl Into<PathBuf>, version: &str) -> anyhow::Result<Self> {
        let dir = root.into().join(version);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating function cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.as_hex())
    }
}

#[async_trait]
impl FunctionCache for FileFunctionCache {
    async fn get(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<DataId>> {
        let text = match tokio::fs::read_to_string(self.path_for(fingerprint)).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match text.trim().parse::<DataId>() {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                // The cache is advisory, so a corrupt entry degrades to a
                // miss rather than failing the build.
                tracing::warn!("dropping corrupt function cache entry {fingerprint:?}: {e:#}");
                Ok(None)
            },
        }
    }

    async fn update(&self, fingerprint: Fingerprint, id: DataId) -> anyhow::Result<()> {
        let tmp_path = self.dir.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            WRITE_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        tokio::fs::write(&tmp_path, id.to_string())
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, self.path_for(&fingerprint))
            .await
            .context("renaming function cache entry")?;
        Ok(())
    }
}
