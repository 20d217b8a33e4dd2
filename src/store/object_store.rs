use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::error::StoreError;
use crate::utils::write_atomic;

/// Minimal object-storage surface the partition store is built on.
///
/// Keys are `/`-separated relative paths such as `raw/2024-06-01T00/_manifest.json`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing one with the same key.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove every object under `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let trimmed = key.trim_end_matches('/');
    let valid = !trimmed.is_empty()
        && !trimmed.starts_with('/')
        && !trimmed.contains('\\')
        && trimmed
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        key: key.to_string(),
        source,
    }
}

/// Object store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.trim_end_matches('/')
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

fn collect_files(dir: &Path, key_prefix: &str, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // In-flight atomic writes
        if name.starts_with(".tmp") {
            continue;
        }
        let key = format!("{key_prefix}/{name}");
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &key, out)?;
        } else {
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| io_error(&owned_key, std::io::Error::other(e)))?
            .map_err(|e| io_error(&owned_key, e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        validate_key(prefix)?;
        let dir = self.path_for(prefix);
        let key_prefix = prefix.trim_end_matches('/').to_string();
        let owned_prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if dir.is_dir() {
                collect_files(&dir, &key_prefix, &mut keys)?;
            }
            keys.sort();
            Ok::<_, std::io::Error>(keys)
        })
        .await
        .map_err(|e| io_error(&owned_prefix, std::io::Error::other(e)))?
        .map_err(|e| io_error(&owned_prefix, e))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.list(prefix).await?;
        let dir = self.path_for(prefix);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(keys.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_error(prefix, e)),
        }
    }
}

/// Process-local object store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        validate_key(prefix)?;
        let prefix = dir_prefix(prefix);
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        validate_key(prefix)?;
        let prefix = dir_prefix(prefix);
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let before = objects.len();
        objects.retain(|k, _| !k.starts_with(&prefix));
        Ok(before - objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("raw/2024-06-01/_manifest.json").is_ok());
        assert!(validate_key("raw/2024-06-01/").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("raw/../secrets").is_err());
        assert!(validate_key("raw//x").is_err());
    }

    #[tokio::test]
    async fn test_local_store_put_get_list_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.put("raw/2024-06-01/a.jsonl", b"a".to_vec()).await.unwrap();
        store.put("raw/2024-06-01/b.jsonl", b"b".to_vec()).await.unwrap();
        store.put("raw/2024-06-02/a.jsonl", b"c".to_vec()).await.unwrap();
        store.put("raw/2024-06-01/a.jsonl", b"a2".to_vec()).await.unwrap();

        assert_eq!(store.get("raw/2024-06-01/a.jsonl").await.unwrap(), b"a2");
        assert_eq!(
            store.list("raw/2024-06-01").await.unwrap(),
            vec!["raw/2024-06-01/a.jsonl", "raw/2024-06-01/b.jsonl"]
        );
        assert!(store.list("raw/2030-01-01").await.unwrap().is_empty());

        assert_eq!(store.delete_prefix("raw/2024-06-01").await.unwrap(), 2);
        assert!(matches!(
            store.get("raw/2024-06-01/a.jsonl").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list("raw/2024-06-02").await.unwrap().len(), 1);
        assert_eq!(store.delete_prefix("raw/2024-06-01").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_prefix_does_not_match_siblings() {
        let store = InMemoryObjectStore::new();
        store.put("raw/2024-06-01T01/x", vec![1]).await.unwrap();
        store.put("raw/2024-06-01T010/x", vec![2]).await.unwrap();

        assert_eq!(store.list("raw/2024-06-01T01").await.unwrap(), vec!["raw/2024-06-01T01/x"]);
        assert_eq!(store.delete_prefix("raw/2024-06-01T01/").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
