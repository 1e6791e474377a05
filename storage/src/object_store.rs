use kb_core::error::{ErrorCode, KbError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object key must not contain path separators or '..': {0}")]
    UnsafeKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl KbError for ObjectStoreError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ObjectStoreError::Io(_) => ErrorCode::StorageError,
            ObjectStoreError::UnsafeKey(_) => ErrorCode::Validation,
            ObjectStoreError::NotFound(_) => ErrorCode::NotFound,
        }
    }
}

/// C2: the gateway to per-tenant object storage. One implementation
/// (`FsObjectStoreGateway`) ships in-process; the trait boundary is the
/// extension point a deployment swaps for S3/GCS-backed storage.
#[async_trait::async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Strips path separators and other unsafe characters from a user-supplied
/// filename so it can be used as the trailing component of an object key
/// (spec §4.2). Anything that isn't alphanumeric, `.`, `_`, or `-` becomes
/// `_`; an empty result falls back to `file`.
pub fn safe_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Keys are tenant-scoped paths, e.g.
/// `tenant_42/documents/3fae2.../report.pdf` or `tenant_42/markdown/17.md`.
/// Every key component is rejected if it contains `..`, `/` is allowed only
/// as the caller-supplied separator (keys are joined under `root_dir`
/// verbatim), but no component may escape `root_dir` via traversal.
pub struct FsObjectStoreGateway {
    root_dir: PathBuf,
}

impl FsObjectStoreGateway {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() || key.contains("..") || key.contains('\\') {
            return Err(ObjectStoreError::UnsafeKey(key.to_string()));
        }
        Ok(self.root_dir.join(key))
    }
}

#[async_trait::async_trait]
impl ObjectStoreGateway for FsObjectStoreGateway {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp-upload");
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.resolve(key)?;
        Ok(fs::metadata(&path).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_bytes() {
        let dir = tempdir().unwrap();
        let store = FsObjectStoreGateway::new(dir.path());

        store.put("tenants/1/documents/1/original.pdf", b"hello").await.unwrap();
        let bytes = store.get("tenants/1/documents/1/original.pdf").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = FsObjectStoreGateway::new(dir.path());

        let result = store.put("../escape", b"bad").await;
        assert!(matches!(result, Err(ObjectStoreError::UnsafeKey(_))));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FsObjectStoreGateway::new(dir.path());

        let result = store.get("nope").await;
        assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FsObjectStoreGateway::new(dir.path());

        store.put("a", b"x").await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }
}
