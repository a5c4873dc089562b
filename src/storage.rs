use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

// Keep '/' so nested keys stay readable in URLs.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("could not sign object url: {0}")]
    Signing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError>;
    /// Checks a `(path, expires, signature)` triple produced by [`ObjectStore::signed_url`].
    fn verify_signed(&self, path: &str, expires: i64, signature: &str) -> bool;
}

/// Key under which a module's uploaded document is stored.
pub fn module_document_path(course_id: uuid::Uuid, module_id: uuid::Uuid, ext: &str) -> String {
    format!(
        "modules/{}/{}-{}.{}",
        course_id,
        module_id,
        Utc::now().timestamp_millis(),
        ext.trim_start_matches('.').to_ascii_lowercase()
    )
}

/// Filesystem-backed store rooted at `DATA_DIR`, serving downloads through
/// HMAC-signed, expiring `/files/...` URLs.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    secret: Vec<u8>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, secret: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && !path.contains('\\')
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn signature(&self, path: &str, expires: i64) -> Result<String, StorageError> {
        hmac_hex(&self.secret, signed_message(path, expires).as_bytes())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        tracing::debug!(%path, size = bytes.len(), "stored object");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        self.resolve(path)?;
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        Ok(format!(
            "{}/files/{}?expires={}&signature={}",
            self.public_base_url,
            utf8_percent_encode(path, PATH_SEGMENT),
            expires,
            self.signature(path, expires)?
        ))
    }

    fn verify_signed(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(claimed) = hex::decode(signature) else {
            return false;
        };
        keyed(&self.secret, signed_message(path, expires).as_bytes())
            .map(|mac| mac.verify_slice(&claimed).is_ok())
            .unwrap_or(false)
    }
}

fn signed_message(path: &str, expires: i64) -> String {
    format!("{}\n{}", path, expires)
}

type HmacSha256 = Hmac<Sha256>;

fn keyed(key: &[u8], msg: &[u8]) -> Result<HmacSha256, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| StorageError::Signing(e.to_string()))?;
    mac.update(msg);
    Ok(mac)
}

fn hmac_hex(key: &[u8], msg: &[u8]) -> Result<String, StorageError> {
    Ok(hex::encode(keyed(key, msg)?.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn store(dir: &tempfile::TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), "http://localhost:8081/", "s3cret")
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        let mac = hmac_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test(tokio::test)]
    async fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.upload("modules/c/m-1.pdf", b"%PDF-1.4").await.unwrap();
        assert_eq!(s.download("modules/c/m-1.pdf").await.unwrap(), b"%PDF-1.4");
        assert!(matches!(s.download("modules/c/other.pdf").await, Err(StorageError::NotFound(_))));
    }

    #[test(tokio::test)]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(matches!(s.upload("../etc/passwd", b"x").await, Err(StorageError::InvalidPath(_))));
        assert!(matches!(s.download("/etc/passwd").await, Err(StorageError::InvalidPath(_))));
        assert!(matches!(s.download("").await, Err(StorageError::InvalidPath(_))));
    }

    #[test]
    fn signed_urls_verify_and_reject_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let url = s.signed_url("modules/c/m 1.pdf", Duration::from_secs(60)).unwrap();
        assert!(url.starts_with("http://localhost:8081/files/modules/c/m%201.pdf?expires="));

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }
        assert!(s.verify_signed("modules/c/m 1.pdf", expires, &signature));
        assert!(!s.verify_signed("modules/c/other.pdf", expires, &signature));
        assert!(!s.verify_signed("modules/c/m 1.pdf", expires + 1, &signature));
        assert!(!s.verify_signed("modules/c/m 1.pdf", expires, "not-hex"));
        assert!(!s.verify_signed("modules/c/m 1.pdf", expires, &signature[..signature.len() - 2]));
    }

    #[test]
    fn expired_signatures_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let past = Utc::now().timestamp() - 10;
        let sig = s.signature("a.pdf", past).unwrap();
        assert!(!s.verify_signed("a.pdf", past, &sig));
    }

    #[test]
    fn document_path_is_namespaced_by_course_and_module() {
        let (c, m) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let path = module_document_path(c, m, ".PDF");
        assert!(path.starts_with(&format!("modules/{}/{}-", c, m)));
        assert!(path.ends_with(".pdf"));
    }
}
