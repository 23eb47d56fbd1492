use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Directory-backed blob store. Blobs are addressed only by their generated
/// storage key; the original filename lives in the database as display
/// metadata.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: Utf8PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// # Errors
    pub async fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Keys carry the original extension (when it is plain alphanumeric) so
    /// blobs stay openable straight off the disk, but are otherwise
    /// unrelated to the original filename.
    #[must_use]
    pub fn generate_key(original_name: &str) -> String {
        let extension = Utf8Path::new(original_name)
            .extension()
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

        match extension {
            Some(extension) => format!("{}.{extension}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        }
    }

    fn blob_path(&self, key: &str) -> Utf8PathBuf {
        self.root.join(key)
    }

    /// # Errors
    pub async fn save(&self, key: &str, contents: &[u8]) -> std::io::Result<()> {
        fs::write(self.blob_path(key), contents).await
    }

    /// # Errors
    pub async fn read(&self, key: &str) -> std::io::Result<Vec<u8>> {
        fs::read(self.blob_path(key)).await
    }

    /// Removes a blob; a key whose blob is already gone is not an error.
    ///
    /// # Errors
    pub async fn remove(&self, key: &str) -> std::io::Result<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
