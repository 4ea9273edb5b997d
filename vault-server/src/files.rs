//! On-disk file contents.
//!
//! Layout is `<root>/<owner>/<filename>`. Owners and filenames are
//! validated by the codec before they get here, so neither can contain a
//! path separator.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File store errors.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    /// No such file.
    #[error("file not found")]
    NotFound,

    /// File already exists.
    #[error("file already exists")]
    AlreadyExists,

    /// Write offset lies beyond the end of the file.
    #[error("offset {offset} beyond end of file ({len} bytes)")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Current length.
        len: u64,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FileStoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => FileStoreError::NotFound,
            std::io::ErrorKind::AlreadyExists => FileStoreError::AlreadyExists,
            _ => FileStoreError::Io(e),
        }
    }
}

/// Result type alias for file store operations.
pub type FileStoreResult<T> = std::result::Result<T, FileStoreError>;

/// Owner-partitioned file contents.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> FileStoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(FileStoreError::Io)?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, owner: &str, filename: &str) -> PathBuf {
        self.root.join(owner).join(filename)
    }

    /// Create a file with initial contents. Fails if it exists.
    pub async fn create(&self, owner: &str, filename: &str, data: &[u8]) -> FileStoreResult<()> {
        fs::create_dir_all(self.root.join(owner))
            .await
            .map_err(FileStoreError::Io)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(owner, filename))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Current length.
    pub async fn len(&self, owner: &str, filename: &str) -> FileStoreResult<u64> {
        Ok(fs::metadata(self.path(owner, filename)).await?.len())
    }

    /// Read up to `max` bytes starting at `offset`.
    pub async fn read_at(&self, owner: &str, filename: &str, offset: u64, max: u64) -> FileStoreResult<Vec<u8>> {
        let mut file = fs::File::open(self.path(owner, filename)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take(max).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Overwrite bytes at `offset`, extending the file if needed. With
    /// `truncate`, everything past `offset` is dropped first. Returns the
    /// new length.
    pub async fn write_at(
        &self,
        owner: &str,
        filename: &str,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> FileStoreResult<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path(owner, filename))
            .await?;
        let len = file.metadata().await?.len();
        if offset > len {
            return Err(FileStoreError::OutOfRange { offset, len });
        }
        if truncate {
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    /// Replace the whole contents atomically.
    pub async fn replace(&self, owner: &str, filename: &str, data: &[u8]) -> FileStoreResult<()> {
        let path = self.path(owner, filename);
        if !fs::try_exists(&path).await.map_err(FileStoreError::Io)? {
            return Err(FileStoreError::NotFound);
        }
        let tmp = self.root.join(owner).join(format!(".{filename}.tmp"));
        fs::write(&tmp, data).await.map_err(FileStoreError::Io)?;
        fs::rename(&tmp, &path).await.map_err(FileStoreError::Io)?;
        Ok(())
    }

    /// Append to the end. Returns the new length.
    pub async fn append(&self, owner: &str, filename: &str, data: &[u8]) -> FileStoreResult<u64> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path(owner, filename))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(file.metadata().await?.len())
    }

    /// Delete a file.
    pub async fn delete(&self, owner: &str, filename: &str) -> FileStoreResult<()> {
        fs::remove_file(self.path(owner, filename)).await?;
        Ok(())
    }

    /// Move a file into another owner's directory.
    pub async fn transfer(&self, owner: &str, filename: &str, new_owner: &str) -> FileStoreResult<()> {
        fs::create_dir_all(self.root.join(new_owner))
            .await
            .map_err(FileStoreError::Io)?;
        let target = self.path(new_owner, filename);
        if fs::try_exists(&target).await.map_err(FileStoreError::Io)? {
            return Err(FileStoreError::AlreadyExists);
        }
        fs::rename(self.path(owner, filename), target).await?;
        Ok(())
    }

    /// Remove everything an owner has on disk.
    pub async fn remove_owner(&self, owner: &str) -> FileStoreResult<()> {
        match fs::remove_dir_all(self.root.join(owner)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(FileStoreError::Io(e)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("files")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_read_write() {
        let (_dir, store) = store().await;
        store.create("alice", "a.txt", b"hello world").await.unwrap();
        assert!(matches!(
            store.create("alice", "a.txt", b"").await,
            Err(FileStoreError::AlreadyExists)
        ));

        assert_eq!(store.read_at("alice", "a.txt", 6, 100).await.unwrap(), b"world");
        assert_eq!(store.write_at("alice", "a.txt", 6, b"WORLD!", false).await.unwrap(), 12);
        assert_eq!(store.read_at("alice", "a.txt", 0, 5).await.unwrap(), b"hello");
        assert_eq!(store.append("alice", "a.txt", b"?").await.unwrap(), 13);
        assert_eq!(store.len("alice", "a.txt").await.unwrap(), 13);
    }

    #[tokio::test]
    async fn write_beyond_end_is_out_of_range() {
        let (_dir, store) = store().await;
        store.create("alice", "a.txt", b"abc").await.unwrap();
        assert!(matches!(
            store.write_at("alice", "a.txt", 4, b"x", false).await,
            Err(FileStoreError::OutOfRange { offset: 4, len: 3 })
        ));
        // Writing exactly at the end extends.
        assert_eq!(store.write_at("alice", "a.txt", 3, b"d", false).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn truncating_write_and_replace() {
        let (_dir, store) = store().await;
        store.create("alice", "a.txt", b"0123456789").await.unwrap();
        assert_eq!(store.write_at("alice", "a.txt", 2, b"x", true).await.unwrap(), 3);
        assert_eq!(store.read_at("alice", "a.txt", 0, 10).await.unwrap(), b"01x");

        store.replace("alice", "a.txt", b"new").await.unwrap();
        assert_eq!(store.read_at("alice", "a.txt", 0, 10).await.unwrap(), b"new");
        assert!(matches!(
            store.replace("alice", "missing", b"").await,
            Err(FileStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn transfer_and_remove_owner() {
        let (_dir, store) = store().await;
        store.create("alice", "a.txt", b"x").await.unwrap();
        store.create("bob", "a.txt", b"y").await.unwrap();
        assert!(matches!(
            store.transfer("alice", "a.txt", "bob").await,
            Err(FileStoreError::AlreadyExists)
        ));
        store.transfer("alice", "a.txt", "carol").await.unwrap();
        assert_eq!(store.read_at("carol", "a.txt", 0, 1).await.unwrap(), b"x");
        assert!(matches!(store.len("alice", "a.txt").await, Err(FileStoreError::NotFound)));

        store.remove_owner("carol").await.unwrap();
        store.remove_owner("carol").await.unwrap();
        assert!(matches!(store.delete("carol", "a.txt").await, Err(FileStoreError::NotFound)));
    }
}
