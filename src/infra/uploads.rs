//! Filesystem storage for uploaded compilation sources.

use std::error::Error as StdError;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures::{StreamExt, pin_mut, stream};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Debug, Error)]
pub enum UploadStorageError {
    #[error("invalid stored path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("uploaded file exceeds configured body limit")]
    PayloadTooLarge {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded file stream failed")]
    PayloadStream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded file is empty")]
    EmptyPayload,
    #[error("uploaded file size exceeds supported range")]
    SizeOverflow,
}

/// A source persisted under the uploads root.
#[derive(Debug, Clone)]
pub struct StoredSource {
    pub path: PathBuf,
    pub stored_name: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct SourceStorage {
    root: PathBuf,
}

impl SourceStorage {
    /// Open storage rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Stream a payload to `<root>/<stored_name>` while hashing it.
    ///
    /// Partially written files are removed when the stream fails or turns out
    /// to be empty.
    pub async fn store_stream<S>(
        &self,
        stored_name: &str,
        stream: S,
    ) -> Result<StoredSource, UploadStorageError>
    where
        S: futures::Stream<Item = Result<Bytes, UploadStorageError>>,
    {
        let absolute = self.resolve(stored_name)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&absolute).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&absolute).await;
                    return Err(err);
                }
            };

            if chunk.is_empty() {
                continue;
            }

            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or(UploadStorageError::SizeOverflow)?;
            if let Err(err) = file.write_all(&chunk).await {
                drop(file);
                let _ = fs::remove_file(&absolute).await;
                return Err(err.into());
            }
            hasher.update(&chunk);
        }

        file.flush().await?;
        drop(file);

        if total_bytes == 0 {
            let _ = fs::remove_file(&absolute).await;
            return Err(UploadStorageError::EmptyPayload);
        }

        Ok(StoredSource {
            path: absolute,
            stored_name: stored_name.to_string(),
            checksum: hex::encode(hasher.finalize()),
            size_bytes: total_bytes,
        })
    }

    /// Store a fully buffered payload.
    pub async fn store(
        &self,
        stored_name: &str,
        data: Bytes,
    ) -> Result<StoredSource, UploadStorageError> {
        let stream = stream::once(async move { Ok::<_, UploadStorageError>(data) });
        self.store_stream(stored_name, stream).await
    }

    /// Remove a stored source. Missing files are treated as success.
    pub async fn delete(&self, stored_name: &str) -> Result<(), UploadStorageError> {
        let absolute = self.resolve(stored_name)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(UploadStorageError::Io(err)),
        }
    }

    fn resolve(&self, stored_name: &str) -> Result<PathBuf, UploadStorageError> {
        let relative = Path::new(stored_name);
        if stored_name.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(UploadStorageError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}
