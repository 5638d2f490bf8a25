use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::UploadError;

fn storage_error(path: &Path) -> impl FnOnce(io::Error) -> UploadError + '_ {
    move |source| UploadError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

/// Move a file from `src` to `dst`, replacing `dst`. Uses `rename` first and
/// falls back to copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), UploadError> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(storage_error(dst))?;
    fs::remove_file(src).map_err(storage_error(src))?;
    Ok(())
}

/// Hex-encoded SHA-256 of `bytes`, the hash format chunk uploads declare.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Where chunk parts and assembled documents live on disk.
///
/// Layout under the root: `chunks/<document>/<number>.part` and
/// `documents/<document>.bin`.
#[derive(Debug, Clone)]
pub struct ChunkStorage {
    root: PathBuf,
}

/// Result of streaming chunks into one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
}

impl ChunkStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_directory(&self, document_id: &str) -> PathBuf {
        self.root.join("chunks").join(document_id)
    }

    pub fn chunk_path(&self, document_id: &str, chunk_number: u32) -> PathBuf {
        self.chunk_directory(document_id)
            .join(format!("{:06}.part", chunk_number))
    }

    pub fn assembled_path(&self, document_id: &str) -> PathBuf {
        self.root.join("documents").join(format!("{}.bin", document_id))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), UploadError> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(storage_error(path))?;
        }
        Ok(())
    }

    /// Writes a chunk part, replacing any earlier bytes for the same number.
    /// The part is written beside its final name and then renamed so a
    /// reader never sees a half-written chunk.
    pub fn write_chunk(
        &self,
        document_id: &str,
        chunk_number: u32,
        bytes: &[u8],
    ) -> Result<PathBuf, UploadError> {
        let dir = self.chunk_directory(document_id);
        self.ensure_directory(&dir)?;

        let final_path = self.chunk_path(document_id, chunk_number);
        let tmp_path = dir.join(format!(
            "{:06}.{}.tmp",
            chunk_number,
            uuid::Uuid::new_v4().simple()
        ));
        let mut file = File::create(&tmp_path).map_err(storage_error(&tmp_path))?;
        file.write_all(bytes).map_err(storage_error(&tmp_path))?;
        file.sync_all().map_err(storage_error(&tmp_path))?;
        drop(file);

        move_file(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    /// Concatenates `parts` in the given order into the document's assembled
    /// file, hashing as it goes.
    pub fn write_assembled(
        &self,
        document_id: &str,
        parts: &[PathBuf],
    ) -> Result<WrittenFile, UploadError> {
        let final_path = self.assembled_path(document_id);
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        self.ensure_directory(&dir)?;

        let tmp_path = dir.join(format!("{}.assembling", document_id));
        let mut out = File::create(&tmp_path).map_err(storage_error(&tmp_path))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        for part in parts {
            let mut input = File::open(part).map_err(storage_error(part))?;
            loop {
                let n = input.read(&mut buf).map_err(storage_error(part))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).map_err(storage_error(&tmp_path))?;
                size += n as u64;
            }
        }
        out.sync_all().map_err(storage_error(&tmp_path))?;
        drop(out);

        move_file(&tmp_path, &final_path)?;
        Ok(WrittenFile {
            path: final_path,
            size,
            hash: hex::encode(hasher.finalize()),
        })
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, UploadError> {
        fs::read(path).map_err(storage_error(path))
    }

    /// Removes every chunk part of a document. A missing directory is fine.
    pub fn remove_chunks(&self, document_id: &str) -> Result<(), UploadError> {
        let dir = self.chunk_directory(document_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Storage { path: dir, source: e }),
        }
    }

    pub fn remove_file(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}
