use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, Deserialize, Infallible, Serialize};
use sentinel_core::error::{ErrorKind, SentinelError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

const EXTENSION: &str = "ckpt";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error")]
    Serialization,
    #[error("checkpoint {0} is corrupt")]
    Corrupt(PathBuf),
    #[error("invalid checkpoint name: {0}")]
    InvalidName(String),
}

impl SentinelError for CheckpointError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            CheckpointError::InvalidName(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        }
    }
}

/// Durable progress markers for long-running jobs. Files are named
/// `<name>_<seq>.ckpt` and framed as `[crc32 LE][rkyv payload]`.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically writes to a temp file then renames.
    pub async fn save<T>(&self, name: &str, seq: u64, value: &T) -> Result<PathBuf, CheckpointError>
    where
        T: Serialize<AllocSerializer<4096>>,
    {
        validate_name(name)?;
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }

        let payload =
            rkyv::to_bytes::<_, 4096>(value).map_err(|_| CheckpointError::Serialization)?;
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        framed.extend_from_slice(&payload);

        let path = self.dir.join(format!("{}_{:020}.{}", name, seq, EXTENSION));
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, &framed).await?;
        fs::rename(&tmp_path, &path).await?;

        Ok(path)
    }

    /// Loads the newest readable checkpoint for `name`. Corrupt files are
    /// skipped in favour of older ones.
    pub async fn latest<T>(&self, name: &str) -> Result<Option<(u64, T)>, CheckpointError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        validate_name(name)?;
        let mut candidates = self.list(name).await?;
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (seq, path) in candidates {
            match read_framed::<T>(&path).await {
                Ok(value) => return Ok(Some((seq, value))),
                Err(CheckpointError::Corrupt(path)) => {
                    tracing::warn!(path = %path.display(), "skipping corrupt checkpoint");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    /// Every readable checkpoint for `name`, oldest sequence first. Corrupt
    /// files are skipped.
    pub async fn all<T>(&self, name: &str) -> Result<Vec<(u64, T)>, CheckpointError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        validate_name(name)?;
        let mut candidates = self.list(name).await?;
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut loaded = Vec::with_capacity(candidates.len());
        for (seq, path) in candidates {
            match read_framed::<T>(&path).await {
                Ok(value) => loaded.push((seq, value)),
                Err(CheckpointError::Corrupt(path)) => {
                    tracing::warn!(path = %path.display(), "skipping corrupt checkpoint");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(loaded)
    }

    /// Removes every checkpoint for `name`.
    pub async fn clear(&self, name: &str) -> Result<usize, CheckpointError> {
        validate_name(name)?;
        let candidates = self.list(name).await?;
        let removed = candidates.len();
        for (_, path) in candidates {
            fs::remove_file(&path).await?;
        }
        Ok(removed)
    }

    async fn list(&self, name: &str) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}_", name);
        let suffix = format!(".{}", EXTENSION);
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(seq) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            found.push((seq, path));
        }
        Ok(found)
    }
}

fn validate_name(name: &str) -> Result<(), CheckpointError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidName(name.to_string()))
    }
}

async fn read_framed<T>(path: &Path) -> Result<T, CheckpointError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let bytes = fs::read(path).await?;
    if bytes.len() < 4 {
        return Err(CheckpointError::Corrupt(path.to_path_buf()));
    }
    let (header, payload) = bytes.split_at(4);
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if crc32fast::hash(payload) != expected {
        return Err(CheckpointError::Corrupt(path.to_path_buf()));
    }

    let mut aligned = AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);
    let archived = rkyv::check_archived_root::<T>(&aligned)
        .map_err(|_| CheckpointError::Corrupt(path.to_path_buf()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|_| CheckpointError::Corrupt(path.to_path_buf()))
}
