//! Moves finished files out of the inbox.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::orchestration::config::LayoutConfig;

const MAX_COLLISION_SUFFIX: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Processed,
    Duplicates,
    Error,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Processed => write!(f, "processed"),
            Destination::Duplicates => write!(f, "duplicates"),
            Destination::Error => write!(f, "error"),
        }
    }
}

pub struct FileRelocator {
    processed: PathBuf,
    duplicates: PathBuf,
    error: PathBuf,
    // Serialises name selection and the move so two files with the same name
    // never race for the same target.
    lock: Mutex<()>,
}

impl fmt::Debug for FileRelocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRelocator")
            .field("processed", &self.processed)
            .field("duplicates", &self.duplicates)
            .field("error", &self.error)
            .finish()
    }
}

impl FileRelocator {
    pub fn from_layout(layout: &LayoutConfig) -> Self {
        Self {
            processed: layout.processed_dir(),
            duplicates: layout.duplicates_dir(),
            error: layout.error_dir(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir_for(&self, destination: Destination) -> &Path {
        match destination {
            Destination::Processed => &self.processed,
            Destination::Duplicates => &self.duplicates,
            Destination::Error => &self.error,
        }
    }

    /// Create every output directory. Failing here is fatal at startup.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.processed, &self.duplicates, &self.error] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| PipelineError::path_io(dir, err))?;
        }
        Ok(())
    }

    /// Move `source` into `destination`, returning the final path.
    pub async fn relocate(&self, source: &Path, destination: Destination) -> Result<PathBuf> {
        let dir = self.dir_for(destination);
        let file_name = source.file_name().ok_or_else(|| {
            PipelineError::path_io(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;

        let _guard = self.lock.lock().await;
        let target = free_target(dir, Path::new(file_name)).await?;
        move_file(source, &target).await?;
        debug!(
            target: "paperwatch::worker",
            from = %source.display(),
            to = %target.display(),
            %destination,
            "file relocated"
        );
        Ok(target)
    }
}

/// `dir/name.ext`, or the first free `dir/name-N.ext`.
async fn free_target(dir: &Path, file_name: &Path) -> Result<PathBuf> {
    let candidate = dir.join(file_name);
    if !exists(&candidate).await? {
        return Ok(candidate);
    }

    let stem = file_name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file_name
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());

    for n in 1..=MAX_COLLISION_SUFFIX {
        let name = match &extension {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(name);
        if !exists(&candidate).await? {
            return Ok(candidate);
        }
    }

    Err(PipelineError::path_io(
        dir.join(file_name),
        io::Error::new(io::ErrorKind::AlreadyExists, "no free name for relocated file"),
    ))
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|err| PipelineError::path_io(path, err))
}

async fn move_file(source: &Path, target: &Path) -> Result<()> {
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(source, target)
                .await
                .map_err(|err| PipelineError::path_io(target, err))?;
            tokio::fs::remove_file(source)
                .await
                .map_err(|err| PipelineError::path_io(source, err))
        }
        Err(err) => Err(PipelineError::path_io(source, err)),
    }
}
