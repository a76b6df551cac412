//! Locked JSON file primitives shared by the on-disk stores.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::Result;
use fs4::tokio::AsyncFileExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Opens (creating missing directories and the file itself) and exclusively
/// locks a file. The caller must unlock it, also on the error path.
pub(crate) async fn open_locked(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.lock_exclusive()?;
    Ok(file)
}

/// Replaces the file's contents with `value` as JSON.
pub(crate) async fn rewrite<T: Serialize + ?Sized>(file: &mut File, value: &T) -> Result<()> {
    let buffer = serde_json::to_vec(value)?;
    file.set_len(0).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    file.write_all(&buffer).await?;
    file.flush().await?;
    Ok(())
}

pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut file = open_locked(path).await?;
    let result = rewrite(&mut file, value).await;
    file.unlock_async().await?;
    result
}

/// Reads the file under a shared lock. Missing files read as `None`.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    debug!("Reading {path:?}");
    let mut file = match File::open(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    file.lock_shared()?;
    let mut contents = String::new();
    let read = file.read_to_string(&mut contents).await;
    file.unlock_async().await?;
    read?;
    Ok(parse_json(&contents, path))
}

/// Empty or unparsable contents count as missing. Might happen after
/// shutdowns cutting off a write.
pub(crate) fn parse_json<T: DeserializeOwned>(contents: &str, path: &Path) -> Option<T> {
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(contents) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Found illegal json in {path:?}: {e}");
            None
        }
    }
}
