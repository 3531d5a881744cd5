use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

use crate::error::CacheError;

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates the file at `dest_path` with the contents `data`, so that readers
/// of `dest_path` never see a partially-written file.
///
/// The steps are:
///
/// 1. Create a uniquely-named temporary file in `staging_dir`.
/// 2. Write `data` into it and flush it to stable storage.
/// 3. Rename the temporary file to `dest_path`, replacing any existing file.
///
/// `staging_dir` must be on the same file system as `dest_path`, so that the
/// rename is atomic. If two writers race for the same destination, both
/// renames succeed and the last one wins; each of them leaves a complete file
/// behind.
///
/// If anything fails, the temporary file is removed. If this process is
/// terminated before we can do so, the temporary file is left behind in
/// `staging_dir`, which is why the cache empties the staging directory when
/// it is opened.
pub async fn create_file_cleanly(
    staging_dir: &Path,
    dest_path: &Path,
    data: &[u8],
) -> Result<(), CacheError> {
    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::DirectoryCreation(parent.to_path_buf(), e))?;
    }

    let temp_file_path = unique_temp_path(staging_dir, dest_path);
    let mut temp_file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_file_path)
        .await
        .map_err(CacheError::TempFileCreation)?;

    let write_result = async {
        temp_file.write_all(data).await?;
        temp_file.flush().await?;
        temp_file.sync_all().await
    }
    .await;
    // Close the file before renaming it.
    drop(temp_file);

    if let Err(write_error) = write_result {
        let _ = tokio::fs::remove_file(&temp_file_path).await;
        return Err(CacheError::TempFileWrite(write_error));
    }

    if let Err(rename_error) = tokio::fs::rename(&temp_file_path, dest_path).await {
        let _ = tokio::fs::remove_file(&temp_file_path).await;
        return Err(CacheError::RenameError(rename_error));
    }

    Ok(())
}

fn unique_temp_path(staging_dir: &Path, dest_path: &Path) -> PathBuf {
    let counter = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = dest_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    staging_dir.join(format!(
        "{file_name}.{}.{counter}.part",
        std::process::id()
    ))
}
