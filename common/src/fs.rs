//! File operations that keep the original timestamps intact.
//!
//! The archive workflow moves encoded files next to their sources and must
//! leave the source's atime/mtime on the installed result, so every copy or
//! move here carries an explicit time-preservation rule: pass the times to
//! stamp on the destination, or let the source's own times be captured and
//! re-applied.

use anyhow::{Context, Result};
use nix::sys::time::TimeSpec;
use std::os::unix::fs::MetadataExt;

const COPY_BUFFER: usize = 128 * 1024;

/// An atime/mtime pair with nanosecond precision.
#[derive(Clone, Copy, Debug)]
pub struct FileTimes {
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
}

impl FileTimes {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            atime: TimeSpec::new(metadata.atime(), metadata.atime_nsec()),
            mtime: TimeSpec::new(metadata.mtime(), metadata.mtime_nsec()),
        }
    }

    /// Both fields pinned to a single timestamp.
    pub fn pinned(mtime: TimeSpec) -> Self {
        Self { atime: mtime, mtime }
    }
}

/// Read the atime/mtime pair of `path`.
pub async fn get_times(path: &std::path::Path) -> Result<FileTimes> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))?;
    Ok(FileTimes::from_metadata(&metadata))
}

/// Stamp an atime/mtime pair onto `path`.
pub async fn set_times(path: &std::path::Path, times: &FileTimes) -> Result<()> {
    let dst = path.to_owned();
    let times = *times;
    tokio::task::spawn_blocking(move || -> Result<()> {
        nix::sys::stat::utimensat(
            None,
            &dst,
            &times.atime,
            &times.mtime,
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        )
        .with_context(|| format!("failed setting timestamps for {:?}", &dst))?;
        Ok(())
    })
    .await?
}

/// Size of the file at `path` in bytes.
pub async fn size(path: &std::path::Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))?;
    Ok(metadata.len())
}

/// Stream-copy `src` to `dst` and apply `times` to the destination, or the
/// source's own times when none are given. Returns the number of bytes
/// copied.
pub async fn copy(
    src: &std::path::Path,
    dst: &std::path::Path,
    times: Option<FileTimes>,
) -> Result<u64> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {:?} for reading", src))?;
    let src_metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))?;
    let mut buf_reader = tokio::io::BufReader::with_capacity(COPY_BUFFER, &mut reader);
    let mut writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("cannot open {:?} for writing", dst))?;
    let copied = tokio::io::copy_buf(&mut buf_reader, &mut writer)
        .await
        .with_context(|| format!("failed copying data to {:?}", dst))?;
    drop(writer);
    let times = times.unwrap_or_else(|| FileTimes::from_metadata(&src_metadata));
    set_times(dst, &times).await?;
    Ok(copied)
}

/// Move `src` to `dst` - rename where the file system allows it, otherwise
/// copy and unlink - and apply `times` (or the source's own times) to the
/// destination.
pub async fn move_file(
    src: &std::path::Path,
    dst: &std::path::Path,
    times: Option<FileTimes>,
) -> Result<()> {
    // capture the source times before it goes away
    let times = match times {
        Some(times) => times,
        None => get_times(src).await?,
    };
    match tokio::fs::rename(src, dst).await {
        Ok(()) => {
            set_times(dst, &times).await?;
            Ok(())
        }
        Err(error) if error.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!("rename {:?} -> {:?} crosses devices, copying", src, dst);
            copy(src, dst, Some(times)).await?;
            tokio::fs::remove_file(src)
                .await
                .with_context(|| format!("failed removing {:?} after copy", src))?;
            Ok(())
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed moving {:?} to {:?}", src, dst))
        }
    }
}
