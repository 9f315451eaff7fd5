//! Per-worker session state.
//!
//! A session survives its TCP connection: it is keyed by connection id in
//! the coordinator's table but reclaimable through its opaque token. The
//! download and upload streams are owned by the session slot and guarded so
//! the coordinator's idle bookkeeping stays correct on every exit path
//! (normal close, abort, forced shutdown).

use remote::protocol::RpcFault;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use common::fs::FileTimes;
use common::media::{EncodingResultInfo, MediaEncoderSettings, MediaFileRequirements};

/// Counts a stream as open for as long as the guard lives.
#[derive(Debug)]
pub(crate) struct StreamGuard {
    counter: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl StreamGuard {
    pub(crate) fn new(counter: &std::sync::Arc<std::sync::atomic::AtomicUsize>) -> Self {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Download {
    file: tokio::fs::File,
    pos: u64,
    len: u64,
    _guard: StreamGuard,
}

#[derive(Debug)]
struct Upload {
    file: tokio::fs::File,
    written: u64,
    expected: u64,
    _guard: StreamGuard,
}

#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub last_activity: std::time::Instant,
    pub filter: MediaFileRequirements,
    pub source_id: i64,
    pub src_path: std::path::PathBuf,
    pub settings: MediaEncoderSettings,
    pub result: EncodingResultInfo,
    pub times: Option<FileTimes>,
    pub tmp_path: std::path::PathBuf,
    download: Option<Download>,
    upload: Option<Upload>,
}

impl Session {
    pub fn new(token: String) -> Self {
        Self {
            token,
            last_activity: std::time::Instant::now(),
            filter: MediaFileRequirements::default(),
            source_id: 0,
            src_path: std::path::PathBuf::new(),
            settings: MediaEncoderSettings::default(),
            result: EncodingResultInfo::default(),
            times: None,
            tmp_path: std::path::PathBuf::new(),
            download: None,
            upload: None,
        }
    }

    pub fn has_open_stream(&self) -> bool {
        self.download.is_some() || self.upload.is_some()
    }

    pub(crate) fn open_download(&mut self, file: tokio::fs::File, len: u64, guard: StreamGuard) {
        self.download = Some(Download {
            file,
            pos: 0,
            len,
            _guard: guard,
        });
    }

    pub(crate) async fn open_upload(
        &mut self,
        tmp_path: std::path::PathBuf,
        expected: u64,
        guard: StreamGuard,
    ) -> Result<(), RpcFault> {
        let file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| RpcFault::Io(format!("could not open temp file {tmp_path:?}: {e}")))?;
        self.tmp_path = tmp_path;
        self.upload = Some(Upload {
            file,
            written: 0,
            expected,
            _guard: guard,
        });
        Ok(())
    }

    /// Read the next chunk of the reserved source. `has_more` is false once
    /// the recorded length has been served.
    pub async fn read_chunk(&mut self, chunk_size: usize) -> Result<(bool, Vec<u8>), RpcFault> {
        let Some(download) = self.download.as_mut() else {
            return Err(RpcFault::InvalidState("no file is open for read".to_string()));
        };
        let want = chunk_size.min((download.len - download.pos) as usize);
        let mut data = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = download
                .file
                .read(&mut data[filled..])
                .await
                .map_err(|e| RpcFault::Io(format!("cannot read from {:?}: {e}", self.src_path)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        download.pos += filled as u64;
        Ok((download.pos < download.len, data))
    }

    /// Append to the upload sink. Returns true while more data is expected;
    /// the chunk completing the declared length closes the sink.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<bool, RpcFault> {
        let Some(upload) = self.upload.as_mut() else {
            return Err(RpcFault::InvalidState("no upload in progress".to_string()));
        };
        if upload.written + data.len() as u64 > upload.expected {
            return Err(RpcFault::InvalidState(format!(
                "write past declared length ({} + {} > {})",
                upload.written,
                data.len(),
                upload.expected
            )));
        }
        upload
            .file
            .write_all(data)
            .await
            .map_err(|e| RpcFault::Io(format!("cannot write to {:?}: {e}", self.tmp_path)))?;
        upload.written += data.len() as u64;
        if upload.written == upload.expected {
            upload
                .file
                .flush()
                .await
                .map_err(|e| RpcFault::Io(format!("cannot flush {:?}: {e}", self.tmp_path)))?;
            self.upload = None;
            return Ok(false);
        }
        Ok(true)
    }

    /// Rewind the active transfer after a transport interruption.
    pub async fn rewind(&mut self) -> Result<(), RpcFault> {
        if let Some(download) = self.download.as_mut() {
            download
                .file
                .seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|e| RpcFault::Io(format!("cannot seek in {:?}: {e}", self.src_path)))?;
            download.pos = 0;
        } else if let Some(upload) = self.upload.as_mut() {
            upload
                .file
                .seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|e| RpcFault::Io(format!("cannot seek in {:?}: {e}", self.tmp_path)))?;
            upload
                .file
                .set_len(0)
                .await
                .map_err(|e| RpcFault::Io(format!("cannot truncate {:?}: {e}", self.tmp_path)))?;
            upload.written = 0;
        }
        Ok(())
    }

    /// Bytes of the source served so far.
    pub fn download_position(&self) -> Option<u64> {
        self.download.as_ref().map(|d| d.pos)
    }

    pub fn close_download(&mut self) {
        self.download = None;
    }

    pub fn close_streams(&mut self) {
        self.download = None;
        self.upload = None;
    }

    /// Forget the reserved job and drop any streams; the session itself
    /// stays authenticated.
    pub fn clear_job(&mut self) {
        self.close_streams();
        self.source_id = 0;
        self.src_path = std::path::PathBuf::new();
        self.settings = MediaEncoderSettings::default();
        self.result = EncodingResultInfo::default();
        self.times = None;
        self.tmp_path = std::path::PathBuf::new();
    }
}
