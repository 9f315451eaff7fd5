//! The coordination plane: session table, RPC operation dispatch, the
//! finalizer queue and shutdown.
//!
//! One mutex guards both the session table and the finalizer queue so the
//! handoff between "a session finished its upload" and "the finalizer picks
//! the file up" is atomic with the idle check. A session's own streams are
//! behind the per-session lock; the table lock is never held while a
//! session lock is taken, and a handler holding its session lock may push
//! onto the queue, so lock order is always session before table.

use std::sync::atomic::Ordering;

use remote::protocol::{Request, Response, RpcFault};
use tokio_util::sync::CancellationToken;

use crate::session::{Session, StreamGuard};
use catalog::Catalog;
use common::config::DaemonConfig;
use common::fs::FileTimes;
use common::media::{
    self, status, EncodedFile, EncodingResultInfo, MediaEncoderSettings, MediaFileRequirements,
};

/// How long a disconnected session stays reclaimable by its token.
const SESSION_GRACE: std::time::Duration = std::time::Duration::from_secs(300);

/// A completed upload (or failed encode) waiting for the finalizer.
#[derive(Debug)]
pub struct FileToMove {
    pub record: EncodedFile,
    pub tmp: std::path::PathBuf,
    pub times: Option<FileTimes>,
}

struct SessionSlot {
    token: String,
    session: std::sync::Arc<tokio::sync::Mutex<Session>>,
}

pub(crate) struct State {
    sessions: std::collections::HashMap<u64, SessionSlot>,
    pub(crate) files_to_move: std::collections::VecDeque<FileToMove>,
}

pub struct Coordinator {
    cfg: DaemonConfig,
    matcher: media::InterestingMatcher,
    catalog: Catalog,
    pub(crate) state: tokio::sync::Mutex<State>,
    pub(crate) queue_cv: tokio::sync::Notify,
    stop_requested: std::sync::atomic::AtomicBool,
    open_streams: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    server_stop: CancellationToken,
}

impl Coordinator {
    pub fn new(cfg: DaemonConfig, catalog: Catalog) -> anyhow::Result<Self> {
        let matcher = media::InterestingMatcher::new(&cfg.filename_match_pattern)?;
        Ok(Self {
            cfg,
            matcher,
            catalog,
            state: tokio::sync::Mutex::new(State {
                sessions: std::collections::HashMap::new(),
                files_to_move: std::collections::VecDeque::new(),
            }),
            queue_cv: tokio::sync::Notify::new(),
            stop_requested: std::sync::atomic::AtomicBool::new(false),
            open_streams: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            server_stop: CancellationToken::new(),
        })
    }

    pub fn cfg(&self) -> &DaemonConfig {
        &self.cfg
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn matcher(&self) -> &media::InterestingMatcher {
        &self.matcher
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Token the RPC server watches to stop accepting calls; cancelled once
    /// the finalizer has drained.
    pub(crate) fn server_stop_token(&self) -> CancellationToken {
        self.server_stop.clone()
    }

    pub(crate) fn stop_accepting(&self) {
        self.server_stop.cancel();
    }

    /// Request shutdown. A forced stop additionally makes every session
    /// abandon its in-flight transfer and puts the reserved files back in
    /// the queue.
    pub async fn stop(&self, forced: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        tracing::info!("{} stopping requested", if forced { "FORCED" } else { "NORMAL" });
        if forced {
            let sessions: Vec<_> = {
                let state = self.state.lock().await;
                state
                    .sessions
                    .values()
                    .map(|slot| slot.session.clone())
                    .collect()
            };
            for session in sessions {
                let mut session = session.lock().await;
                if session.has_open_stream() {
                    session.close_streams();
                    if session.source_id != 0 {
                        if let Err(error) = self.catalog.reset(session.source_id).await {
                            tracing::error!(
                                "could not requeue file {}: {error}",
                                session.source_id
                            );
                        }
                    }
                    session.clear_job();
                }
            }
        }
        self.queue_cv.notify_one();
    }

    /// Dispatch one RPC call for a connection.
    pub async fn handle(&self, conn_id: u64, request: Request) -> Result<Response, RpcFault> {
        tracing::debug!("{} requested ({conn_id:x})", request.method());
        match request {
            Request::GetVersion => Ok(Response::Version(remote::PROTOCOL_VERSION)),
            Request::Authenticate { token } => {
                self.authenticate(conn_id, token).await;
                Ok(Response::Done)
            }
            Request::GetNextFile { filter } => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                let settings = self.get_next_file(&mut session, filter).await?;
                Ok(Response::Settings(settings))
            }
            Request::ReadChunk => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                let (has_more, data) = session.read_chunk(self.cfg.chunk_size).await?;
                Ok(Response::Chunk { has_more, data })
            }
            Request::PostFile { result } => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                self.post_file(&mut session, result).await?;
                Ok(Response::Done)
            }
            Request::WriteChunk { data } => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                let more_expected = self.write_chunk(&mut session, &data).await?;
                Ok(Response::MoreExpected(more_expected))
            }
            Request::Reset => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                session.rewind().await?;
                Ok(Response::Done)
            }
            Request::Abort => {
                let session = self.authenticated(conn_id).await?;
                let mut session = session.lock().await;
                session.last_activity = std::time::Instant::now();
                self.abort(&mut session).await?;
                Ok(Response::Done)
            }
        }
    }

    async fn authenticated(
        &self,
        conn_id: u64,
    ) -> Result<std::sync::Arc<tokio::sync::Mutex<Session>>, RpcFault> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(&conn_id)
            .map(|slot| slot.session.clone())
            .ok_or(RpcFault::NotAuthenticated)
    }

    /// Create a session for this connection, or adopt the state of an
    /// earlier session holding the same token (reconnect). Also sweeps
    /// slots whose grace period has passed.
    async fn authenticate(&self, conn_id: u64, token: String) {
        let mut state = self.state.lock().await;
        let reclaimed = state
            .sessions
            .iter()
            .find(|(_, slot)| slot.token == token)
            .map(|(key, _)| *key);
        let slot = reclaimed
            .and_then(|key| {
                tracing::info!("session with token {token:?} reclaimed by connection {conn_id:x}");
                state.sessions.remove(&key)
            })
            .unwrap_or_else(|| SessionSlot {
                token: token.clone(),
                session: std::sync::Arc::new(tokio::sync::Mutex::new(Session::new(token.clone()))),
            });
        state.sessions.insert(conn_id, slot);
        // drop abandoned sessions that nobody reclaimed in time
        state.sessions.retain(|key, slot| {
            if *key == conn_id {
                return true;
            }
            match slot.session.try_lock() {
                Ok(session) => {
                    session.has_open_stream() || session.last_activity.elapsed() < SESSION_GRACE
                }
                Err(_) => true,
            }
        });
    }

    async fn get_next_file(
        &self,
        session: &mut Session,
        filter: MediaFileRequirements,
    ) -> Result<MediaEncoderSettings, RpcFault> {
        if session.has_open_stream() {
            return Err(RpcFault::InvalidState(format!(
                "file {} <{:?}> is still open",
                session.source_id, session.src_path
            )));
        }
        session.clear_job();
        session.filter = filter.clone();
        let mut settings = MediaEncoderSettings {
            encoder_type: filter.encoder_type.clone(),
            final_extension: self.cfg.final_extension.clone(),
            ..MediaEncoderSettings::default()
        };
        if self.stop_requested() {
            tracing::debug!("shutdown in progress, not handing out files");
            return Ok(settings);
        }
        loop {
            let file = self
                .catalog
                .reserve_next(filter.max_file_size)
                .await
                .map_err(|e| RpcFault::Catalog(e.to_string()))?;
            let Some(file) = file else {
                tracing::info!("no files found to process");
                return Ok(settings);
            };
            if file.size == 0 {
                tracing::warn!("file {:?} skipped due to zero length", file.path);
                self.record_failure(
                    file.id,
                    &file.path,
                    EncodingResultInfo::new(status::PERMANENT_ERROR, 0, "zero length file"),
                )
                .await?;
                continue;
            }
            let opened = tokio::fs::File::open(&file.path).await;
            let reader = match opened {
                Ok(reader) => reader,
                Err(error) => {
                    tracing::error!("could not open file {:?}: {error}", file.path);
                    self.record_failure(
                        file.id,
                        &file.path,
                        EncodingResultInfo::new(
                            status::SERVER_IO_ERROR,
                            0,
                            format!("could not open source: {error}"),
                        ),
                    )
                    .await?;
                    return Err(RpcFault::Io(format!(
                        "could not open file {:?}: {error}",
                        file.path
                    )));
                }
            };
            let times = common::fs::get_times(&file.path)
                .await
                .map_err(|e| RpcFault::Io(format!("{e:#}")))?;
            settings.file_length = file.size;
            settings.file_extension = media::file_extension(&file.path);
            settings.command_line_parameters = media::command_line_parameters(
                &self.cfg.v_codec,
                &self.cfg.a_codec,
                self.cfg.crf,
                self.cfg.a_bitrate,
            );
            session.open_download(reader, file.size, StreamGuard::new(&self.open_streams));
            session.source_id = file.id;
            session.src_path = file.path.clone();
            session.times = Some(times);
            session.settings = settings.clone();
            tracing::info!("next file to process: {} ({:?})", file.id, file.path);
            return Ok(settings);
        }
    }

    async fn record_failure(
        &self,
        source_id: i64,
        src_path: &std::path::Path,
        info: EncodingResultInfo,
    ) -> Result<(), RpcFault> {
        let record = EncodedFile {
            info,
            source_id,
            path: self.archived_name(src_path),
        };
        self.catalog
            .add_encoded(&record)
            .await
            .map_err(|e| RpcFault::Catalog(e.to_string()))
    }

    async fn post_file(
        &self,
        session: &mut Session,
        result: EncodingResultInfo,
    ) -> Result<(), RpcFault> {
        if session.source_id == 0 {
            return Err(RpcFault::InvalidState("no reserved job".to_string()));
        }
        if let Some(position) = session.download_position() {
            if position != session.settings.file_length {
                return Err(RpcFault::InvalidState(format!(
                    "file not read to the end ({position} of {})",
                    session.settings.file_length
                )));
            }
            session.close_download();
        }
        if session.has_open_stream() {
            return Err(RpcFault::InvalidState("upload already in progress".to_string()));
        }
        session.result = result.clone();
        if result.status == status::OK && result.file_length > 0 {
            let tmp_path = self.cfg.temp_folder.join(session.source_id.to_string());
            session
                .open_upload(
                    tmp_path,
                    result.file_length,
                    StreamGuard::new(&self.open_streams),
                )
                .await?;
        } else {
            // an OK result without data must be recorded as a failure, or
            // the catalog would install an archive row for a file that was
            // never uploaded
            if session.result.status == status::OK {
                session.result.status = status::UNKNOWN_ERROR;
                if session.result.error.is_empty() {
                    session.result.error = "no encoded data produced".to_string();
                }
            }
            tracing::error!(
                "encoding failed for id {} ({:?}): {}",
                session.source_id,
                session.src_path,
                session.result.error
            );
            self.enqueue_finalize(session).await;
        }
        Ok(())
    }

    async fn write_chunk(&self, session: &mut Session, data: &[u8]) -> Result<bool, RpcFault> {
        if session.source_id == 0 || session.result.file_length == 0 {
            return Err(RpcFault::InvalidState("no upload in progress".to_string()));
        }
        let more_expected = session.write_chunk(data).await?;
        if !more_expected {
            tracing::info!(
                "upload complete for id {}, file can be moved",
                session.source_id
            );
            self.enqueue_finalize(session).await;
        }
        Ok(more_expected)
    }

    async fn abort(&self, session: &mut Session) -> Result<(), RpcFault> {
        if !session.has_open_stream() {
            return Ok(());
        }
        session.close_streams();
        if session.source_id != 0 {
            self.catalog
                .reset(session.source_id)
                .await
                .map_err(|e| RpcFault::Catalog(e.to_string()))?;
        }
        session.clear_job();
        Ok(())
    }

    /// Hand the finished (or failed) job to the finalizer and clear the
    /// session for its next file.
    async fn enqueue_finalize(&self, session: &mut Session) {
        let item = FileToMove {
            record: EncodedFile {
                info: session.result.clone(),
                source_id: session.source_id,
                path: self.archived_name(&session.src_path),
            },
            tmp: session.tmp_path.clone(),
            times: session.times,
        };
        session.clear_job();
        let mut state = self.state.lock().await;
        state.files_to_move.push_back(item);
        drop(state);
        self.queue_cv.notify_one();
    }

    pub(crate) fn archived_name(&self, source: &std::path::Path) -> std::path::PathBuf {
        media::archived_name(source, &self.cfg.result_file_suffix, &self.cfg.final_extension)
    }

    pub(crate) fn on_disconnect(&self, conn_id: u64) {
        tracing::debug!("connection {conn_id:x} closed, session kept for token reclaim");
    }
}
