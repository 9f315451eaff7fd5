//! End-to-end tests driving a real worker connection against an in-process
//! daemon: reserve, download, post, upload, finalize.

use remote::protocol::{Reply, Request, Response, RpcFault};
use remote::streams::ControlConnection;

use common::media::{status, EncodingResultInfo, MediaEncoderSettings, MediaFileRequirements};

struct TestDaemon {
    daemon: Option<marchive_daemon::Daemon>,
    catalog: catalog::Catalog,
    media_dir: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

impl TestDaemon {
    /// Catalog, temp folder and media tree all live under one temp dir; the
    /// server binds an ephemeral port. `media` holds `(name, size)` files
    /// that are seeded straight into the catalog.
    async fn start(chunk_size: usize, media: &[(&str, usize)]) -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let media_dir = tmp.path().join("media");
        tokio::fs::create_dir(&media_dir).await?;
        let cfg = common::config::DaemonConfig {
            server_port: 0,
            chunk_size,
            db_path: tmp.path().join("catalog.db"),
            temp_folder: tmp.path().join("tmp"),
            ..common::config::DaemonConfig::default()
        };
        let catalog = catalog::Catalog::open(&cfg.db_path, true).await?;
        for (name, size) in media {
            let path = media_dir.join(name);
            common::testutils::write_file_with_size(&path, *size).await?;
            catalog
                .add_file(
                    Some(&catalog::FileInfo {
                        path,
                        size: *size as u64,
                    }),
                    None,
                    true,
                )
                .await?;
        }
        let daemon = marchive_daemon::start(cfg).await?;
        Ok(Self {
            daemon: Some(daemon),
            catalog,
            media_dir,
            _tmp: tmp,
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.daemon.as_ref().expect("daemon running").local_addr()
    }

    async fn source_id(&self, name: &str) -> i64 {
        // seeding is idempotent, so this just looks the id up
        let path = self.media_dir.join(name);
        let size = common::fs::size(&path).await.unwrap_or(0);
        self.catalog
            .add_file(Some(&catalog::FileInfo { path, size }), None, true)
            .await
            .expect("catalog lookup")
    }

    async fn wait_for_status(&self, source_id: i64, wanted: i8) -> catalog::QueueEntry {
        for _ in 0..200 {
            if let Some(entry) = self.catalog.queue_entry(source_id).await.expect("queue row") {
                if entry.status == wanted {
                    return entry;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("queue row for {source_id} never reached status {wanted}");
    }

    async fn wait_for_file(&self, path: &std::path::Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("{path:?} never appeared");
    }

    async fn shutdown(mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown().await.expect("clean shutdown");
        }
    }
}

struct Worker {
    conn: ControlConnection,
}

impl Worker {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let conn = ControlConnection::connect(addr).await.expect("connect");
        Self { conn }
    }

    async fn call(&mut self, request: Request) -> Reply {
        self.conn.call(&request).await.expect("transport")
    }

    async fn expect_ok(&mut self, request: Request) -> Response {
        match self.call(request).await {
            Reply::Ok(response) => response,
            Reply::Err(fault) => panic!("unexpected fault: {fault}"),
        }
    }

    async fn authenticate(&mut self, token: &str) {
        match self
            .expect_ok(Request::Authenticate {
                token: token.to_string(),
            })
            .await
        {
            Response::Done => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    async fn get_next_file(&mut self, max_file_size: u64) -> MediaEncoderSettings {
        let response = self
            .expect_ok(Request::GetNextFile {
                filter: MediaFileRequirements {
                    encoder_type: "ffmpeg".to_string(),
                    max_file_size,
                },
            })
            .await;
        match response {
            Response::Settings(settings) => settings,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    async fn read_chunk(&mut self) -> (bool, Vec<u8>) {
        match self.expect_ok(Request::ReadChunk).await {
            Response::Chunk { has_more, data } => (has_more, data),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    async fn read_all(&mut self) -> Vec<u8> {
        let mut contents = Vec::new();
        loop {
            let (has_more, data) = self.read_chunk().await;
            contents.extend_from_slice(&data);
            if !has_more {
                return contents;
            }
        }
    }

    async fn post_file(&mut self, result_status: i8, file_length: u64, error: &str) -> Reply {
        self.call(Request::PostFile {
            result: EncodingResultInfo::new(result_status, file_length, error),
        })
        .await
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Reply {
        self.call(Request::WriteChunk {
            data: data.to_vec(),
        })
        .await
    }

    /// Upload `data` in `chunk` sized pieces, asserting the daemon signals
    /// completion exactly on the last piece.
    async fn upload(&mut self, data: &[u8], chunk: usize) {
        let mut sent = 0;
        while sent < data.len() {
            let end = (sent + chunk).min(data.len());
            let more_expected = match self.write_chunk(&data[sent..end]).await {
                Reply::Ok(Response::MoreExpected(more_expected)) => more_expected,
                other => panic!("unexpected reply: {other:?}"),
            };
            sent = end;
            assert_eq!(more_expected, sent < data.len());
        }
    }
}

#[tokio::test]
async fn version_is_served_without_authentication() {
    let env = TestDaemon::start(256 * 1024, &[]).await.unwrap();
    let mut worker = Worker::connect(env.addr()).await;
    match worker.expect_ok(Request::GetVersion).await {
        Response::Version(version) => assert_eq!(version, 1),
        other => panic!("unexpected response: {other:?}"),
    }
    env.shutdown().await;
}

#[tokio::test]
async fn calls_without_a_session_are_rejected_but_connection_survives() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let mut worker = Worker::connect(env.addr()).await;
    match worker.call(Request::ReadChunk).await {
        Reply::Err(RpcFault::NotAuthenticated) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    // the connection is still usable after the fault
    worker.authenticate("w1").await;
    let settings = worker.get_next_file(0).await;
    assert_eq!(settings.file_length, 1000);
    env.shutdown().await;
}

#[tokio::test]
async fn happy_path_downloads_encodes_and_installs_archive() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source = env.media_dir.join("a.mov");
    filetime::set_file_times(
        &source,
        filetime::FileTime::from_unix_time(1_580_000_000, 0),
        filetime::FileTime::from_unix_time(1_580_000_500, 0),
    )
    .unwrap();
    let source_id = env.source_id("a.mov").await;

    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    let settings = worker.get_next_file(100 << 20).await;
    assert_eq!(settings.file_length, 1000);
    assert_eq!(settings.encoder_type, "ffmpeg");
    assert_eq!(settings.file_extension, "mov");
    assert_eq!(settings.final_extension, ".mp4");
    assert!(settings.command_line_parameters.contains("-c:v libx265"));
    assert!(settings.command_line_parameters.contains("-crf 22"));

    let downloaded = worker.read_all().await;
    assert_eq!(downloaded, common::testutils::patterned_bytes(1000));

    match worker.post_file(status::OK, 700, "").await {
        Reply::Ok(Response::Done) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    let encoded = common::testutils::patterned_bytes(700);
    worker.upload(&encoded, 256).await;

    let archive = env.media_dir.join("a_archived.mp4");
    env.wait_for_file(&archive).await;
    let entry = env.wait_for_status(source_id, status::OK).await;
    assert_eq!(entry.count, 1);
    assert_eq!(entry.comment, None);
    assert_eq!(tokio::fs::read(&archive).await.unwrap(), encoded);
    // the archive carries the source's timestamps
    let metadata = std::fs::metadata(&archive).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    assert_eq!(mtime.unix_seconds(), 1_580_000_500);
    assert_eq!(
        env.catalog.archive_path(source_id).await.unwrap().unwrap(),
        archive
    );
    env.shutdown().await;
}

#[tokio::test]
async fn reconnect_with_same_token_resumes_the_transfer() {
    let env = TestDaemon::start(64, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;

    let mut first = Worker::connect(env.addr()).await;
    first.authenticate("resume-token").await;
    let settings = first.get_next_file(0).await;
    assert_eq!(settings.file_length, 1000);
    let (has_more, head) = first.read_chunk().await;
    assert!(has_more);
    assert_eq!(head.len(), 64);
    drop(first);

    // the reserved file stays with the session across the reconnect
    let mut second = Worker::connect(env.addr()).await;
    second.authenticate("resume-token").await;
    match second.expect_ok(Request::Reset).await {
        Response::Done => {}
        other => panic!("unexpected response: {other:?}"),
    }
    let downloaded = second.read_all().await;
    assert_eq!(downloaded, common::testutils::patterned_bytes(1000));
    assert_eq!(&downloaded[..64], &head[..]);

    match second.post_file(status::OK, 300, "").await {
        Reply::Ok(Response::Done) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    second
        .upload(&common::testutils::patterned_bytes(300), 64)
        .await;
    env.wait_for_status(source_id, status::OK).await;
    env.shutdown().await;
}

#[tokio::test]
async fn encode_failure_records_error_without_archive() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    worker.get_next_file(0).await;
    worker.read_all().await;
    match worker.post_file(status::PERMANENT_ERROR, 0, "bad codec").await {
        Reply::Ok(Response::Done) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    let entry = env.wait_for_status(source_id, status::PERMANENT_ERROR).await;
    assert_eq!(entry.comment.as_deref(), Some("bad codec"));
    assert!(env.catalog.archive_path(source_id).await.unwrap().is_none());
    assert!(!env.media_dir.join("a_archived.mp4").exists());
    // a permanent failure is terminal
    let settings = worker.get_next_file(0).await;
    assert_eq!(settings.file_length, 0);
    env.shutdown().await;
}

#[tokio::test]
async fn ok_result_without_data_is_recorded_as_failure() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    worker.get_next_file(0).await;
    worker.read_all().await;
    // a declared length of zero cannot produce an archive
    match worker.post_file(status::OK, 0, "").await {
        Reply::Ok(Response::Done) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    let entry = env.wait_for_status(source_id, status::UNKNOWN_ERROR).await;
    assert_eq!(entry.comment.as_deref(), Some("no encoded data produced"));
    assert!(env.catalog.archive_path(source_id).await.unwrap().is_none());
    assert!(!env.media_dir.join("a_archived.mp4").exists());
    env.shutdown().await;
}

#[tokio::test]
async fn a_reserved_file_is_not_offered_to_a_second_worker() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let mut first = Worker::connect(env.addr()).await;
    first.authenticate("w1").await;
    assert_eq!(first.get_next_file(0).await.file_length, 1000);
    let mut second = Worker::connect(env.addr()).await;
    second.authenticate("w2").await;
    assert_eq!(second.get_next_file(0).await.file_length, 0);
    env.shutdown().await;
}

#[tokio::test]
async fn abort_requeues_without_losing_the_attempt_count() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    worker.get_next_file(0).await;
    worker.read_chunk().await;
    match worker.expect_ok(Request::Abort).await {
        Response::Done => {}
        other => panic!("unexpected response: {other:?}"),
    }
    let entry = env.wait_for_status(source_id, status::NOT_STARTED).await;
    assert_eq!(entry.count, 1);
    // the file is available again and the count keeps growing
    assert_eq!(worker.get_next_file(0).await.file_length, 1000);
    assert_eq!(
        env.catalog.queue_entry(source_id).await.unwrap().unwrap().count,
        2
    );
    env.shutdown().await;
}

#[tokio::test]
async fn three_retriable_failures_exhaust_the_file() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    for _ in 0..3 {
        let settings = worker.get_next_file(0).await;
        assert_eq!(settings.file_length, 1000);
        worker.read_all().await;
        match worker
            .post_file(status::RETRIABLE_ERROR, 0, "encoder crashed")
            .await
        {
            Reply::Ok(Response::Done) => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        env.wait_for_status(source_id, status::RETRIABLE_ERROR).await;
    }
    let settings = worker.get_next_file(0).await;
    assert_eq!(settings.file_length, 0);
    assert_eq!(
        env.catalog.queue_entry(source_id).await.unwrap().unwrap().count,
        3
    );
    env.shutdown().await;
}

#[tokio::test]
async fn upload_cannot_exceed_the_declared_length() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let source_id = env.source_id("a.mov").await;
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    worker.get_next_file(0).await;
    worker.read_all().await;
    match worker.post_file(status::OK, 100, "").await {
        Reply::Ok(Response::Done) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    let payload = common::testutils::patterned_bytes(100);
    match worker.write_chunk(&payload[..60]).await {
        Reply::Ok(Response::MoreExpected(true)) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    // 60 + 60 overruns the declared 100
    match worker.write_chunk(&payload[40..]).await {
        Reply::Err(RpcFault::InvalidState(message)) => {
            assert!(message.contains("declared length"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    // the overrun did not consume anything; the exact remainder finishes
    match worker.write_chunk(&payload[60..]).await {
        Reply::Ok(Response::MoreExpected(false)) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    env.wait_for_status(source_id, status::OK).await;
    let archive = env.media_dir.join("a_archived.mp4");
    env.wait_for_file(&archive).await;
    assert_eq!(tokio::fs::read(&archive).await.unwrap(), payload);
    env.shutdown().await;
}

#[tokio::test]
async fn post_without_full_download_is_rejected() {
    let env = TestDaemon::start(64, &[("a.mov", 1000)]).await.unwrap();
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    worker.get_next_file(0).await;
    worker.read_chunk().await;
    match worker.post_file(status::OK, 700, "").await {
        Reply::Err(RpcFault::InvalidState(message)) => {
            assert!(message.contains("not read to the end"));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    env.shutdown().await;
}

#[tokio::test]
async fn draining_stop_refuses_new_jobs_and_exits() {
    let env = TestDaemon::start(256 * 1024, &[("a.mov", 1000)]).await.unwrap();
    let mut worker = Worker::connect(env.addr()).await;
    worker.authenticate("w1").await;
    let coordinator = env.daemon.as_ref().unwrap().coordinator();
    coordinator.stop(false).await;
    assert_eq!(worker.get_next_file(0).await.file_length, 0);
    // nothing is in flight, so the daemon drains immediately
    let mut env = env;
    env.daemon.take().unwrap().wait().await.unwrap();
}

#[tokio::test]
async fn discovered_files_reach_the_catalog_through_the_watcher() {
    // this variant wires folders_to_watch instead of seeding the catalog
    let tmp = tempfile::tempdir().unwrap();
    let media_dir = tmp.path().join("media");
    tokio::fs::create_dir(&media_dir).await.unwrap();
    common::testutils::write_file_with_size(&media_dir.join("a.mov"), 500)
        .await
        .unwrap();
    let cfg = common::config::DaemonConfig {
        server_port: 0,
        db_path: tmp.path().join("catalog.db"),
        temp_folder: tmp.path().join("tmp"),
        folders_to_watch: media_dir.to_string_lossy().into_owned(),
        ..common::config::DaemonConfig::default()
    };
    let daemon = marchive_daemon::start(cfg).await.unwrap();
    let mut worker = Worker::connect(daemon.local_addr()).await;
    worker.authenticate("w1").await;
    // discovery runs concurrently; poll until the file is offered
    let mut settings = MediaEncoderSettings::default();
    for _ in 0..200 {
        settings = worker.get_next_file(0).await;
        if settings.file_length > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert_eq!(settings.file_length, 500);
    assert_eq!(settings.file_extension, "mov");
    daemon.shutdown().await.unwrap();
}
