mod common;

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use livesync::protocol::{digest, CreateFileHeader, DoSync, DIGEST_LEN};
    use livesync::{
        Config, ConnectionState, DirectTunnel, Error, LiveSync, OperationId, Report, Tunnel,
        TunnelConfig,
    };
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    use crate::common::{self, attach_recording, wait_for, APP_ID, VERSION};

    fn engine(base: &Path) -> LiveSync {
        LiveSync::with_tunnel(Config::new(APP_ID, base), DirectTunnel)
    }

    fn tcp_engine(base: &Path, port: u16) -> LiveSync {
        let mut config = Config::new(APP_ID, base);
        config.port = port;
        config.connect_timeout_ms = 5_000;
        config.retry_interval_ms = 50;
        LiveSync::with_tunnel(config, DirectTunnel)
    }

    /// Splits a recorded stream of create-file messages into (path, body),
    /// checking both digests of each message.
    fn parse_creates(stream: &[u8]) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let (header, used) = CreateFileHeader::decode(&stream[pos..])?;
            let header_bytes = &stream[pos..pos + used];
            pos += used;
            assert_eq!(&stream[pos..pos + DIGEST_LEN], &digest(header_bytes));
            pos += DIGEST_LEN;

            let len = header.content_length as usize;
            let body = &stream[pos..pos + len];
            pos += len;
            assert_eq!(&stream[pos..pos + DIGEST_LEN], &digest(body));
            pos += DIGEST_LEN;

            files.push((header.path, body.to_vec()));
        }
        Ok(files)
    }

    /// Attaches `engine` to an agent whose receiving side holds only a few
    /// bytes and is never read, so any longer write stalls.
    async fn attach_stalled(engine: &LiveSync) -> (DuplexStream, DuplexStream) {
        let (local, mut agent) = tokio::io::duplex(1024);
        agent.write_all(&common::handshake()).await.unwrap();
        let (sink, device) = tokio::io::duplex(8);
        engine.attach(local, sink).await.unwrap();
        (agent, device)
    }

    fn long_path() -> PathBuf {
        Path::new("/proj").join(format!("{}.js", "x".repeat(100)))
    }

    // =========================================================================
    // Connect
    // =========================================================================

    #[tokio::test]
    async fn test_connect_over_tcp() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let agent = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            sock.write_all(&common::handshake()).await?;
            let mut received = Vec::new();
            sock.read_to_end(&mut received).await?;
            anyhow::Ok(received)
        });

        let engine = tcp_engine(Path::new("/proj"), port);
        let handshake = engine.connect().await?;
        assert_eq!(handshake.protocol_version, VERSION);
        assert_eq!(handshake.application_id, APP_ID);

        let info = engine.info();
        assert_eq!(info.state, ConnectionState::Live);
        assert_eq!(info.protocol_version.as_deref(), Some(VERSION));
        assert_eq!(info.application_id.as_deref(), Some(APP_ID));

        engine.delete_file(Path::new("/proj/a.js"), None).await?;
        engine.end().await;
        assert_eq!(engine.state(), ConnectionState::Closed);

        let received = agent.await??;
        let mut expected = b"7\x014a.js".to_vec();
        expected.extend_from_slice(&digest(b"7\x014a.js"));
        assert_eq!(received, expected);
        Ok(())
    }

    struct FailingTunnel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tunnel for FailingTunnel {
        async fn establish(&self, _config: &TunnelConfig) -> livesync::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Tunnel("no devices/emulators found".into()))
        }
    }

    #[tokio::test]
    async fn test_tunnel_failure_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = LiveSync::with_tunnel(
            Config::new(APP_ID, "/proj"),
            FailingTunnel {
                calls: Arc::clone(&calls),
            },
        );

        let err = engine.connect().await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_config_is_rejected() {
        let engine = LiveSync::with_tunnel(Config::default(), DirectTunnel);
        let err = engine.connect().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() -> anyhow::Result<()> {
        // grab a free port, then close it so every attempt is refused
        let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();

        let mut config = Config::new(APP_ID, "/proj");
        config.port = port;
        config.connect_timeout_ms = 300;
        config.retry_interval_ms = 50;
        let engine = LiveSync::with_tunnel(config, DirectTunnel);

        let err = engine.connect().await.unwrap_err();
        match &err {
            Error::ConnectTimeout { last, .. } => assert!(last.is_some()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.state(), ConnectionState::Errored);
        assert!(engine.info().last_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_retries_after_early_close() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let agent = tokio::spawn(async move {
            // first socket closes before any handshake
            let (first, _) = listener.accept().await?;
            drop(first);

            let (mut sock, _) = listener.accept().await?;
            sock.write_all(&common::handshake()).await?;
            let mut rest = Vec::new();
            sock.read_to_end(&mut rest).await?;
            anyhow::Ok(())
        });

        let engine = tcp_engine(Path::new("/proj"), port);
        engine.connect().await?;
        assert!(engine.is_live());

        engine.end().await;
        agent.await??;
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[tokio::test]
    async fn test_delete_file_writes_header_then_digest() -> anyhow::Result<()> {
        let engine = engine(Path::new("/proj"));
        let (_agent, writes) = attach_recording(&engine).await;

        engine.delete_file(Path::new("/proj/a.js"), None).await?;

        let recorded = writes.snapshot();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], b"7\x014a.js");
        assert_eq!(recorded[1], digest(b"7\x014a.js"));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_without_connection() {
        let engine = engine(Path::new("/proj"));
        let err = engine
            .delete_file(Path::new("/proj/a.js"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { last: None }));
    }

    #[tokio::test]
    async fn test_path_outside_base_is_rejected() {
        let engine = engine(Path::new("/proj"));
        let (_agent, writes) = attach_recording(&engine).await;

        let err = engine
            .delete_file(Path::new("/elsewhere/a.js"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathOutsideBase { .. }));
        assert_eq!(writes.len(), 0);
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn test_send_files_in_order() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path();
        fs::create_dir_all(base.join("app"))?;
        fs::write(base.join("app/a.js"), "alpha")?;
        fs::write(base.join("app/b.js"), "")?;

        let engine = engine(base);
        let (_agent, writes) = attach_recording(&engine).await;

        let paths = vec![
            base.join("app/a.js"),
            base.join("missing.js"),
            base.join("app"),
            base.join("app/b.js"),
        ];
        let sent = engine.send_files(&paths).await?;
        assert_eq!(sent, vec![base.join("app/a.js"), base.join("app/b.js")]);

        let recorded = writes.snapshot();
        // a.js: header, header digest, body, body digest; b.js has no body
        assert_eq!(recorded.len(), 7);
        assert_eq!(recorded[0], b"8\x018app/a.js\x015");
        assert_eq!(recorded[2], b"alpha");
        assert_eq!(recorded[4], b"8\x018app/b.js\x010");
        assert_eq!(recorded[6], digest(b""));

        let files = parse_creates(&writes.stream())?;
        assert_eq!(
            files,
            vec![
                ("app/a.js".to_string(), b"alpha".to_vec()),
                ("app/b.js".to_string(), Vec::new()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_directory() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path();
        fs::create_dir_all(base.join("src/views"))?;
        fs::write(base.join("src/main.js"), "main")?;
        fs::write(base.join("src/views/page.xml"), "<Page/>")?;

        let engine = engine(base);
        let (_agent, writes) = attach_recording(&engine).await;

        let sent = engine.send_directory(&base.join("src")).await?;
        assert_eq!(sent.len(), 2);

        let paths: Vec<String> = parse_creates(&writes.stream())?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(paths, ["src/main.js", "src/views/page.xml"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_do_not_interleave() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path();
        let big_a: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let big_b: Vec<u8> = (0..150_000u32).map(|i| (i % 13) as u8).collect();
        fs::write(base.join("a.bin"), &big_a)?;
        fs::write(base.join("b.bin"), &big_b)?;

        let engine = engine(base);
        let (_agent, writes) = attach_recording(&engine).await;

        let a = base.join("a.bin");
        let b = base.join("b.bin");
        let (ra, rb) = tokio::join!(engine.send_file(&a, None), engine.send_file(&b, None));
        ra?;
        rb?;

        let mut files = parse_creates(&writes.stream())?;
        files.sort();
        assert_eq!(
            files,
            vec![("a.bin".to_string(), big_a), ("b.bin".to_string(), big_b)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_file_shrinking_mid_send_tears_down_connection() -> anyhow::Result<()> {
        const SIZE: usize = 1024 * 1024;
        let temp = TempDir::new()?;
        let base = temp.path();
        let path = base.join("big.bin");
        fs::write(&path, vec![7u8; SIZE])?;

        let engine = engine(base);
        let (local, mut agent) = tokio::io::duplex(1024);
        agent.write_all(&common::handshake()).await?;
        let (sink, mut device) = tokio::io::duplex(1024);
        engine.attach(local, sink).await?;

        // cut the file to nothing once its body has started to arrive
        let target = path.clone();
        let device_task = tokio::spawn(async move {
            let mut received = 0usize;
            let mut truncated = false;
            let mut buf = [0u8; 512];
            loop {
                let n = device.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                received += n;
                if !truncated && received >= 4096 {
                    fs::OpenOptions::new().write(true).open(&target)?.set_len(0)?;
                    truncated = true;
                }
            }
            anyhow::Ok(received)
        });

        let (sync, sent) = tokio::join!(
            engine.send_sync(None, Some(Duration::from_secs(60))),
            engine.send_file(&path, None),
        );

        assert!(matches!(sent, Err(Error::Io { .. })));
        assert!(matches!(sync, Err(Error::Io { .. })));
        assert_eq!(engine.state(), ConnectionState::Errored);
        assert_eq!(engine.pending_operations(), 0);
        assert!(device_task.await?? < SIZE);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_files_concurrently() -> anyhow::Result<()> {
        let engine = engine(Path::new("/proj"));
        let (_agent, writes) = attach_recording(&engine).await;

        let paths: Vec<PathBuf> = ["a.js", "b.js", "c.js"]
            .iter()
            .map(|name| Path::new("/proj").join(name))
            .collect();
        engine.delete_files(&paths).await?;

        let recorded = writes.snapshot();
        assert_eq!(recorded.len(), 6);
        // each header is immediately followed by its own digest
        for pair in recorded.chunks(2) {
            assert_eq!(pair[0][0], b'7');
            assert_eq!(pair[1], digest(&pair[0]));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_files_checks_every_path_before_writing() {
        let engine = engine(Path::new("/proj"));
        let (_agent, mut device) = attach_stalled(&engine).await;

        let paths = vec![long_path(), PathBuf::from("/elsewhere/b.js")];
        let err = engine.delete_files(&paths).await.unwrap_err();
        assert!(matches!(err, Error::PathOutsideBase { .. }));
        assert!(engine.is_live());

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(50), device.read(&mut buf)).await;
        assert!(read.is_err(), "nothing should reach the wire");
    }

    #[tokio::test]
    async fn test_abandoned_delete_tears_down_connection() -> anyhow::Result<()> {
        let engine = engine(Path::new("/proj"));
        let (_agent, mut device) = attach_stalled(&engine).await;

        let attempt =
            tokio::time::timeout(Duration::from_millis(50), engine.delete_file(&long_path(), None))
                .await;
        assert!(attempt.is_err());

        // the half-written header can't be taken back
        assert_eq!(engine.state(), ConnectionState::Errored);
        let mut partial = Vec::new();
        device.read_to_end(&mut partial).await?;
        assert_eq!(partial.len(), 8);

        let err = engine
            .delete_file(Path::new("/proj/a.js"), None)
            .await
            .unwrap_err();
        match err {
            Error::NotConnected { last: Some(last) } => assert!(matches!(*last, Error::Cancelled)),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    #[tokio::test]
    async fn test_sync_completes_on_report() -> anyhow::Result<()> {
        let engine = engine(Path::new("/proj"));
        let (mut agent, writes) = attach_recording(&engine).await;
        let id = OperationId::generate();
        let sync = DoSync { id: id.clone() };

        let (result, ()) = tokio::join!(
            engine.send_sync(Some(id.clone()), Some(Duration::from_secs(5))),
            async {
                wait_for(|| writes.has_sync(&sync)).await;
                agent
                    .write_all(&Report::OperationEnd(id.clone()).encode())
                    .await
                    .unwrap();
            }
        );

        assert_eq!(result?, id);
        assert_eq!(engine.pending_operations(), 0);
        assert!(engine.is_live());

        let recorded = writes.snapshot();
        assert_eq!(recorded[0], sync.encode());
        assert_eq!(recorded[1], digest(&sync.encode()));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_sync_id_rejected() {
        let engine = engine(Path::new("/proj"));
        let (_agent, _writes) = attach_recording(&engine).await;
        let id = OperationId::generate();

        let (first, second) = tokio::join!(
            engine.send_sync(Some(id.clone()), Some(Duration::from_millis(200))),
            async {
                wait_for(|| engine.pending_operations() == 1).await;
                engine.send_sync(Some(id.clone()), None).await
            }
        );

        assert!(matches!(second, Err(Error::DuplicateOperation(_))));
        assert!(matches!(first, Err(Error::OperationTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_tears_down_connection() {
        let engine = engine(Path::new("/proj"));
        let (_agent, _writes) = attach_recording(&engine).await;

        let (short, long) = tokio::join!(
            engine.send_sync(None, Some(Duration::from_secs(6))),
            engine.send_sync(None, Some(Duration::from_secs(60))),
        );

        assert!(matches!(short, Err(Error::OperationTimeout { .. })));
        // the other sync was on the same connection and fails with it
        assert!(matches!(long, Err(Error::OperationTimeout { .. })));
        assert_eq!(engine.state(), ConnectionState::Errored);
        assert_eq!(engine.pending_operations(), 0);

        let err = engine
            .delete_file(Path::new("/proj/a.js"), None)
            .await
            .unwrap_err();
        match err {
            Error::NotConnected { last: Some(last) } => {
                assert!(matches!(*last, Error::OperationTimeout { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sync_still_expires() {
        let engine = engine(Path::new("/proj"));
        let (_agent, _writes) = attach_recording(&engine).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            engine.send_sync(None, Some(Duration::from_millis(50))),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(engine.pending_operations(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.pending_operations(), 0);
        assert_eq!(engine.state(), ConnectionState::Errored);
        assert!(matches!(
            engine.info().last_error,
            Some(Error::OperationTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_syncs() {
        let engine = engine(Path::new("/proj"));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        engine.on_error(move |e| sink.lock().unwrap().push(e.to_string()));

        let (agent, _writes) = attach_recording(&engine).await;
        let engine_ref = &engine;

        let (a, b, ()) = tokio::join!(
            engine.send_sync(None, Some(Duration::from_secs(60))),
            engine.send_sync(None, Some(Duration::from_secs(60))),
            async move {
                wait_for(|| engine_ref.pending_operations() == 2).await;
                drop(agent);
            }
        );

        assert!(matches!(a, Err(Error::ConnectionClosed)));
        assert!(matches!(b, Err(Error::ConnectionClosed)));
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_report_keeps_connection() {
        let engine = engine(Path::new("/proj"));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        engine.on_error(move |e| sink.lock().unwrap().push(e.clone()));

        let (mut agent, _writes) = attach_recording(&engine).await;
        agent
            .write_all(&Report::Error("failed to apply bundle".into()).encode())
            .await
            .unwrap();

        wait_for(|| !errors.lock().unwrap().is_empty()).await;
        assert!(matches!(
            &errors.lock().unwrap()[0],
            Error::Remote(message) if message == "failed to apply bundle"
        ));
        assert!(engine.is_live());
    }

    #[tokio::test]
    async fn test_end_fails_pending_without_callback() {
        let engine = engine(Path::new("/proj"));
        let notified = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&notified);
        engine.on_error(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let (_agent, _writes) = attach_recording(&engine).await;
        let (result, ()) = tokio::join!(
            engine.send_sync(None, Some(Duration::from_secs(60))),
            async {
                wait_for(|| engine.pending_operations() == 1).await;
                engine.end().await;
            }
        );

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reattach_mints_new_connection_id() {
        let engine = engine(Path::new("/proj"));
        let (_first_agent, _) = attach_recording(&engine).await;
        let first = engine.info().id.unwrap();

        let (_second_agent, _) = attach_recording(&engine).await;
        let second = engine.info().id.unwrap();

        assert_ne!(first, second);
        assert!(engine.is_live());
    }
}
