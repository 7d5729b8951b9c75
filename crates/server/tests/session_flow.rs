//! Session driver behavior end to end, without a daemon: the runtime is the
//! in-memory double and the transport is a pair of channels.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pool::{Artifact, Catalog, HostCompile, HostPaths, LangSpec, Pool, PoolConfig};
use runtime::testing::InMemoryRuntime;
use server::error::SessionError;
use server::session::{SessionConfig, SessionDriver};
use server::transport::{Outbound, EXEC_TERMINATED, EXEC_TIMEOUT};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Session {
    to_driver: mpsc::Sender<String>,
    from_driver: mpsc::Receiver<Outbound>,
    driver: JoinHandle<Result<(), SessionError>>,
    shutdown: CancellationToken,
}

struct Harness {
    rt: Arc<InMemoryRuntime>,
    pool: Arc<Pool<InMemoryRuntime>>,
    paths: HostPaths,
    _tmp: tempfile::TempDir,
}

impl Harness {
    async fn new(make_catalog: impl FnOnce(&HostPaths) -> Catalog) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = HostPaths::new(tmp.path().to_path_buf());
        paths.ensure().await.expect("ensure dirs");
        let catalog = make_catalog(&paths);
        let rt = Arc::new(InMemoryRuntime::new());
        let pool = Arc::new(Pool::new(
            Arc::clone(&rt),
            Arc::new(catalog),
            PoolConfig::default(),
        ));
        Self {
            rt,
            pool,
            paths,
            _tmp: tmp,
        }
    }

    async fn builtin() -> Self {
        Self::new(Catalog::builtin).await
    }

    async fn with_specs(specs: Vec<LangSpec>) -> Self {
        Self::new(|_| Catalog::with_specs(specs)).await
    }

    fn start(&self, lang: &str) -> Session {
        self.start_with_config(lang, fast_config())
    }

    fn start_with_config(&self, lang: &str, config: SessionConfig) -> Session {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let driver = SessionDriver::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.rt),
            self.paths.clone(),
            lang.to_string(),
            config,
            outbound_tx,
            inbound_rx,
        );
        let driver = tokio::spawn(driver.run(shutdown.child_token()));
        Session {
            to_driver: inbound_tx,
            from_driver: outbound_rx,
            driver,
            shutdown,
        }
    }
}

/// Tight intervals so liveness-driven transitions land quickly.
fn fast_config() -> SessionConfig {
    SessionConfig {
        exec_timeout: Duration::from_secs(30),
        liveness_poll: Duration::from_millis(20),
    }
}

async fn next_frame(session: &mut Session) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), session.from_driver.recv())
        .await
        .expect("frame within 2s")
        .expect("channel open")
}

async fn expect_text(session: &mut Session) -> String {
    match next_frame(session).await {
        Outbound::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Poll until `check` holds (2 s budget).
async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

async fn send(session: &Session, frame: &str) {
    session
        .to_driver
        .send(frame.to_string())
        .await
        .expect("driver alive");
}

fn fake_compiled_spec(build_argv: fn(&Path, &Path) -> Vec<String>) -> LangSpec {
    LangSpec {
        tag: "fakec".into(),
        image: "scratch".into(),
        is_compiled: true,
        min_cpu: 1,
        max_cpu: 1,
        incr_cpu: 1,
        min_mem: 1,
        max_mem: 1,
        incr_mem: 1,
        cpu_idle_threshold: 0.0,
        mem_idle_threshold: 0.0,
        env: vec!["HOME=/tmp".into()],
        mounts: vec![],
        exec_cmd: |artifact| vec![artifact.to_string()],
        host_compile: Some(HostCompile {
            build_argv,
            artifact: Artifact::Ext("out"),
        }),
        file_name: Some(|sandbox_id| format!("{sandbox_id}-code.src")),
    }
}

fn cp_argv(source: &Path, out_dir: &Path) -> Vec<String> {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    vec![
        "cp".into(),
        source.display().to_string(),
        out_dir.join(format!("{stem}.out")).display().to_string(),
    ]
}

fn failing_argv(_source: &Path, _out_dir: &Path) -> Vec<String> {
    vec!["sh".into(), "-c".into(), "echo boom >&2; exit 1".into()]
}

// ---------------------------------------------------------------------------
// Interpreted flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interpreted_run_streams_output_and_stdin() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");

    let banner = expect_text(&mut session).await;
    assert_eq!(banner, "Container started: sbx-0001");

    send(&session, "CODE:print('hi')").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || !rt.exec_ids().is_empty()).await;

    let execs = harness.rt.exec_ids();
    let exec = &execs[0];
    let spec = harness.rt.exec_spec(exec).expect("exec spec");
    assert_eq!(spec.cmd, vec!["python3", "-c", "print('hi')"]);
    assert_eq!(spec.user, "nobody");
    assert_eq!(spec.working_dir, "/tmp");

    harness.rt.push_output(exec, b"hi\n");
    assert_eq!(
        next_frame(&mut session).await,
        Outbound::Output(bytes::Bytes::from_static(b"hi\n"))
    );

    // A non-command frame is stdin, newline appended.
    send(&session, "42").await;
    let rt = Arc::clone(&harness.rt);
    let exec_owned = exec.clone();
    wait_until(move || rt.stdin_bytes(&exec_owned) == b"42\n").await;

    harness.rt.finish_exec(exec);
    assert_eq!(expect_text(&mut session).await, EXEC_TERMINATED);

    // The session survives and accepts the next program in the same sandbox.
    send(&session, "CODE:print('two')").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 2).await;
    let execs = harness.rt.exec_ids();
    assert_eq!(
        harness.rt.exec_sandbox(&execs[1]),
        harness.rt.exec_sandbox(exec)
    );
    assert_eq!(harness.rt.created_count(), 1);

    drop(session.to_driver);
    let result = session.driver.await.expect("join");
    assert!(result.is_ok());

    // Seat released; last user gone destroys the sandbox.
    let snap = harness.pool.snapshot().await;
    assert_eq!(snap.total_users(), 0);
    assert_eq!(harness.rt.removed(), vec!["sbx-0001".to_string()]);
}

#[tokio::test]
async fn hot_swap_keeps_the_sandbox_and_seat() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");
    expect_text(&mut session).await;

    send(&session, "CODE:print(1)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 1).await;

    // Replace the program while the first exec is still running.
    send(&session, "CODE:print(2)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 2).await;

    let execs = harness.rt.exec_ids();
    assert_eq!(
        harness.rt.exec_sandbox(&execs[0]),
        harness.rt.exec_sandbox(&execs[1])
    );
    let spec = harness.rt.exec_spec(&execs[1]).expect("spec");
    assert_eq!(spec.cmd, vec!["python3", "-c", "print(2)"]);

    // Same single seat throughout.
    assert_eq!(harness.pool.snapshot().await.total_users(), 1);
    assert_eq!(harness.rt.created_count(), 1);

    session.shutdown.cancel();
    let _ = session.driver.await;
}

#[tokio::test]
async fn stop_cancels_without_a_sentinel() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");
    expect_text(&mut session).await;

    send(&session, "CODE:while True: pass").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 1).await;

    send(&session, "STOP").await;

    // Back in Await-Code: a new program starts a second exec.
    send(&session, "CODE:print(1)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 2).await;

    // No EXEC_TERMINATED / EXEC_TIMEOUT was emitted for the stop.
    while let Ok(frame) = session.from_driver.try_recv() {
        if let Outbound::Text(text) = frame {
            assert_ne!(text, EXEC_TERMINATED);
            assert_ne!(text, EXEC_TIMEOUT);
        }
    }

    session.shutdown.cancel();
    let _ = session.driver.await;
}

#[tokio::test]
async fn timeout_fires_the_sentinel_and_keeps_the_session() {
    let harness = Harness::builtin().await;
    let mut session = harness.start_with_config(
        "py",
        SessionConfig {
            exec_timeout: Duration::from_millis(100),
            liveness_poll: Duration::from_millis(20),
        },
    );
    expect_text(&mut session).await;

    send(&session, "CODE:while True: pass").await;
    assert_eq!(expect_text(&mut session).await, EXEC_TIMEOUT);

    // Next submission is accepted.
    send(&session, "CODE:print(1)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 2).await;

    session.shutdown.cancel();
    let _ = session.driver.await;
}

// ---------------------------------------------------------------------------
// Compiled flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn compiled_run_executes_the_artifact() {
    let harness = Harness::with_specs(vec![fake_compiled_spec(cp_argv)]).await;
    let mut session = harness.start("fakec");
    expect_text(&mut session).await;

    send(&session, "CODE:int main(){return 0;}").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 1).await;

    let execs = harness.rt.exec_ids();
    let exec = &execs[0];
    let spec = harness.rt.exec_spec(exec).expect("spec");
    assert_eq!(spec.cmd.len(), 1);
    let artifact = Path::new(&spec.cmd[0]);
    assert!(artifact.starts_with(harness.paths.compiled_files()));
    assert!(artifact.display().to_string().ends_with("-code.out"));
    let built = tokio::fs::read_to_string(artifact).await.expect("artifact");
    assert_eq!(built, "int main(){return 0;}");

    harness.rt.finish_exec(exec);
    assert_eq!(expect_text(&mut session).await, EXEC_TERMINATED);

    session.shutdown.cancel();
    let _ = session.driver.await;
}

#[tokio::test]
async fn compile_failure_keeps_sandbox_and_session() {
    let harness = Harness::with_specs(vec![fake_compiled_spec(failing_argv)]).await;
    let mut session = harness.start("fakec");
    expect_text(&mut session).await;

    send(&session, "CODE:broken").await;
    assert_eq!(expect_text(&mut session).await, "error: boom");

    // No exec was created; the seat and sandbox are untouched; the session
    // accepts another attempt.
    assert!(harness.rt.exec_ids().is_empty());
    assert_eq!(harness.pool.snapshot().await.total_users(), 1);

    send(&session, "CODE:still broken").await;
    assert_eq!(expect_text(&mut session).await, "error: boom");

    session.shutdown.cancel();
    let _ = session.driver.await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_frame_without_code_prefix_closes_the_session() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");
    expect_text(&mut session).await;

    send(&session, "hello").await;

    let result = session.driver.await.expect("join");
    assert!(matches!(result, Err(SessionError::Protocol(_))));

    // The seat was released and the empty sandbox destroyed.
    assert_eq!(harness.pool.snapshot().await.total_users(), 0);
    assert_eq!(harness.rt.removed().len(), 1);
}

#[tokio::test]
async fn unsupported_language_fails_before_acquiring() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("cobol");

    let text = expect_text(&mut session).await;
    assert!(text.starts_with("error: unsupported language"));

    let result = session.driver.await.expect("join");
    assert!(matches!(
        result,
        Err(SessionError::Pool(pool::PoolError::UnsupportedLanguage(_)))
    ));
    assert_eq!(harness.rt.created_count(), 0);
}

#[tokio::test]
async fn sandbox_create_failure_fails_the_session() {
    let harness = Harness::builtin().await;
    harness.rt.fail_creates();
    let mut session = harness.start("py");

    let text = expect_text(&mut session).await;
    assert!(text.starts_with("error: sandbox creation failed"));

    let result = session.driver.await.expect("join");
    assert!(matches!(
        result,
        Err(SessionError::Pool(pool::PoolError::SandboxCreateFailed(_)))
    ));
}

#[tokio::test]
async fn transport_close_mid_run_releases_the_seat() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");
    expect_text(&mut session).await;

    send(&session, "CODE:print(1)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 1).await;

    drop(session.to_driver);
    let result = session.driver.await.expect("join");
    assert!(result.is_ok());

    assert_eq!(harness.pool.snapshot().await.total_users(), 0);
    assert_eq!(harness.rt.removed().len(), 1);
}

#[tokio::test]
async fn session_token_cancellation_unwinds_the_attachment() {
    let harness = Harness::builtin().await;
    let mut session = harness.start("py");
    expect_text(&mut session).await;

    send(&session, "CODE:print(1)").await;
    let rt = Arc::clone(&harness.rt);
    wait_until(move || rt.exec_ids().len() == 1).await;

    // Process-wide shutdown reaches the attachment through the token tree:
    // all three activities stop and the driver returns cleanly.
    session.shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), session.driver)
        .await
        .expect("driver unwinds promptly")
        .expect("join");
    assert!(result.is_ok());
    assert_eq!(harness.pool.snapshot().await.total_users(), 0);
}
