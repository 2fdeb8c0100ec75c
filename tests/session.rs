//! Session behaviour: snapshot reconciliation, cancellation, failures and the
//! preview that follows a completed stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln::dispatch::{LlmModel, LlmModelConfig};
use kiln::error::{ErrorCode, KilnError};
use kiln::fragment::{Fragment, FragmentCode, SandboxResult};
use kiln::gateway::GenerationRequest;
use kiln::messages::{ContentPart, Role};
use kiln::session::client::{SnapshotSource, SnapshotStream, StreamFrame};
use kiln::session::collaborators::{BuildFileRecord, BuildRecord, BuildStore, Sandbox};
use kiln::session::failure::ClientFailure;
use kiln::session::preview::{PreviewIndicator, PreviewOrchestrator, PreviewSettings};
use kiln::session::reconciler::TurnBinding;
use kiln::session::{Session, SessionEvent, SessionIdentity, StreamOutcome};
use tokio::sync::{Notify, mpsc};

type Frame = Result<StreamFrame, KilnError>;

/// Hands out one channel-backed stream per `open`; the test feeds frames.
#[derive(Default)]
struct ChannelSource {
    senders: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    refuse_with: Mutex<Option<String>>,
}

impl ChannelSource {
    /// Takes the stream's only sender; dropping it ends the stream.
    fn sender(&self, idx: usize) -> mpsc::UnboundedSender<Frame> {
        let (closed, _) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.senders.lock().unwrap()[idx], closed)
    }

    fn opened(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SnapshotSource for ChannelSource {
    async fn open(&self, req: &GenerationRequest) -> Result<SnapshotStream, KilnError> {
        if let Some(body) = self.refuse_with.lock().unwrap().clone() {
            return Err(KilnError::Upstream {
                provider: "gateway".into(),
                message: body,
                status: Some(429),
            });
        }
        self.requests.lock().unwrap().push(req.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(SnapshotStream::new(frames))
    }
}

struct FakeSandbox {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<Fragment>>,
}

impl FakeSandbox {
    fn after(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn create(
        &self,
        fragment: &Fragment,
        _identity: &SessionIdentity,
    ) -> Result<SandboxResult, KilnError> {
        self.calls.lock().unwrap().push(fragment.clone());
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(KilnError::Sandbox("template not found".into()));
        }
        Ok(SandboxResult {
            sbx_id: "sbx-1".into(),
            url: Some("https://3000-sbx-1.example".into()),
            template: fragment.template.clone().unwrap_or_default(),
            extra: Default::default(),
        })
    }
}

#[derive(Default)]
struct RecordingStore {
    builds: Mutex<Vec<BuildRecord>>,
    files: Mutex<Vec<BuildFileRecord>>,
    done: Notify,
}

#[async_trait]
impl BuildStore for RecordingStore {
    async fn insert_build(&self, build: &BuildRecord) -> Result<String, KilnError> {
        self.builds.lock().unwrap().push(build.clone());
        Ok("build-1".into())
    }

    async fn insert_files(&self, files: &[BuildFileRecord]) -> Result<(), KilnError> {
        self.files.lock().unwrap().extend_from_slice(files);
        self.done.notify_one();
        Ok(())
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn model() -> LlmModel {
    LlmModel {
        id: "gpt-4o".into(),
        name: "GPT-4o".into(),
        provider: "OpenAI".into(),
        provider_id: "openai".into(),
        multi_modal: true,
    }
}

fn snapshot(commentary: &str, code: Option<&str>) -> Fragment {
    Fragment {
        commentary: Some(commentary.into()),
        template: Some("nextjs-developer".into()),
        file_path: Some("pages/index.tsx".into()),
        code: code.map(|c| FragmentCode::Single(c.into())),
        ..Default::default()
    }
}

fn frame(f: Fragment) -> Frame {
    Ok(StreamFrame::Snapshot(f))
}

fn session_with(source: Arc<ChannelSource>, sandbox: Arc<FakeSandbox>) -> Session {
    let preview = PreviewOrchestrator::new(sandbox, PreviewSettings::default());
    Session::new(source, preview, model(), LlmModelConfig::default())
}

fn text(s: &str) -> Vec<ContentPart> {
    vec![ContentPart::Text { text: s.into() }]
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshots_build_exactly_one_assistant_message() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));

    session.submit(text("make a landing page")).await.unwrap();
    let tx = source.sender(0);
    let s1 = snapshot("Bui", None);
    let s2 = snapshot("Building", Some("export"));
    let s3 = snapshot("Building a page", Some("export default function Home() {}"));
    for s in [&s1, &s2, &s3] {
        tx.send(frame(s.clone())).unwrap();
    }
    drop(tx);

    assert_eq!(
        session.next().await,
        Some(SessionEvent::Snapshot(TurnBinding::Appended))
    );
    assert_eq!(
        session.next().await,
        Some(SessionEvent::Snapshot(TurnBinding::Updated))
    );

    let outcome = session.drive().await;
    assert_eq!(outcome, StreamOutcome::Completed(s3.clone()));

    let messages = session.conversation().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].object.as_ref(), Some(&s3));
    assert_eq!(messages[1].text(), "Building a page\nexport default function Home() {}");
    assert!(!session.is_streaming());
}

#[tokio::test]
async fn retry_updates_trailing_assistant_in_place() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));

    session.submit(text("hello")).await.unwrap();
    let tx = source.sender(0);
    tx.send(frame(snapshot("first", Some("a")))).unwrap();
    drop(tx);
    session.drive().await;
    assert_eq!(session.conversation().len(), 2);

    session.retry().await.unwrap();
    assert_eq!(source.requests.lock().unwrap()[1].messages.len(), 2);
    let tx = source.sender(1);
    tx.send(frame(snapshot("second", None))).unwrap();
    tx.send(frame(snapshot("second try", Some("b")))).unwrap();
    drop(tx);

    assert_eq!(
        session.next().await,
        Some(SessionEvent::Snapshot(TurnBinding::Updated))
    );
    session.drive().await;
    assert_eq!(session.conversation().len(), 2);
    let last = session.conversation().last().unwrap();
    assert_eq!(last.object.as_ref().and_then(|f| f.commentary.as_deref()), Some("second try"));
}

#[tokio::test]
async fn redelivered_snapshot_changes_nothing() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));
    session.submit(text("x")).await.unwrap();
    let tx = source.sender(0);
    let s = snapshot("same", Some("code"));
    tx.send(frame(s.clone())).unwrap();
    tx.send(frame(s.clone())).unwrap();

    session.next().await;
    let before = session.conversation().clone();
    session.next().await;
    assert_eq!(session.conversation(), &before);
}

#[tokio::test]
async fn template_choice_narrows_the_request() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));

    session.submit(text("a chart")).await.unwrap();
    session.choose_template(Some("streamlit-developer"));
    session.retry().await.unwrap();
    session.choose_template(Some("auto"));
    session.retry().await.unwrap();

    let requests = source.requests.lock().unwrap();
    let all = kiln::templates::builtin().len();
    assert_eq!(requests[0].template.len(), all);
    assert_eq!(
        requests[1].template.keys().collect::<Vec<_>>(),
        vec!["streamlit-developer"]
    );
    assert_eq!(requests[2].template.len(), all);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_freezes_state_at_last_applied_snapshot() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));
    session.submit(text("x")).await.unwrap();
    let tx = source.sender(0);
    let s1 = snapshot("one", None);
    let s2 = snapshot("one two", Some("c"));
    tx.send(frame(s1)).unwrap();
    tx.send(frame(s2.clone())).unwrap();
    tx.send(frame(snapshot("one two three", Some("cc")))).unwrap();

    session.next().await;
    session.next().await;
    assert!(session.stop());
    let _ = tx.send(frame(snapshot("late", Some("late"))));

    assert_eq!(session.next().await, None);
    assert_eq!(session.drive().await, StreamOutcome::Idle);
    assert_eq!(session.fragment(), &s2);
    assert_eq!(session.conversation().last().unwrap().object.as_ref(), Some(&s2));
}

#[tokio::test]
async fn stop_handle_interrupts_a_waiting_drive() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));
    session.submit(text("x")).await.unwrap();
    let handle = session.stop_handle().unwrap();
    let tx = source.sender(0);
    let s1 = snapshot("only", None);
    tx.send(frame(s1.clone())).unwrap();

    let driver = tokio::spawn(async move {
        let outcome = session.drive().await;
        (outcome, session)
    });
    tokio::time::sleep(ms(50)).await;
    handle.stop();
    let _ = tx.send(frame(snapshot("after stop", None)));

    let (outcome, session) = driver.await.unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(session.fragment(), &s1);
}

#[tokio::test]
async fn new_submission_cancels_and_replaces_active_stream() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));

    session.submit(text("first")).await.unwrap();
    let first = source.sender(0);
    let a1 = snapshot("first answer", None);
    first.send(frame(a1.clone())).unwrap();
    session.next().await;

    session.submit(text("second")).await.unwrap();
    let _ = first.send(frame(snapshot("first answer, continued", Some("x"))));
    let second = source.sender(1);
    let b1 = snapshot("second answer", None);
    second.send(frame(b1.clone())).unwrap();
    drop(second);

    assert_eq!(session.drive().await, StreamOutcome::Completed(b1.clone()));
    let messages = session.conversation().messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].object.as_ref(), Some(&a1));
    assert_eq!(messages[3].object.as_ref(), Some(&b1));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_line_fails_the_stream_and_keeps_partial_state() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));
    session.submit(text("x")).await.unwrap();
    let tx = source.sender(0);
    let s1 = snapshot("partial", None);
    tx.send(frame(s1.clone())).unwrap();
    let failure = ClientFailure::from_raw(
        r#"{"error":"provider_rate_limited","message":"The provider is currently unavailable due to request limit.","incident_id":"inc_1_abc"}"#,
    );
    tx.send(Ok(StreamFrame::Failed(failure.clone()))).unwrap();
    tx.send(frame(snapshot("never", None))).unwrap();

    match session.drive().await {
        StreamOutcome::Failed(f) => {
            assert_eq!(f.code, ErrorCode::ProviderRateLimited);
            assert!(f.rate_limited);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(session.failure(), Some(&failure));
    assert_eq!(session.fragment(), &s1);
    assert!(!session.is_streaming());
}

#[tokio::test]
async fn refused_request_records_rate_limit_failure() {
    let source = Arc::new(ChannelSource::default());
    *source.refuse_with.lock().unwrap() =
        Some(r#"{"error":"rate_limited","message":"You have reached your request limit."}"#.into());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));

    tokio_test::assert_err!(session.submit(text("x")).await);
    let failure = session.failure().unwrap();
    assert_eq!(failure.code, ErrorCode::RateLimited);
    assert!(failure.rate_limited);
    assert!(!session.is_streaming());
    assert_eq!(session.conversation().len(), 1);
}

// ---------------------------------------------------------------------------
// Undo / clear
// ---------------------------------------------------------------------------

#[tokio::test]
async fn undo_and_clear_reset_state() {
    let source = Arc::new(ChannelSource::default());
    let mut session = session_with(source.clone(), Arc::new(FakeSandbox::after(ms(0))));
    for round in 0..2 {
        session.submit(text("again")).await.unwrap();
        let tx = source.sender(round);
        tx.send(frame(snapshot("answer", Some("code")))).unwrap();
        drop(tx);
        tokio_test::assert_ok!(session.run().await);
    }
    assert_eq!(session.conversation().len(), 4);
    assert!(session.result().is_some());

    session.undo();
    assert_eq!(session.conversation().len(), 2);
    assert!(session.result().is_none());
    assert!(session.fragment().is_empty());
    assert_eq!(session.preview().indicator(), PreviewIndicator::Hidden);

    session.clear();
    assert!(session.conversation().is_empty());
    assert!(session.failure().is_none());
    assert_eq!(source.opened(), 2);
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_materializes_and_persists_completed_fragment() {
    let source = Arc::new(ChannelSource::default());
    let sandbox = Arc::new(FakeSandbox::after(ms(0)));
    let store = Arc::new(RecordingStore::default());
    let preview = PreviewOrchestrator::new(sandbox.clone(), PreviewSettings::default())
        .with_build_store(store.clone());
    let mut session = Session::new(source.clone(), preview, model(), LlmModelConfig::default())
        .with_identity(SessionIdentity {
            user_id: Some("u1".into()),
            team_id: Some("t1".into()),
            access_token: Some("secret".into()),
        });

    session.submit(text("x")).await.unwrap();
    let tx = source.sender(0);
    let done = snapshot("done", Some("export default 1"));
    tx.send(frame(done.clone())).unwrap();
    drop(tx);

    let outcome = session.run().await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed(done.clone()));
    assert_eq!(sandbox.calls.lock().unwrap().as_slice(), &[done]);
    assert_eq!(session.result().map(|r| r.sbx_id.as_str()), Some("sbx-1"));
    assert!(session.conversation().last().unwrap().result.is_some());

    tokio::time::timeout(Duration::from_secs(1), store.done.notified())
        .await
        .expect("build persisted");
    let builds = store.builds.lock().unwrap();
    assert_eq!(builds[0].user_id.as_deref(), Some("u1"));
    assert_eq!(builds[0].url.as_deref(), Some("https://3000-sbx-1.example"));
    assert_eq!(store.files.lock().unwrap()[0].file_path, "pages/index.tsx");
}

/// Build store that errors or never answers.
struct BrokenStore {
    hang: bool,
    attempts: Notify,
}

#[async_trait]
impl BuildStore for BrokenStore {
    async fn insert_build(&self, _build: &BuildRecord) -> Result<String, KilnError> {
        self.attempts.notify_one();
        if self.hang {
            return std::future::pending().await;
        }
        Err(KilnError::Persistence("builds: 401 Unauthorized".into()))
    }

    async fn insert_files(&self, _files: &[BuildFileRecord]) -> Result<(), KilnError> {
        Err(KilnError::Persistence("build_files: unreachable".into()))
    }
}

async fn run_with_store(store: Arc<BrokenStore>) {
    let source = Arc::new(ChannelSource::default());
    let preview = PreviewOrchestrator::new(Arc::new(FakeSandbox::after(ms(500))), PreviewSettings::default())
        .with_build_store(store.clone());
    let mut session = Session::new(source.clone(), preview, model(), LlmModelConfig::default());
    let mut rx = session.preview().subscribe();

    session.submit(text("x")).await.unwrap();
    let tx = source.sender(0);
    let done = snapshot("done", Some("export default 1"));
    tx.send(frame(done.clone())).unwrap();
    drop(tx);

    let start = tokio::time::Instant::now();
    let outcome = session.run().await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed(done));
    assert_eq!(session.result().map(|r| r.sbx_id.as_str()), Some("sbx-1"));
    assert!(session.failure().is_none());

    store.attempts.notified().await;
    rx.wait_for(|s| !s.is_loading()).await.unwrap();
    assert_eq!(start.elapsed(), ms(3000));
}

#[tokio::test(start_paused = true)]
async fn persistence_error_does_not_reach_the_session() {
    run_with_store(Arc::new(BrokenStore {
        hang: false,
        attempts: Notify::new(),
    }))
    .await;
}

#[tokio::test(start_paused = true)]
async fn stalled_persistence_does_not_hold_the_preview() {
    run_with_store(Arc::new(BrokenStore {
        hang: true,
        attempts: Notify::new(),
    }))
    .await;
}

#[tokio::test]
async fn failed_or_cancelled_streams_never_reach_the_sandbox() {
    let source = Arc::new(ChannelSource::default());
    let sandbox = Arc::new(FakeSandbox::after(ms(0)));
    let mut session = session_with(source.clone(), sandbox.clone());

    session.submit(text("x")).await.unwrap();
    source
        .sender(0)
        .send(Ok(StreamFrame::Failed(ClientFailure::from_raw("boom"))))
        .unwrap();
    assert!(matches!(session.run().await.unwrap(), StreamOutcome::Failed(_)));

    session.submit(text("y")).await.unwrap();
    session.stop();
    assert_eq!(session.run().await.unwrap(), StreamOutcome::Idle);

    assert!(sandbox.calls.lock().unwrap().is_empty());
}

async fn clear_time(sandbox_delay: Duration) -> Duration {
    let mut preview = PreviewOrchestrator::new(
        Arc::new(FakeSandbox::after(sandbox_delay)),
        PreviewSettings::default(),
    );
    let mut rx = preview.subscribe();
    let start = tokio::time::Instant::now();

    preview
        .materialize(&snapshot("x", Some("y")), &SessionIdentity::default())
        .await
        .unwrap();
    assert_eq!(start.elapsed(), sandbox_delay);

    rx.wait_for(|s| !s.is_loading()).await.unwrap();
    start.elapsed()
}

#[tokio::test(start_paused = true)]
async fn fast_result_keeps_indicator_for_minimum_duration() {
    assert_eq!(clear_time(ms(500)).await, ms(3000));
}

#[tokio::test(start_paused = true)]
async fn slow_result_clears_indicator_immediately() {
    assert_eq!(clear_time(ms(4000)).await, ms(4000));
}

#[tokio::test(start_paused = true)]
async fn phases_advance_on_a_fixed_tick() {
    let mut preview = PreviewOrchestrator::new(
        Arc::new(FakeSandbox::after(ms(5000))),
        PreviewSettings::default(),
    );
    let rx = preview.subscribe();
    let fragment = snapshot("x", Some("y"));
    let identity = SessionIdentity::default();

    let start = tokio::time::Instant::now();
    let observe = async {
        let mut seen = Vec::new();
        for at in [100, 1600, 3100, 4600] {
            tokio::time::sleep_until(start + ms(at)).await;
            seen.push(rx.borrow().clone());
        }
        seen
    };
    let (result, seen) = tokio::join!(preview.materialize(&fragment, &identity), observe);
    tokio_test::assert_ok!(result);

    let phases: Vec<usize> = seen
        .iter()
        .map(|s| match s {
            PreviewIndicator::Loading { phase, .. } => *phase,
            PreviewIndicator::Hidden => usize::MAX,
        })
        .collect();
    assert_eq!(phases, vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn sandbox_failure_hides_indicator() {
    let sandbox = FakeSandbox {
        delay: ms(200),
        fail: true,
        calls: Mutex::new(Vec::new()),
    };
    let mut preview = PreviewOrchestrator::new(Arc::new(sandbox), PreviewSettings::default());
    let err = preview
        .materialize(&snapshot("x", None), &SessionIdentity::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Sandbox(_)));
    assert_eq!(preview.indicator(), PreviewIndicator::Hidden);
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_pending_clear() {
    let mut preview = PreviewOrchestrator::new(
        Arc::new(FakeSandbox::after(ms(100))),
        PreviewSettings::default(),
    );
    preview
        .materialize(&snapshot("x", None), &SessionIdentity::default())
        .await
        .unwrap();
    preview.reset();
    assert_eq!(preview.indicator(), PreviewIndicator::Hidden);

    // A second materialization is not cut short by the first one's timer.
    let start = tokio::time::Instant::now();
    let mut rx = preview.subscribe();
    preview
        .materialize(&snapshot("y", None), &SessionIdentity::default())
        .await
        .unwrap();
    rx.wait_for(|s| !s.is_loading()).await.unwrap();
    assert_eq!(start.elapsed(), ms(3000));
}
