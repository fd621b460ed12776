//! Restart decisions of the supervisor loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use dexkeeper::dex::{DexRenderer, RenderError, Renderer};
use dexkeeper::redactor::LOG_MASK;
use dexkeeper::settings::{Publisher, Settings, SettingsError, SettingsSource, Subscription};
use dexkeeper::supervisor::{
    Launcher, ManagedProcess, ProcessError, Supervisor, SupervisorError, SupervisorOptions,
    Termination,
};

const ONE_CONNECTOR: &str = "connectors:\n- type: github\n  id: github\n  name: GitHub\n  config:\n    clientID: abc\n";
const TWO_CONNECTORS: &str = "connectors:\n- type: github\n  id: github\n  name: GitHub\n  config:\n    clientID: abc\n- type: ldap\n  id: ldap\n  name: LDAP\n  config:\n    host: ldap:636\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started { pid: u32, config: String },
    Stopped { pid: u32 },
}

type Events = Arc<Mutex<Vec<Event>>>;

fn events_of(events: &Events) -> Vec<Event> {
    events
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Settings source whose snapshots are pushed by the test. Dropping the
/// test's `Arc` closes every subscription.
struct TestSource {
    initial: Settings,
    publisher: Weak<Publisher<Settings>>,
}

fn test_source(initial: Settings) -> (TestSource, Arc<Publisher<Settings>>) {
    let publisher = Arc::new(Publisher::new());
    let source = TestSource {
        initial,
        publisher: Arc::downgrade(&publisher),
    };
    (source, publisher)
}

#[async_trait]
impl SettingsSource for TestSource {
    async fn current(&self) -> Result<Settings, SettingsError> {
        Ok(self.initial.clone())
    }

    fn subscribe(&self) -> Result<Subscription<Settings>, SettingsError> {
        match self.publisher.upgrade() {
            Some(publisher) => Ok(publisher.subscribe()),
            None => Err(SettingsError::Read {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("publisher dropped"),
            }),
        }
    }
}

/// Counts renders so tests can wait for an update to be processed.
struct CountingRenderer {
    inner: DexRenderer,
    renders: Arc<AtomicUsize>,
}

impl Renderer for CountingRenderer {
    fn render(&self, settings: &Settings, disable_tls: bool) -> Result<Vec<u8>, RenderError> {
        let result = self.inner.render(settings, disable_tls);
        self.renders.fetch_add(1, Ordering::SeqCst);
        result
    }
}

struct FailingRenderer;

impl Renderer for FailingRenderer {
    fn render(&self, _settings: &Settings, _disable_tls: bool) -> Result<Vec<u8>, RenderError> {
        Err(RenderError::Malformed("broken".to_owned()))
    }
}

#[derive(Default)]
struct FakeLauncher {
    events: Events,
    next_pid: AtomicUsize,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        let config = std::fs::read_to_string(config_path).map_err(|e| ProcessError::Start {
            program: "fake".to_owned(),
            detail: e.to_string(),
        })?;
        let pid = u32::try_from(self.next_pid.fetch_add(1, Ordering::SeqCst).saturating_add(100))
            .unwrap_or(u32::MAX);
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Event::Started { pid, config });
        Ok(Box::new(FakeProcess {
            pid,
            events: Arc::clone(&self.events),
            fail_signal: false,
        }))
    }
}

struct FakeProcess {
    pid: u32,
    events: Events,
    fail_signal: bool,
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Termination, ProcessError> {
        if self.fail_signal {
            return Err(ProcessError::Signal {
                pid: self.pid,
                detail: "refused".to_owned(),
            });
        }
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Event::Stopped { pid: self.pid });
        Ok(Termination::Exited { code: Some(0) })
    }
}

/// Launcher whose processes cannot be signalled.
#[derive(Default)]
struct StubbornLauncher {
    events: Events,
}

#[async_trait]
impl Launcher for StubbornLauncher {
    async fn launch(&self, _config_path: &Path) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        Ok(Box::new(FakeProcess {
            pid: 7,
            events: Arc::clone(&self.events),
            fail_signal: true,
        }))
    }
}

fn settings(dex_config: &str, generation: u64) -> Settings {
    Settings {
        url: "https://cd.example.com".to_owned(),
        dex_config: dex_config.to_owned(),
        generation,
        ..Settings::default()
    }
}

fn unconfigured(generation: u64) -> Settings {
    Settings {
        generation,
        ..Settings::default()
    }
}

struct Harness {
    publisher: Arc<Publisher<Settings>>,
    renders: Arc<AtomicUsize>,
    events: Events,
    shutdown: watch::Sender<bool>,
    config_path: PathBuf,
    task: tokio::task::JoinHandle<(Result<(), SupervisorError>, u64)>,
    tmp: Arc<tempfile::TempDir>,
}

impl Harness {
    fn start(initial: Settings) -> Self {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let config_path = tmp.path().join("dex.yaml");
        let (source, publisher) = test_source(initial);
        let renders = Arc::new(AtomicUsize::new(0));
        let launcher = FakeLauncher::default();
        let events = Arc::clone(&launcher.events);

        let renderer = CountingRenderer {
            inner: DexRenderer::default(),
            renders: Arc::clone(&renders),
        };
        let options = SupervisorOptions {
            disable_tls: true,
            config_path: config_path.clone(),
            shutdown_timeout: Duration::from_secs(1),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(source, renderer, launcher, options);
        let task = tokio::spawn(async move {
            let result = supervisor.run(shutdown_rx).await;
            (result, supervisor.config_changes())
        });

        Self {
            publisher,
            renders,
            events,
            shutdown,
            config_path,
            task,
            tmp: Arc::new(tmp),
        }
    }

    async fn wait_for_renders(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.renders.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {count} renders");
    }

    /// Publish `settings` and wait until the supervisor has rendered it.
    async fn push(&self, settings: Settings) {
        let before = self.renders.load(Ordering::SeqCst);
        self.publisher.publish(settings);
        self.wait_for_renders(before + 1).await;
        // Let the loop finish acting on the render before the next push.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn finish(self) -> (Result<(), SupervisorError>, u64, Vec<Event>) {
        let _ = self.shutdown.send(true);
        let joined = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        let (result, changes) = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => panic!("supervisor task panicked: {err}"),
            Err(_) => panic!("supervisor did not stop"),
        };
        (result, changes, events_of(&self.events))
    }
}

/// No two processes may be alive at once, and every stop matches the
/// process most recently started.
fn assert_no_overlap(events: &[Event]) {
    let mut running: Option<u32> = None;
    for event in events {
        match event {
            Event::Started { pid, .. } => {
                assert!(running.is_none(), "process {pid} started while {running:?} alive");
                running = Some(*pid);
            }
            Event::Stopped { pid } => {
                assert_eq!(running, Some(*pid), "stopped a process that was not running");
                running = None;
            }
        }
    }
}

fn started_count(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::Started { .. }))
        .count()
}

#[tokio::test]
async fn unconfigured_then_configured_starts_dex() {
    let harness = Harness::start(unconfigured(0));
    harness.wait_for_renders(1).await;
    assert!(events_of(&harness.events).is_empty());

    harness.push(settings(ONE_CONNECTOR, 1)).await;

    let config_path = harness.config_path.clone();
    // Keep the temp dir alive past `finish`, which drops the harness.
    let _tmp = Arc::clone(&harness.tmp);
    let (result, changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(changes, 1);
    assert_eq!(started_count(&events), 1);

    let written = std::fs::read_to_string(&config_path).expect("config should be written");
    match &events[0] {
        Event::Started { config, .. } => assert_eq!(config, &written),
        other => panic!("expected a start, got {other:?}"),
    }
    assert!(written.contains("type: github"));
    assert_no_overlap(&events);
}

#[tokio::test]
async fn identical_renderings_never_restart() {
    let harness = Harness::start(settings(ONE_CONNECTOR, 0));
    harness.wait_for_renders(1).await;

    for generation in 1..=5 {
        harness.push(settings(ONE_CONNECTOR, generation)).await;
    }

    let (result, changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(changes, 0);
    assert_eq!(started_count(&events), 1);
    // The one process is stopped on shutdown.
    assert_eq!(events.len(), 2);
    assert_no_overlap(&events);
}

#[tokio::test]
async fn each_change_restarts_exactly_once() {
    let harness = Harness::start(settings(ONE_CONNECTOR, 0));
    harness.wait_for_renders(1).await;

    harness.push(settings(TWO_CONNECTORS, 1)).await;
    harness.push(settings(TWO_CONNECTORS, 2)).await;
    harness.push(settings(ONE_CONNECTOR, 3)).await;

    let (result, changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(changes, 2);
    assert_eq!(started_count(&events), 3);
    assert_no_overlap(&events);

    let configs: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::Started { config, .. } => Some(config.as_str()),
            Event::Stopped { .. } => None,
        })
        .collect();
    assert!(!configs[0].contains("type: ldap"));
    assert!(configs[1].contains("type: ldap"));
    assert!(!configs[2].contains("type: ldap"));
}

#[tokio::test]
async fn becoming_unconfigured_stops_dex_without_replacement() {
    let harness = Harness::start(settings(ONE_CONNECTOR, 0));
    harness.wait_for_renders(1).await;

    harness.push(unconfigured(1)).await;
    let after_disable = events_of(&harness.events);
    assert_eq!(after_disable.len(), 2);
    assert!(matches!(after_disable[1], Event::Stopped { .. }));

    // Still unconfigured: nothing to do.
    harness.push(unconfigured(2)).await;

    let (result, changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(changes, 1);
    assert_eq!(events.len(), 2);
    assert_no_overlap(&events);
}

#[tokio::test]
async fn coalesced_updates_apply_only_the_latest() {
    let harness = Harness::start(unconfigured(0));
    harness.wait_for_renders(1).await;

    // The test runtime is single threaded, so the supervisor task cannot
    // run between these publishes.
    harness.publisher.publish(settings(ONE_CONNECTOR, 1));
    harness.publisher.publish(unconfigured(2));
    harness.publisher.publish(settings(TWO_CONNECTORS, 3));
    harness.wait_for_renders(2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (result, _changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(started_count(&events), 1);
    match &events[0] {
        Event::Started { config, .. } => assert!(config.contains("type: ldap")),
        other => panic!("expected a start, got {other:?}"),
    }
}

#[tokio::test]
async fn render_errors_are_fatal() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let (source, _publisher) = test_source(settings(ONE_CONNECTOR, 0));
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: tmp.path().join("dex.yaml"),
        shutdown_timeout: Duration::from_secs(1),
    };
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor =
        Supervisor::new(source, FailingRenderer, FakeLauncher::default(), options);

    let result = supervisor.run(shutdown_rx).await;
    assert!(matches!(result, Err(SupervisorError::Render(_))));
}

#[tokio::test]
async fn persist_errors_are_fatal() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let (source, _publisher) = test_source(settings(ONE_CONNECTOR, 0));
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: tmp.path().join("missing-dir").join("dex.yaml"),
        shutdown_timeout: Duration::from_secs(1),
    };
    let launcher = FakeLauncher::default();
    let events = Arc::clone(&launcher.events);
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(source, DexRenderer::default(), launcher, options);

    let result = supervisor.run(shutdown_rx).await;
    assert!(matches!(result, Err(SupervisorError::Persist { .. })));
    assert!(events_of(&events).is_empty());
}

#[tokio::test]
async fn signal_errors_are_fatal() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let (source, publisher) = test_source(settings(ONE_CONNECTOR, 0));
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: tmp.path().join("dex.yaml"),
        shutdown_timeout: Duration::from_secs(1),
    };
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor =
        Supervisor::new(source, DexRenderer::default(), StubbornLauncher::default(), options);

    let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher.publish(settings(TWO_CONNECTORS, 1));

    let joined = tokio::time::timeout(Duration::from_secs(5), task).await;
    assert!(matches!(
        joined,
        Ok(Ok(Err(SupervisorError::Process(ProcessError::Signal { .. }))))
    ));
}

#[tokio::test]
async fn shutdown_stops_the_running_process() {
    let harness = Harness::start(settings(ONE_CONNECTOR, 0));
    harness.wait_for_renders(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (result, changes, events) = harness.finish().await;
    assert!(result.is_ok());
    assert_eq!(changes, 0);
    assert!(matches!(events.as_slice(), [Event::Started { .. }, Event::Stopped { .. }]));
}

#[tokio::test]
async fn closed_subscription_ends_the_loop() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let (source, publisher) = test_source(settings(ONE_CONNECTOR, 0));
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: tmp.path().join("dex.yaml"),
        shutdown_timeout: Duration::from_secs(1),
    };
    let launcher = FakeLauncher::default();
    let events = Arc::clone(&launcher.events);
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(source, DexRenderer::default(), launcher, options);

    let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(publisher);

    let joined = tokio::time::timeout(Duration::from_secs(5), task).await;
    assert!(matches!(joined, Ok(Ok(Ok(())))));
    assert!(matches!(
        events_of(&events).as_slice(),
        [Event::Started { .. }, Event::Stopped { .. }]
    ));
}

/// Source whose initial snapshot never arrives.
struct StalledSource;

#[async_trait]
impl SettingsSource for StalledSource {
    async fn current(&self) -> Result<Settings, SettingsError> {
        std::future::pending().await
    }

    fn subscribe(&self) -> Result<Subscription<Settings>, SettingsError> {
        Ok(Publisher::new().subscribe())
    }
}

#[tokio::test]
async fn shutdown_during_bootstrap_returns_cleanly() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: tmp.path().join("dex.yaml"),
        shutdown_timeout: Duration::from_secs(1),
    };
    let launcher = FakeLauncher::default();
    let events = Arc::clone(&launcher.events);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(StalledSource, DexRenderer::default(), launcher, options);

    let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(shutdown.send(true).is_ok());

    let joined = tokio::time::timeout(Duration::from_secs(2), task).await;
    assert!(matches!(joined, Ok(Ok(Ok(())))));
    assert!(events_of(&events).is_empty());
    assert!(!tmp.path().join("dex.yaml").exists());
}

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        let bytes = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

const SECRET_BEARING: &str = "connectors:\n- type: github\n  id: github\n  name: GitHub\n  config:\n    clientID: abc\n    clientSecret: gh-plain-secret\n- type: ldap\n  id: ldap\n  name: LDAP\n  config:\n    host: ldap:636\n    bindPW: hunter2\nstaticClients:\n- id: extra\n  name: Extra\n  secret: extra-plain-secret\n";

#[tokio::test]
async fn logged_config_is_masked() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_writer(logs.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config_path = tmp.path().join("dex.yaml");
    let initial = settings(SECRET_BEARING, 0);
    let server_secret = initial.dex_oauth2_client_secret();
    let (source, _publisher) = test_source(initial);
    let options = SupervisorOptions {
        disable_tls: true,
        config_path: config_path.clone(),
        shutdown_timeout: Duration::from_secs(1),
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut supervisor =
        Supervisor::new(source, DexRenderer::default(), FakeLauncher::default(), options);

    // Polled on this thread so the scoped subscriber sees every event.
    let (result, _) = tokio::join!(supervisor.run(shutdown_rx), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(true)
    });
    assert!(result.is_ok());

    let written = std::fs::read_to_string(&config_path).expect("config should be written");
    assert!(written.contains("hunter2"));
    assert!(written.contains("gh-plain-secret"));

    let output = logs.contents();
    assert!(output.contains("rendered dex config"), "no config logged: {output}");
    assert!(output.contains(LOG_MASK));
    for secret in ["gh-plain-secret", "hunter2", "extra-plain-secret", server_secret.as_str()] {
        assert!(!output.contains(secret), "{secret} leaked into logs");
    }
}
