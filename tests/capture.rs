use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use serde_json::{json, Value};
use site_cloner::{
    browser_controller::{Launcher, PageHandle, RawResponse, ResponseCallback},
    driver::{DriverOptions, PageDriver, FREEZE_SCRIPT},
    extractor::ANIMATION_PROBE_SCRIPT,
    runner::{Runner, RunnerOptions},
    types::{CaptureError, ClonerError, ResourceKind, ToolContent, ToolResult},
    utils::{
        ARCHIVE_NAME, ASSETS_DIR, DOM_SNAPSHOT_JSON, GSAP_TWEENS_JSON, RENDERED_HTML,
        SCROLL_TRIGGERS_JSON,
    },
};

macro_rules! aw {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

#[derive(Clone)]
struct FakeResponse {
    url: &'static str,
    kind: ResourceKind,
    status: u32,
    content_type: Option<&'static str>,
    body: Vec<u8>,
}

fn response(
    url: &'static str,
    kind: ResourceKind,
    status: u32,
    content_type: Option<&'static str>,
    body: &[u8],
) -> FakeResponse {
    FakeResponse {
        url,
        kind,
        status,
        content_type,
        body: body.to_vec(),
    }
}

/// What the fake page does once navigated.
#[derive(Clone, Default)]
struct Script {
    responses: Vec<FakeResponse>,
    // sent from another thread after `navigate` has returned
    late_responses: Vec<(Duration, FakeResponse)>,
    // the first n navigations block until the page is closed or time runs out
    hang_navigations: usize,
    snapshot_fails: bool,
    fail_launch: bool,
    probe: Option<Value>,
}

#[derive(Default)]
struct Probes {
    launched: AtomicUsize,
    navigations: AtomicUsize,
    closed: AtomicBool,
    bodies_read: AtomicUsize,
}

struct FakeLauncher {
    script: Arc<Script>,
    probes: Arc<Probes>,
}

impl FakeLauncher {
    fn new(script: Script) -> (Self, Arc<Probes>) {
        let probes = Arc::new(Probes::default());
        (
            FakeLauncher {
                script: Arc::new(script),
                probes: probes.clone(),
            },
            probes,
        )
    }
}

impl Launcher for FakeLauncher {
    type Page = FakePage;

    fn launch(&self, _viewport: (u32, u32)) -> anyhow::Result<FakePage> {
        if self.script.fail_launch {
            return Err(anyhow!("could not find chrome binary"));
        }
        self.probes.launched.fetch_add(1, Ordering::SeqCst);
        Ok(FakePage {
            script: self.script.clone(),
            probes: self.probes.clone(),
            callback: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct FakePage {
    script: Arc<Script>,
    probes: Arc<Probes>,
    callback: Mutex<Option<ResponseCallback>>,
    closed: Arc<AtomicBool>,
}

fn send(cb: &ResponseCallback, r: &FakeResponse, probes: &Arc<Probes>) {
    let probes = probes.clone();
    let body = move || -> anyhow::Result<Vec<u8>> {
        probes.bodies_read.fetch_add(1, Ordering::SeqCst);
        Ok(r.body.clone())
    };
    cb(RawResponse {
        url: r.url.to_string(),
        kind: r.kind,
        status: r.status,
        content_type: r.content_type.map(String::from),
        body: &body,
    });
}

impl PageHandle for FakePage {
    fn on_response(&self, callback: ResponseCallback) -> anyhow::Result<()> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    fn navigate(
        &self,
        _url: &str,
        timeout: Duration,
    ) -> Result<(), site_cloner::types::NavigationError> {
        let n = self.probes.navigations.fetch_add(1, Ordering::SeqCst);
        if n < self.script.hang_navigations {
            let started = Instant::now();
            while started.elapsed() < timeout {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(anyhow!("target closed while navigating").into());
                }
                thread::sleep(Duration::from_millis(5));
            }
            return Err(site_cloner::types::NavigationError::Timeout(timeout));
        }
        let callback = self.callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            for r in &self.script.responses {
                send(&cb, r, &self.probes);
            }
            let late = self.script.late_responses.clone();
            if !late.is_empty() {
                let probes = self.probes.clone();
                thread::spawn(move || {
                    for (delay, r) in &late {
                        thread::sleep(*delay);
                        send(&cb, r, &probes);
                    }
                });
            }
        }
        Ok(())
    }

    fn evaluate(&self, script: &str, _await_promise: bool) -> anyhow::Result<Option<Value>> {
        if script == ANIMATION_PROBE_SCRIPT {
            return Ok(self
                .script
                .probe
                .as_ref()
                .map(|p| Value::String(p.to_string())));
        }
        if script == FREEZE_SCRIPT {
            return Ok(Some(Value::String(
                json!(["gsap.globalTimeline.pause"]).to_string(),
            )));
        }
        // scroll
        Ok(Some(json!(1000)))
    }

    fn content(&self) -> anyhow::Result<String> {
        Ok("<html><head></head><body>cloned</body></html>".into())
    }

    fn dom_snapshot(&self) -> anyhow::Result<Value> {
        if self.script.snapshot_fails {
            return Err(anyhow!("DOMSnapshot.captureSnapshot: Internal error"));
        }
        Ok(json!({ "documents": [{ "nodes": {} }], "strings": ["html"] }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.probes.closed.store(true, Ordering::SeqCst);
    }
}

fn fast_options() -> DriverOptions {
    DriverOptions::default_builder()
        .navigation_timeout(Duration::from_millis(500))
        .network_idle(Duration::from_millis(20))
        .settle_delay(Duration::ZERO)
        .scroll_delay(Duration::ZERO)
        .build()
        .unwrap()
}

fn driver(script: Script) -> (PageDriver<FakeLauncher>, Arc<Probes>) {
    let (launcher, probes) = FakeLauncher::new(script);
    (
        PageDriver::new(launcher, fast_options(), Arc::new(AtomicBool::new(false))),
        probes,
    )
}

fn static_page() -> Vec<FakeResponse> {
    vec![
        response(
            "https://example.com/css/site.css",
            ResourceKind::Stylesheet,
            200,
            Some("text/css"),
            b"body{margin:0}",
        ),
        response(
            "https://example.com/js/app.js",
            ResourceKind::Script,
            200,
            Some("application/javascript"),
            b"console.log('hi')",
        ),
    ]
}

fn asset_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root.join(ASSETS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn captures_static_page() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (driver, probes) = driver(Script {
        responses: static_page(),
        snapshot_fails: true,
        ..Default::default()
    });

    let session = aw!(driver.run("https://example.com/", dir.path()))?;

    assert_eq!(
        asset_names(dir.path()),
        vec!["example.com_css_site.css", "example.com_js_app.js"]
    );
    assert_eq!(
        fs::read(dir.path().join(ASSETS_DIR).join("example.com_css_site.css"))?,
        b"body{margin:0}"
    );
    assert!(dir.path().join(RENDERED_HTML).exists());
    assert!(!dir.path().join(DOM_SNAPSHOT_JSON).exists());
    assert_eq!(session.resources.len(), 2);
    assert_eq!(session.frozen_hooks, vec!["gsap.globalTimeline.pause"]);
    assert!(probes.closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn infers_extension_for_bare_urls() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (driver, _) = driver(Script {
        responses: vec![response(
            "https://cdn.example.com/images/logo?v=2",
            ResourceKind::Image,
            200,
            Some("image/png"),
            &[0x89, b'P', b'N', b'G'],
        )],
        ..Default::default()
    });

    let session = aw!(driver.run("https://example.com/", dir.path()))?;

    assert_eq!(
        asset_names(dir.path()),
        vec!["cdn.example.com_images_logo_v_2.img"]
    );
    assert_eq!(session.resources[0].content_type.as_deref(), Some("image/png"));
    assert_eq!(session.resources[0].size, 4);
    Ok(())
}

#[test]
fn navigation_timeout_is_fatal_and_releases_browser() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, probes) = driver(Script {
        responses: static_page(),
        hang_navigations: 1,
        ..Default::default()
    });

    let res = aw!(driver.run("https://slow.example.com/", dir.path()));

    assert!(matches!(res, Err(CaptureError::NavigationTimeout { .. })));
    assert_eq!(probes.launched.load(Ordering::SeqCst), 1);
    assert!(probes.closed.load(Ordering::SeqCst));
    assert!(!dir.path().join(RENDERED_HTML).exists());
}

#[test]
fn all_rejected_is_no_resources() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, probes) = driver(Script {
        responses: vec![
            response(
                "https://example.com/missing.css",
                ResourceKind::Stylesheet,
                404,
                Some("text/html"),
                b"not found",
            ),
            response(
                "https://api.example.com/data",
                ResourceKind::Other,
                200,
                Some("application/json"),
                b"{}",
            ),
            response(
                "https://example.com/empty.js",
                ResourceKind::Script,
                200,
                Some("application/javascript"),
                b"",
            ),
        ],
        ..Default::default()
    });

    let res = aw!(driver.run("https://example.com/", dir.path()));

    match res {
        Err(e @ CaptureError::NoResources { .. }) => {
            assert!(e.to_string().contains("no files downloaded"))
        }
        other => panic!("expected no_resources, got {:?}", other.map(|s| s.resources)),
    }
    // only the empty script got as far as a body read
    assert_eq!(probes.bodies_read.load(Ordering::SeqCst), 1);
    assert!(probes.closed.load(Ordering::SeqCst));
}

#[test]
fn snapshot_failure_keeps_animation_state() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (driver, _) = driver(Script {
        responses: static_page(),
        snapshot_fails: true,
        probe: Some(json!({
            "scrolltriggers": [
                { "trigger": "hero", "start": 0, "end": 800, "scrub": 1, "pin": true, "vars": { "scrub": 1, "pin": true } }
            ],
            "gsaptweens": [
                { "id": "intro", "targets": ["logo"], "duration": 1.2, "vars": { "opacity": 0 } }
            ],
            "errors": []
        })),
        ..Default::default()
    });

    let session = aw!(driver.run("https://example.com/", dir.path()))?;

    assert!(dir.path().join(RENDERED_HTML).exists());
    assert!(!dir.path().join(DOM_SNAPSHOT_JSON).exists());
    let triggers: Value =
        serde_json::from_slice(&fs::read(dir.path().join(SCROLL_TRIGGERS_JSON))?)?;
    assert_eq!(triggers[0]["trigger"], json!("hero"));
    let tweens: Value = serde_json::from_slice(&fs::read(dir.path().join(GSAP_TWEENS_JSON))?)?;
    assert_eq!(tweens[0]["duration"], json!(1.2));
    assert_eq!(
        session.written,
        vec![RENDERED_HTML, SCROLL_TRIGGERS_JSON, GSAP_TWEENS_JSON]
    );
    Ok(())
}

#[test]
fn duplicate_urls_are_written_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut responses = static_page();
    responses.push(response(
        "https://example.com/css/site.css#reload",
        ResourceKind::Stylesheet,
        200,
        Some("text/css"),
        b"body{margin:1px}",
    ));
    let (driver, probes) = driver(Script {
        responses,
        ..Default::default()
    });

    let session = aw!(driver.run("https://example.com/", dir.path()))?;

    assert_eq!(session.resources.len(), 2);
    assert_eq!(session.seen_urls.len(), 2);
    assert!(dir.path().join(DOM_SNAPSHOT_JSON).exists());
    // the sink may not have claimed the first copy before the second arrives
    assert!(probes.bodies_read.load(Ordering::SeqCst) <= 3);
    assert_eq!(
        asset_names(dir.path()),
        vec!["example.com_css_site.css", "example.com_js_app.js"]
    );
    Ok(())
}

#[test]
fn launch_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _) = driver(Script {
        fail_launch: true,
        ..Default::default()
    });
    let res = aw!(driver.run("https://example.com/", dir.path()));
    assert!(matches!(res, Err(CaptureError::BrowserLaunch(_))));
}

#[test]
fn cancelled_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, probes) = FakeLauncher::new(Script {
        responses: static_page(),
        ..Default::default()
    });
    let driver = PageDriver::new(launcher, fast_options(), Arc::new(AtomicBool::new(true)));
    let res = aw!(driver.run("https://example.com/", dir.path()));
    assert!(matches!(res, Err(CaptureError::Cancelled)));
    assert_eq!(probes.launched.load(Ordering::SeqCst), 0);
}

fn runner_with(
    script: Script,
    output_dir: &Path,
    with_archive: bool,
    driver: DriverOptions,
) -> (Runner<FakeLauncher>, Arc<Probes>) {
    let (launcher, probes) = FakeLauncher::new(script);
    let options = RunnerOptions::default_builder()
        .output_dir(output_dir.to_path_buf())
        .with_archive(with_archive)
        .driver(driver)
        .build()
        .unwrap();
    (
        Runner::with_launcher(launcher, options, Arc::new(AtomicBool::new(false))),
        probes,
    )
}

fn runner(script: Script, output_dir: &Path, with_archive: bool) -> Runner<FakeLauncher> {
    runner_with(script, output_dir, with_archive, fast_options()).0
}

#[test]
fn runner_packages_capture() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("cloned_site");
    let runner = runner(
        Script {
            responses: static_page(),
            ..Default::default()
        },
        &out,
        true,
    );

    let outcome = aw!(runner.run("https://example.com/"))?;

    let archive = outcome.archive.as_ref().unwrap();
    assert!(archive.path.ends_with(ARCHIVE_NAME));
    // two assets, rendered.html and domsnapshot.json
    assert_eq!(archive.entries, 4);
    assert_eq!(archive.size, fs::metadata(&archive.path)?.len());

    let result = serde_json::to_value(outcome.tool_result())?;
    assert!(result.get("isError").is_none());
    assert_eq!(result["content"][1]["type"], json!("resource_link"));
    assert_eq!(result["content"][1]["name"], json!("site.zip"));
    assert_eq!(result["content"][1]["mimeType"], json!("application/zip"));
    assert!(result["content"][1]["uri"]
        .as_str()
        .unwrap()
        .starts_with("file:///"));
    Ok(())
}

#[test]
fn runner_without_archive() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = runner(
        Script {
            responses: static_page(),
            ..Default::default()
        },
        dir.path(),
        false,
    );
    let outcome = aw!(runner.run("https://example.com/"))?;
    assert!(outcome.archive.is_none());
    assert!(!dir.path().join(ARCHIVE_NAME).exists());
    assert_eq!(outcome.tool_result().content.len(), 1);
    Ok(())
}

#[test]
fn runner_reports_capture_errors() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Script::default(), dir.path(), true);

    let err = aw!(runner.run("https://example.com/")).unwrap_err();
    assert!(matches!(
        err,
        ClonerError::Capture(CaptureError::NoResources { .. })
    ));
    assert!(!dir.path().join(ARCHIVE_NAME).exists());

    let result = ToolResult::from(&err);
    assert!(result.is_error);
    match &result.content[0] {
        ToolContent::Text { text } => assert!(text.starts_with("could not capture page")),
        other => panic!("unexpected content {:?}", other),
    }
}

#[test]
fn runner_reports_packaging_errors() {
    let dir = tempfile::tempdir().unwrap();
    // a directory where the archive should go makes the zip step fail
    fs::create_dir_all(dir.path().join(ARCHIVE_NAME)).unwrap();
    let runner = runner(
        Script {
            responses: static_page(),
            ..Default::default()
        },
        dir.path(),
        true,
    );

    let err = aw!(runner.run("https://example.com/")).unwrap_err();
    assert!(matches!(err, ClonerError::Packaging(_)));
    // the capture itself is on disk
    assert!(dir.path().join(RENDERED_HTML).exists());

    let result = ToolResult::from(&err);
    assert!(result.is_error);
    match &result.content[0] {
        ToolContent::Text { text } => {
            assert!(text.starts_with("captured but could not package"))
        }
        other => panic!("unexpected content {:?}", other),
    }
}

#[test]
fn session_timeout_closes_browser_and_runner_stays_usable() {
    let dir = tempfile::tempdir().unwrap();
    let options = DriverOptions::default_builder()
        .navigation_timeout(Duration::from_secs(5))
        .network_idle(Duration::from_millis(20))
        .session_timeout(Duration::from_secs(1))
        .settle_delay(Duration::ZERO)
        .scroll_delay(Duration::ZERO)
        .build()
        .unwrap();
    let (runner, probes) = runner_with(
        Script {
            responses: static_page(),
            hang_navigations: 1,
            ..Default::default()
        },
        dir.path(),
        false,
        options,
    );

    let started = Instant::now();
    let err = aw!(runner.run("https://example.com/")).unwrap_err();
    assert!(matches!(
        err,
        ClonerError::Capture(CaptureError::SessionTimeout(_))
    ));
    assert!(probes.closed.load(Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_secs(4));

    let outcome = aw!(runner.run("https://example.com/")).unwrap();
    assert_eq!(outcome.session.resources.len(), 2);
    assert_eq!(probes.launched.load(Ordering::SeqCst), 2);
}

#[test]
fn waits_for_late_responses() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (launcher, _) = FakeLauncher::new(Script {
        responses: static_page(),
        late_responses: vec![(
            Duration::from_millis(100),
            response(
                "https://example.com/img/hero.webp",
                ResourceKind::Image,
                200,
                Some("image/webp"),
                b"RIFF",
            ),
        )],
        ..Default::default()
    });
    let options = DriverOptions::default_builder()
        .navigation_timeout(Duration::from_secs(3))
        .network_idle(Duration::from_millis(400))
        .settle_delay(Duration::ZERO)
        .scroll_delay(Duration::ZERO)
        .build()?;
    let driver = PageDriver::new(launcher, options, Arc::new(AtomicBool::new(false)));

    let session = aw!(driver.run("https://example.com/", dir.path()))?;

    assert_eq!(session.resources.len(), 3);
    assert!(asset_names(dir.path()).contains(&"example.com_img_hero.webp".to_string()));
    Ok(())
}

#[test]
fn busy_network_is_a_navigation_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let late = (0..100)
        .map(|_| {
            (
                Duration::from_millis(10),
                response(
                    "https://telemetry.example.com/ping",
                    ResourceKind::Other,
                    200,
                    None,
                    b"",
                ),
            )
        })
        .collect();
    let (launcher, probes) = FakeLauncher::new(Script {
        responses: static_page(),
        late_responses: late,
        ..Default::default()
    });
    let options = DriverOptions::default_builder()
        .navigation_timeout(Duration::from_millis(300))
        .network_idle(Duration::from_millis(100))
        .build()
        .unwrap();
    let driver = PageDriver::new(launcher, options, Arc::new(AtomicBool::new(false)));

    let res = aw!(driver.run("https://example.com/", dir.path()));

    assert!(matches!(res, Err(CaptureError::NavigationTimeout { .. })));
    assert!(probes.closed.load(Ordering::SeqCst));
}

#[test]
fn runner_rejects_invalid_urls() {
    let dir = tempfile::tempdir().unwrap();
    let runner = runner(Script::default(), dir.path(), true);
    for url in ["not a url", "ftp://example.com/file"] {
        let err = aw!(runner.run(url)).unwrap_err();
        assert!(matches!(
            err,
            ClonerError::Capture(CaptureError::InvalidUrl(_))
        ));
    }
}

/*
RUST_LOG=debug cargo test --test capture -- clone_real_page --exact --ignored
 */
#[test]
#[ignore = "needs chrome"]
fn clone_real_page() -> anyhow::Result<()> {
    env_logger::init();
    let dir = tempfile::tempdir()?;
    let options = RunnerOptions::default_builder()
        .output_dir(dir.path().to_path_buf())
        .driver(DriverOptions::default_builder().build()?)
        .build()?;
    let runner = Runner::new(options)?;
    let outcome = aw!(runner.run("https://example.com/"))?;
    println!("{}", outcome.summary());
    assert!(outcome.archive.is_some());
    Ok(())
}
