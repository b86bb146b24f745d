use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::HashSet,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tokio::task;

use crate::{
    browser_controller::{Launcher, PageHandle, ResponseCallback},
    extractor,
    listener::{NetworkActivity, ResponseListener, DEFAULT_WRITE_CONCURRENCY},
    types::{
        CaptureError, CapturedResource, ExtractedArtifacts, NavigationError, SessionStatus,
    },
    utils::assets_dir,
};

/// Best-effort pause of the smooth-scroll and animation tickers a page may
/// expose. Returns a JSON array naming the hooks that were called.
pub const FREEZE_SCRIPT: &str = r#"(() => {
    const fired = [];
    try {
        if (window.lenis && typeof window.lenis.stop === 'function') {
            window.lenis.stop();
            fired.push('lenis.stop');
        }
    } catch (e) {}
    try {
        const g = window.gsap;
        if (g && g.globalTimeline && typeof g.globalTimeline.pause === 'function') {
            g.globalTimeline.pause();
            fired.push('gsap.globalTimeline.pause');
        }
        if (g && g.ticker && typeof g.ticker.fps === 'function') {
            g.ticker.fps(0);
            fired.push('gsap.ticker.fps');
        }
    } catch (e) {}
    return JSON.stringify(fired);
})()"#;

pub fn get_scroll_script(step: u32, delay: Duration) -> String {
    format!(
        r#" new Promise((resolve) => {{
            var totalHeight = 0;
            var scrollHeight = Math.max(
                document.body ? document.body.scrollHeight : 0,
                document.documentElement ? document.documentElement.scrollHeight : 0
            );
            var timer = setInterval(() => {{
                window.scrollBy(0, {step});
                totalHeight += {step};

                if(totalHeight >= scrollHeight){{
                    clearInterval(timer);
                    resolve(totalHeight);
                }}
            }}, {delay});
        }});"#,
        step = step,
        delay = delay.as_millis()
    )
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct DriverOptions {
    // fixed window size, layout dependent capture must be reproducible
    #[builder(default = "(1920, 1080)")]
    viewport: (u32, u32),
    // how long navigation may take to reach network idle
    #[builder(default = "Duration::from_secs(120)")]
    navigation_timeout: Duration,
    // quiet window after which the network counts as idle
    #[builder(default = "Duration::from_millis(500)")]
    network_idle: Duration,
    // upper bound for a whole capture, browser teardown included
    #[builder(default = "Duration::from_secs(300)")]
    session_timeout: Duration,
    // pixels per scroll increment
    #[builder(default = "500")]
    scroll_step: u32,
    #[builder(default = "Duration::from_millis(200)")]
    scroll_delay: Duration,
    // pause after scrolling so late requests can land
    #[builder(default = "Duration::from_millis(1500)")]
    settle_delay: Duration,
    // concurrent asset writes
    #[builder(default = "DEFAULT_WRITE_CONCURRENCY")]
    write_concurrency: usize,
}

impl DriverOptions {
    pub fn default_builder() -> DriverOptionsBuilder {
        DriverOptionsBuilder::default()
    }

    pub fn navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

const NETWORK_IDLE_POLL: Duration = Duration::from_millis(50);

/// One capture of one page.
#[derive(Debug)]
pub struct PageSession {
    pub target_url: String,
    pub output_root: PathBuf,
    pub status: SessionStatus,
    pub seen_urls: HashSet<String>,
    pub resources: Vec<CapturedResource>,
    pub artifacts: ExtractedArtifacts,
    /// artifact files written next to `assets/`
    pub written: Vec<&'static str>,
    /// animation hooks that were paused before extraction
    pub frozen_hooks: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PageSession {
    fn new(target_url: &str, output_root: &Path) -> Self {
        PageSession {
            target_url: target_url.to_string(),
            output_root: output_root.to_path_buf(),
            status: SessionStatus::Navigating,
            seen_urls: HashSet::new(),
            resources: vec![],
            artifacts: ExtractedArtifacts::default(),
            written: vec![],
            frozen_hooks: vec![],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn advance(&mut self, next: SessionStatus) {
        debug!("{}: {:?} -> {:?}", self.target_url, self.status, next);
        self.status = next;
    }

    pub fn total_bytes(&self) -> u64 {
        self.resources.iter().map(|r| r.size as u64).sum()
    }
}

// closes the page on every exit path
struct PageGuard<P: PageHandle>(Arc<P>);

impl<P: PageHandle> Deref for PageGuard<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.0
    }
}

// the live page, reachable from outside the capture thread so a timed out
// session can be torn down while a browser call is still blocking
type PageSlot<P> = Arc<Mutex<Option<Arc<P>>>>;

/// Signal flag shared by every session plus a flag owned by one session.
#[derive(Clone)]
struct Cancellation {
    signal: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
}

impl Cancellation {
    fn check(&self) -> Result<(), CaptureError> {
        if self.signal.load(Ordering::Relaxed) || self.session.load(Ordering::Relaxed) {
            return Err(CaptureError::Cancelled);
        }
        Ok(())
    }
}

impl<P: PageHandle> Drop for PageGuard<P> {
    fn drop(&mut self) {
        debug!("tearing down browser...");
        self.0.close();
    }
}

pub struct PageDriver<L: Launcher> {
    launcher: Arc<L>,
    options: DriverOptions,
    should_terminate: Arc<AtomicBool>,
}

impl<L: Launcher> PageDriver<L> {
    pub fn new(launcher: L, options: DriverOptions, should_terminate: Arc<AtomicBool>) -> Self {
        PageDriver {
            launcher: Arc::new(launcher),
            options,
            should_terminate,
        }
    }

    /// Captures `target_url` into `output_root`. The browser is gone by the
    /// time this returns, whatever the outcome, including a session that ran
    /// past `session_timeout`.
    pub async fn run(
        &self,
        target_url: &str,
        output_root: &Path,
    ) -> Result<PageSession, CaptureError> {
        let assets = assets_dir(output_root);
        tokio::fs::create_dir_all(&assets).await?;

        let listener = ResponseListener::spawn(assets, self.options.write_concurrency);
        let callback = listener.callback();
        let activity = listener.activity();
        let mut session = PageSession::new(target_url, output_root);

        let cancel = Cancellation {
            signal: self.should_terminate.clone(),
            session: Arc::new(AtomicBool::new(false)),
        };
        let slot: PageSlot<L::Page> = Arc::new(Mutex::new(None));

        let launcher = self.launcher.clone();
        let options = self.options.clone();
        let drive_cancel = cancel.clone();
        let drive_slot = slot.clone();
        let mut handle = task::spawn_blocking(move || {
            let res = drive(
                launcher.as_ref(),
                &options,
                &drive_cancel,
                &drive_slot,
                &mut session,
                callback,
                &activity,
            );
            (session, res)
        });

        let timeout = self.options.session_timeout;
        let (joined, timed_out) = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => (joined, false),
            Err(_) => {
                error!("capture of {} exceeded {:?}, aborting", target_url, timeout);
                cancel.session.store(true, Ordering::Relaxed);
                let page = take_page(&slot);
                if let Some(page) = page {
                    if let Err(e) = task::spawn_blocking(move || page.close()).await {
                        warn!("closing timed out page failed: {}", e);
                    }
                }
                (handle.await, true)
            }
        };
        drop(take_page(&slot));

        // the page is closed at this point, no more responses can arrive
        let ledger = listener.finish().await;

        let (mut session, res) = match joined {
            Ok(r) => r,
            Err(e) => {
                error!("capture thread for {} failed: {}", target_url, e);
                return Err(CaptureError::Internal(format!("capture thread failed: {}", e)));
            }
        };
        session.resources = ledger.resources;
        session.seen_urls = ledger.seen_urls;
        session.finished_at = Some(Utc::now());

        if timed_out {
            session.advance(SessionStatus::Failed);
            return Err(CaptureError::SessionTimeout(timeout));
        }
        if let Err(e) = res {
            session.advance(SessionStatus::Failed);
            error!("capture of {} failed: {}", target_url, e);
            return Err(e);
        }
        if session.resources.is_empty() {
            session.advance(SessionStatus::Failed);
            error!("no resources captured for {}", target_url);
            return Err(CaptureError::NoResources {
                url: target_url.to_string(),
            });
        }

        session.advance(SessionStatus::Done);
        info!(
            "captured {} resources ({} bytes) and {:?} from {}",
            session.resources.len(),
            session.total_bytes(),
            session.written,
            target_url
        );
        Ok(session)
    }
}

fn take_page<P>(slot: &PageSlot<P>) -> Option<Arc<P>> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

fn drive<L: Launcher + ?Sized>(
    launcher: &L,
    options: &DriverOptions,
    cancel: &Cancellation,
    slot: &PageSlot<L::Page>,
    session: &mut PageSession,
    callback: ResponseCallback,
    activity: &NetworkActivity,
) -> Result<(), CaptureError> {
    cancel.check()?;
    let page = Arc::new(
        launcher
            .launch(options.viewport)
            .map_err(CaptureError::BrowserLaunch)?,
    );
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(page.clone());
    let page = PageGuard(page);
    cancel.check()?;
    page.on_response(callback)
        .map_err(|e| CaptureError::BrowserLaunch(e.context("could not attach response listener")))?;

    let url = session.target_url.clone();
    info!("navigating to {}", url);
    let started = Instant::now();
    match page.navigate(&url, options.navigation_timeout) {
        Ok(_) => {}
        Err(NavigationError::Timeout(timeout)) => {
            return Err(CaptureError::NavigationTimeout { url, timeout })
        }
        Err(NavigationError::Failed(source)) => {
            return Err(CaptureError::Navigation { url, source })
        }
    }
    wait_for_network_idle(activity, &url, options, started, cancel)?;
    cancel.check()?;

    session.advance(SessionStatus::Settling);
    settle(&*page, options);
    cancel.check()?;
    session.frozen_hooks = freeze(&*page);

    session.advance(SessionStatus::Extracting);
    let artifacts = extractor::extract(&*page);
    session.written = extractor::write_artifacts(&session.output_root, &artifacts);
    session.artifacts = artifacts;

    page.close();
    Ok(())
}

/// Blocks until no response has arrived for `network_idle`, within what is
/// left of the navigation budget.
fn wait_for_network_idle(
    activity: &NetworkActivity,
    url: &str,
    options: &DriverOptions,
    started: Instant,
    cancel: &Cancellation,
) -> Result<(), CaptureError> {
    loop {
        let quiet = activity.quiet_for();
        if quiet >= options.network_idle {
            debug!("network idle for {:?} on {}", quiet, url);
            return Ok(());
        }
        if started.elapsed() >= options.navigation_timeout {
            return Err(CaptureError::NavigationTimeout {
                url: url.to_string(),
                timeout: options.navigation_timeout,
            });
        }
        cancel.check()?;
        thread::sleep(NETWORK_IDLE_POLL.min(options.network_idle));
    }
}

fn settle<P: PageHandle + ?Sized>(page: &P, options: &DriverOptions) {
    debug!("scrolling....");
    match page.evaluate(
        &get_scroll_script(options.scroll_step, options.scroll_delay),
        true,
    ) {
        Ok(scrolled) => debug!("scrolling ended after {:?}px", scrolled),
        Err(e) => warn!("scrolling failed, lazy content may be missing: {:#}", e),
    }
    if !options.settle_delay.is_zero() {
        debug!("settling for {:?}", options.settle_delay);
        thread::sleep(options.settle_delay);
    }
}

fn freeze<P: PageHandle + ?Sized>(page: &P) -> Vec<String> {
    let fired = match page.evaluate(FREEZE_SCRIPT, false) {
        Ok(Some(Value::String(s))) => serde_json::from_str::<Vec<String>>(&s).unwrap_or_default(),
        Ok(_) => vec![],
        Err(e) => {
            debug!("animation freeze skipped: {:#}", e);
            vec![]
        }
    };
    if fired.is_empty() {
        debug!("no animation hooks to pause");
    } else {
        info!("paused animation hooks {:?}", fired);
    }
    fired
}
