use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use headless_chrome::protocol::cdp::Network::events::ResponseReceivedEventParams;
use headless_chrome::protocol::cdp::Network::{GetResponseBodyReturnObject, ResourceType};
use headless_chrome::protocol::cdp::DOMSnapshot;
use headless_chrome::{browser::default_executable, Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::types::{NavigationError, ResourceKind};

const RESPONSE_HANDLER_NAME: &str = "site-cloner";

// computed styles kept in the DOM snapshot
const SNAPSHOT_STYLES: [&str; 18] = [
    "display",
    "position",
    "top",
    "left",
    "width",
    "height",
    "margin",
    "padding",
    "color",
    "background-color",
    "font-family",
    "font-size",
    "font-weight",
    "opacity",
    "transform",
    "z-index",
    "visibility",
    "overflow",
];

/// One network response as seen by the page. `body` asks the browser for the
/// payload and should only be called once the response is worth keeping.
pub struct RawResponse<'a> {
    pub url: String,
    pub kind: ResourceKind,
    pub status: u32,
    pub content_type: Option<String>,
    pub body: &'a dyn Fn() -> Result<Vec<u8>>,
}

pub type ResponseCallback = Arc<dyn Fn(RawResponse<'_>) + Send + Sync>;

/// Starts a browser and hands back a single page in it. Dropping or closing
/// the page must release the browser.
pub trait Launcher: Send + Sync + 'static {
    type Page: PageHandle + Send + Sync + 'static;

    fn launch(&self, viewport: (u32, u32)) -> Result<Self::Page>;
}

/// Blocking control surface of one page.
pub trait PageHandle {
    fn on_response(&self, callback: ResponseCallback) -> Result<()>;

    /// Navigates and waits for the document to finish loading, failing with
    /// [`NavigationError::Timeout`] past `timeout`. Network quiescence is
    /// waited for by the caller.
    fn navigate(&self, url: &str, timeout: Duration) -> Result<(), NavigationError>;

    /// Evaluates `script` in the page and returns its value when it is
    /// serializable.
    fn evaluate(&self, script: &str, await_promise: bool) -> Result<Option<Value>>;

    fn content(&self) -> Result<String>;

    fn dom_snapshot(&self) -> Result<Value>;

    /// Idempotent.
    fn close(&self);
}

pub struct ChromeLauncher {
    path: Option<PathBuf>,
    idle_timeout: Duration,
    call_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(path: Option<PathBuf>, call_timeout: Duration) -> Self {
        ChromeLauncher {
            path,
            // the browser must outlive the slowest single call we make
            idle_timeout: call_timeout + Duration::from_secs(60),
            call_timeout,
        }
    }
}

impl Launcher for ChromeLauncher {
    type Page = ChromePage;

    fn launch(&self, viewport: (u32, u32)) -> Result<ChromePage> {
        let controller = BrowserController::new(self.path.clone(), viewport, self.idle_timeout)?;
        let tab = controller.open_tab(self.call_timeout)?;
        Ok(ChromePage {
            controller,
            tab,
            closed: AtomicBool::new(false),
        })
    }
}

pub struct BrowserController {
    browser: Browser,
}

impl BrowserController {
    pub fn new(path: Option<PathBuf>, viewport: (u32, u32), idle_timeout: Duration) -> Result<Self> {
        let is_docker = std::env::var("IN_DOCKER").is_ok();
        let path = match path {
            Some(p) => p,
            None => default_executable().map_err(|e| anyhow!("no chrome binary found: {}", e))?,
        };
        debug!("launching chrome from {:?} with viewport {:?}", path, viewport);
        let options = LaunchOptions::default_builder()
            .path(Some(path))
            .window_size(Some(viewport))
            .idle_browser_timeout(idle_timeout)
            // warning only do this if in docker env
            .sandbox(!is_docker)
            .build()
            .map_err(|e| anyhow!("invalid launch options: {}", e))?;
        let browser = Browser::new(options).context("browser launching error")?;

        Ok(BrowserController { browser })
    }

    pub fn open_tab(&self, call_timeout: Duration) -> Result<Arc<Tab>> {
        // we create a new incognito window (no context)
        let ctx = self
            .browser
            .new_context()
            .context("could not create incognito context")?;
        let tab = ctx.new_tab().context("could not create new tab")?;
        tab.set_default_timeout(call_timeout);
        Ok(tab)
    }

    pub fn kill(&self) -> bool {
        let pid = match self.browser.get_process_id() {
            Some(pid) => Pid::from_u32(pid),
            None => return false,
        };
        let mut s = System::new();
        if !s.refresh_process(pid) {
            return false;
        }
        if let Some(process) = s.process(pid) {
            debug!("killing chrome process with id {}", pid);
            return process.kill();
        }
        false
    }
}

impl Drop for BrowserController {
    fn drop(&mut self) {
        debug!("killing browser process...");
        self.kill();
    }
}

pub struct ChromePage {
    controller: BrowserController,
    tab: Arc<Tab>,
    closed: AtomicBool,
}

fn resource_kind(rt: &ResourceType) -> ResourceKind {
    match rt {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Media => ResourceKind::Media,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Script => ResourceKind::Script,
        _ => ResourceKind::Other,
    }
}

/// The `Content-Type` response header, whatever its case. Falls back to the
/// mime type Chrome sniffed when the header is missing.
pub fn content_type(headers: &Value, mime_type: &str) -> Option<String> {
    let header = headers.as_object().and_then(|h| {
        h.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, v)| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    });
    match header {
        Some(v) => Some(v.to_string()),
        None if !mime_type.is_empty() => Some(mime_type.to_string()),
        None => None,
    }
}

pub fn decode_body(body: String, base64_encoded: bool) -> Result<Vec<u8>> {
    if base64_encoded {
        return STANDARD
            .decode(body.as_bytes())
            .context("response body is not valid base64");
    }
    Ok(body.into_bytes())
}

impl PageHandle for ChromePage {
    fn on_response(&self, callback: ResponseCallback) -> Result<()> {
        self.tab
            .register_response_handling(
                RESPONSE_HANDLER_NAME,
                Box::new(
                    move |params: ResponseReceivedEventParams,
                          fetch_body: &dyn Fn() -> Result<GetResponseBodyReturnObject>| {
                        let body = || -> Result<Vec<u8>> {
                            let b = fetch_body()?;
                            decode_body(b.body, b.base_64_encoded)
                        };
                        let headers =
                            serde_json::to_value(&params.response.headers).unwrap_or(Value::Null);
                        let content_type =
                            content_type(&headers, &params.response.mime_type);
                        callback(RawResponse {
                            url: params.response.url.clone(),
                            kind: resource_kind(&params.Type),
                            status: params.response.status as u32,
                            content_type,
                            body: &body,
                        });
                    },
                ),
            )
            .context("could not register response handler")?;
        Ok(())
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<(), NavigationError> {
        let started = Instant::now();
        self.tab
            .navigate_to(url)
            .context(format!("could not navigate to {}", url))?;
        match self.tab.wait_until_navigated() {
            Ok(_) => Ok(()),
            Err(_) if started.elapsed() >= timeout => Err(NavigationError::Timeout(timeout)),
            Err(e) => Err(e.context("error waiting for navigation").into()),
        }
    }

    fn evaluate(&self, script: &str, await_promise: bool) -> Result<Option<Value>> {
        let result = self
            .tab
            .evaluate(script, await_promise)
            .context("script evaluation failed")?;
        Ok(result.value)
    }

    fn content(&self) -> Result<String> {
        self.tab.get_content().context("could not read page content")
    }

    fn dom_snapshot(&self) -> Result<Value> {
        let snapshot = self
            .tab
            .call_method(DOMSnapshot::CaptureSnapshot {
                computed_styles: SNAPSHOT_STYLES.iter().map(|s| s.to_string()).collect(),
                include_paint_order: Some(true),
                include_dom_rects: Some(true),
                include_blended_background_colors: None,
                include_text_color_opacities: None,
            })
            .context("DOMSnapshot.captureSnapshot failed")?;
        serde_json::to_value(&snapshot).context("could not serialize dom snapshot")
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.tab.close(false) {
            debug!("could not close tab cleanly: {}", e);
        }
        self.controller.kill();
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        self.close();
    }
}
