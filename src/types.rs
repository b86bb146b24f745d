use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("browser_launch: {0:#}")]
    BrowserLaunch(#[source] anyhow::Error),
    #[error("navigation_timeout: {url} did not settle within {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },
    #[error("navigation: {url}: {source:#}")]
    Navigation {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no_resources: no files downloaded from {url}")]
    NoResources { url: String },
    #[error("cancelled")]
    Cancelled,
    #[error("session_timeout: capture exceeded {0:?}")]
    SessionTimeout(Duration),
    #[error("invalid_url: {0}")]
    InvalidUrl(String),
    #[error("output_dir: {0:#}")]
    OutputDir(#[source] anyhow::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal: {0}")]
    Internal(String),
}

/// Failure modes of a single navigation, as reported by a [`crate::browser_controller::PageHandle`].
#[derive(Error, Debug)]
pub enum NavigationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// What the caller of a full clone sees: either the page never made it to
/// disk, or it did and the archive step broke.
#[derive(Error, Debug)]
pub enum ClonerError {
    #[error("could not capture page: {0}")]
    Capture(#[from] CaptureError),
    #[error("captured but could not package: {0:#}")]
    Packaging(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Stylesheet,
    Script,
    Image,
    Font,
    Media,
    Document,
    /// xhr, fetch, websocket, ping and everything else the browser reports
    Other,
}

impl ResourceKind {
    pub fn is_renderable(&self) -> bool {
        !matches!(self, ResourceKind::Other)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Script => "script",
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
            ResourceKind::Media => "media",
            ResourceKind::Document => "document",
            ResourceKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Navigating,
    Settling,
    Extracting,
    Done,
    Failed,
}

/// A response that made it to disk. The payload itself is not kept in
/// memory once written, only its length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedResource {
    pub canonical_url: String,
    pub kind: ResourceKind,
    pub content_type: Option<String>,
    pub file_name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedArtifacts {
    pub rendered_html: Option<String>,
    pub dom_snapshot: Option<Value>,
    pub scroll_triggers: Vec<TriggerDescriptor>,
    pub gsap_tweens: Vec<TweenDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    #[serde(rename = "trigger", default)]
    pub trigger_ref: Option<String>,
    #[serde(default)]
    pub start: Option<Value>,
    #[serde(default)]
    pub end: Option<Value>,
    #[serde(default)]
    pub scrub: Option<Value>,
    #[serde(default)]
    pub pin: Option<Value>,
    #[serde(rename = "vars", default)]
    pub raw_config: Map<String, Value>,
}

impl TriggerDescriptor {
    /// `scrub` is either a boolean or a smoothing duration in seconds.
    pub fn is_scrubbed(&self) -> bool {
        is_truthy(self.scrub.as_ref())
    }

    /// `pin` is either a boolean or a reference to the pinned element.
    pub fn is_pinned(&self) -> bool {
        is_truthy(self.pin.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TweenDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "targets", default)]
    pub target_refs: Vec<String>,
    #[serde(rename = "duration", default)]
    pub duration_seconds: f64,
    #[serde(rename = "vars", default)]
    pub raw_config: Map<String, Value>,
}

fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub path: std::path::PathBuf,
    pub entries: usize,
    pub size: u64,
}

/// Shape of the response the remote tool wrapper hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text {
        text: String,
    },
    ResourceLink {
        uri: String,
        name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        description: String,
    },
}

impl ToolResult {
    pub fn error(message: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }
}
