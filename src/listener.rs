use futures::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    browser_controller::{RawResponse, ResponseCallback},
    classifier::{canonical_url, classify, disambiguate, precheck, Classification},
    types::{CapturedResource, ResourceKind},
};

pub const DEFAULT_WRITE_CONCURRENCY: usize = 16;
const CHANNEL_CAPACITY: usize = 256;

/// A response whose body has been read and is waiting to be persisted.
#[derive(Debug)]
pub struct ResourceEvent {
    pub url: String,
    pub canonical_url: String,
    pub kind: ResourceKind,
    pub status: u32,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CaptureLedger {
    pub resources: Vec<CapturedResource>,
    pub seen_urls: HashSet<String>,
}

/// Time of the last response event seen by a listener, used to decide when
/// the network has gone quiet.
#[derive(Debug)]
pub struct NetworkActivity {
    origin: Instant,
    // millis since `origin`
    last_event: AtomicU64,
}

impl NetworkActivity {
    pub fn new() -> Self {
        NetworkActivity {
            origin: Instant::now(),
            last_event: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_event.fetch_max(now, Ordering::Relaxed);
    }

    /// How long it has been since the last event, or since creation when
    /// nothing arrived yet.
    pub fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_event.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for NetworkActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SessionIndex {
    seen: HashSet<String>,
    // file name -> canonical url that owns it
    names: HashMap<String, String>,
    // derived names claimed by more than one url
    collided: HashSet<String>,
}

impl SessionIndex {
    /// Reserves `canonical` and returns the name to write under, or `None` if
    /// the URL was already claimed.
    fn claim(&mut self, canonical: &str, file_name: String) -> Option<String> {
        if !self.seen.insert(canonical.to_string()) {
            return None;
        }
        let name = match self.names.get(&file_name) {
            Some(owner) if owner != canonical => {
                let name = disambiguate(&file_name, canonical);
                self.collided.insert(file_name);
                name
            }
            _ => file_name,
        };
        self.names.insert(name.clone(), canonical.to_string());
        Some(name)
    }

    fn release(&mut self, canonical: &str, file_name: &str) {
        self.seen.remove(canonical);
        if self.names.get(file_name).map(String::as_str) == Some(canonical) {
            self.names.remove(file_name);
        }
    }

    /// Collided names still held unprefixed by their first claimant, with
    /// the prefixed name that claimant moves to. Afterwards every url
    /// involved in a collision carries its own prefix, whatever the arrival
    /// order was.
    fn take_collisions(&mut self) -> Vec<(String, String)> {
        let mut moves = vec![];
        for base in std::mem::take(&mut self.collided) {
            if let Some(owner) = self.names.remove(&base) {
                let target = disambiguate(&base, &owner);
                self.names.insert(target.clone(), owner);
                moves.push((base, target));
            }
        }
        moves.sort();
        moves
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collects the responses of one page load into `assets_dir`.
///
/// Producers (the browser's event threads) push through [`ResponseListener::callback`];
/// one sink task consumes the channel and writes with bounded concurrency.
pub struct ResponseListener {
    tx: Arc<Mutex<Option<mpsc::Sender<ResourceEvent>>>>,
    index: Arc<Mutex<SessionIndex>>,
    captured: Arc<Mutex<Vec<CapturedResource>>>,
    activity: Arc<NetworkActivity>,
    assets_dir: PathBuf,
    sink: JoinHandle<()>,
}

impl ResponseListener {
    /// Must be called from within a tokio runtime.
    pub fn spawn(assets_dir: PathBuf, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::channel::<ResourceEvent>(CHANNEL_CAPACITY);
        let index = Arc::new(Mutex::new(SessionIndex::default()));
        let captured = Arc::new(Mutex::new(vec![]));

        let sink_index = index.clone();
        let sink_captured = captured.clone();
        let sink_dir = assets_dir.clone();
        let concurrency = concurrency.max(1);
        let sink = tokio::spawn(async move {
            tokio_stream::wrappers::ReceiverStream::new(rx)
                .for_each_concurrent(concurrency, |event| {
                    let index = sink_index.clone();
                    let captured = sink_captured.clone();
                    let assets_dir = sink_dir.clone();
                    async move {
                        if let Some(resource) = persist(&assets_dir, &index, event).await {
                            lock(&captured).push(resource);
                        }
                    }
                })
                .await;
        });

        ResponseListener {
            tx: Arc::new(Mutex::new(Some(tx))),
            index,
            captured,
            activity: Arc::new(NetworkActivity::new()),
            assets_dir,
            sink,
        }
    }

    pub fn activity(&self) -> Arc<NetworkActivity> {
        self.activity.clone()
    }

    /// The callback to hand to the page. It is blocking and must not be
    /// invoked from inside an async task.
    pub fn callback(&self) -> ResponseCallback {
        let tx = self.tx.clone();
        let index = self.index.clone();
        let activity = self.activity.clone();
        Arc::new(move |response: RawResponse<'_>| {
            activity.touch();
            if let Err(r) = precheck(response.kind, response.status) {
                debug!("skipping {} ({:?})", response.url, r);
                return;
            }
            let canonical = match canonical_url(&response.url) {
                Some(u) => u,
                None => {
                    debug!("skipping non absolute url {}", response.url);
                    return;
                }
            };
            if lock(&index).seen.contains(&canonical) {
                debug!("already captured {}", canonical);
                return;
            }
            let bytes = match (response.body)() {
                Ok(b) => b,
                Err(e) => {
                    warn!("could not read body of {}: {:#}", response.url, e);
                    return;
                }
            };
            let sender = match lock(&tx).clone() {
                Some(s) => s,
                None => {
                    debug!("listener closed, dropping {}", canonical);
                    return;
                }
            };
            let event = ResourceEvent {
                url: response.url,
                canonical_url: canonical,
                kind: response.kind,
                status: response.status,
                content_type: response.content_type,
                bytes,
            };
            if let Err(e) = sender.blocking_send(event) {
                debug!("response sink is gone, dropping {}", e.0.canonical_url);
            }
        })
    }

    /// Stops accepting events, waits for in-flight writes and returns what
    /// was persisted.
    pub async fn finish(self) -> CaptureLedger {
        lock(&self.tx).take();
        if let Err(e) = self.sink.await {
            error!("response sink failed: {}", e);
        }
        let mut resources = std::mem::take(&mut *lock(&self.captured));
        let moves = lock(&self.index).take_collisions();
        for (from, to) in moves {
            let src = self.assets_dir.join(&from);
            let dst = self.assets_dir.join(&to);
            match tokio::fs::rename(&src, &dst).await {
                Ok(_) => {
                    debug!("renamed colliding {} to {}", from, to);
                    for r in resources.iter_mut().filter(|r| r.file_name == from) {
                        r.file_name = to.clone();
                    }
                }
                Err(e) => warn!("could not rename {:?} to {:?}: {}", src, dst, e),
            }
        }
        resources.sort_by(|a, b| a.canonical_url.cmp(&b.canonical_url));
        let seen_urls = std::mem::take(&mut lock(&self.index).seen);
        CaptureLedger {
            resources,
            seen_urls,
        }
    }
}

async fn persist(
    assets_dir: &Path,
    index: &Mutex<SessionIndex>,
    event: ResourceEvent,
) -> Option<CapturedResource> {
    let classification = classify(
        &event.canonical_url,
        event.kind,
        event.status,
        event.content_type.as_deref(),
        &event.bytes,
    );
    let file_name = match classification {
        Classification::Accept { file_name } => file_name,
        Classification::Reject(r) => {
            debug!("skipping {} ({:?})", event.url, r);
            return None;
        }
    };

    let claimed = lock(index).claim(&event.canonical_url, file_name);
    let file_name = match claimed {
        Some(n) => n,
        None => {
            debug!("already captured {}", event.canonical_url);
            return None;
        }
    };

    let path = assets_dir.join(&file_name);
    if let Err(e) = tokio::fs::write(&path, &event.bytes).await {
        warn!("could not write {} to {:?}: {}", event.url, path, e);
        lock(index).release(&event.canonical_url, &file_name);
        return None;
    }
    debug!("saved {} as {}", event.canonical_url, file_name);

    Some(CapturedResource {
        canonical_url: event.canonical_url,
        kind: event.kind,
        content_type: event.content_type,
        file_name,
        size: event.bytes.len(),
    })
}
