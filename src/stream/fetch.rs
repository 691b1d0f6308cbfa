use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::entry::TextureId;
use crate::formatted::ImageCodec;
use crate::foundation::error::{TexError, TexResult};

/// Identifies one outstanding fetch or decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Where a texture's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Looked up by id.
    Asset,
    Url(String),
    File(PathBuf),
}

/// A byte-range request for one texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: RequestId,
    pub texture: TextureId,
    pub source: TextureSource,
    /// Bytes already held; the response continues from here.
    pub offset: usize,
    /// Bytes wanted past `offset`, `None` for the rest of the asset.
    pub max_bytes: Option<usize>,
}

/// Result of a fetch.
#[derive(Debug)]
pub enum FetchEvent {
    Data {
        id: RequestId,
        bytes: Vec<u8>,
        /// No bytes remain past this chunk.
        complete: bool,
        /// Codec the source declared, if any.
        codec: Option<ImageCodec>,
    },
    /// The asset does not exist. Not retried.
    Missing { id: RequestId },
    /// A transient failure. The scheduler may ask again.
    Failed { id: RequestId, error: TexError },
}

impl FetchEvent {
    pub fn request(&self) -> RequestId {
        match self {
            Self::Data { id, .. } | Self::Missing { id } | Self::Failed { id, .. } => *id,
        }
    }
}

/// Network/cache fetch service. Implementations must never block in any method.
pub trait TextureFetcher: Send {
    fn submit(&mut self, request: FetchRequest);

    /// Forget a request. Its result, if already produced, may still be returned by `poll`.
    fn cancel(&mut self, id: RequestId);

    fn cancel_all(&mut self);

    /// Up to `max` completed requests.
    fn poll(&mut self, max: usize) -> Vec<FetchEvent>;

    /// Requests not yet returned by `poll`.
    fn pending(&self) -> usize;
}

fn slice_response(
    id: RequestId,
    data: &[u8],
    offset: usize,
    max_bytes: Option<usize>,
    codec: Option<ImageCodec>,
) -> FetchEvent {
    let start = offset.min(data.len());
    let end = match max_bytes {
        Some(n) => start.saturating_add(n).min(data.len()),
        None => data.len(),
    };
    FetchEvent::Data {
        id,
        bytes: data[start..end].to_vec(),
        complete: end == data.len(),
        codec,
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    assets: HashMap<TextureId, (ImageCodec, Arc<[u8]>)>,
    queue: VecDeque<FetchRequest>,
    served: Vec<FetchRequest>,
}

/// Fetcher serving assets registered in memory. Clones share the same store, so a caller can
/// keep one to add assets after handing another to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the bytes served for `id`.
    pub fn insert(&self, id: TextureId, codec: ImageCodec, bytes: impl Into<Arc<[u8]>>) {
        self.store().assets.insert(id, (codec, bytes.into()));
    }

    pub fn remove(&self, id: TextureId) {
        self.store().assets.remove(&id);
    }

    /// Requests answered so far, oldest first.
    pub fn served(&self) -> Vec<FetchRequest> {
        self.store().served.clone()
    }
}

impl TextureFetcher for MemoryFetcher {
    fn submit(&mut self, request: FetchRequest) {
        self.store().queue.push_back(request);
    }

    fn cancel(&mut self, id: RequestId) {
        self.store().queue.retain(|r| r.id != id);
    }

    fn cancel_all(&mut self) {
        self.store().queue.clear();
    }

    fn poll(&mut self, max: usize) -> Vec<FetchEvent> {
        let mut store = self.store();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(req) = store.queue.pop_front() else {
                break;
            };
            let event = match store.assets.get(&req.texture) {
                Some((codec, data)) => {
                    slice_response(req.id, data, req.offset, req.max_bytes, Some(*codec))
                }
                None => FetchEvent::Missing { id: req.id },
            };
            store.served.push(req);
            out.push(event);
        }
        out
    }

    fn pending(&self) -> usize {
        self.store().queue.len()
    }
}

/// Extensions probed, in order, when an asset id is looked up in a directory.
const SEARCH_EXTENSIONS: &[&str] = &["j2c", "texture", "png", "tga", "bmp", "jpg", "dxt"];

/// Fetcher reading `<root>/<id>.<ext>` for asset ids, plus `file://` urls and plain paths.
///
/// Reads run on a dedicated rayon pool and come back over a channel, so `poll` only drains
/// finished results.
#[derive(Debug)]
pub struct DirectoryFetcher {
    root: Arc<PathBuf>,
    pool: rayon::ThreadPool,
    tx: Sender<FetchEvent>,
    rx: Receiver<FetchEvent>,
    /// Cancel flags of requests not yet returned by `poll`.
    requests: HashMap<RequestId, Arc<AtomicBool>>,
}

impl DirectoryFetcher {
    /// Fetcher with rayon's default thread count.
    pub fn new(root: impl Into<PathBuf>) -> TexResult<Self> {
        Self::with_threads(root, None)
    }

    pub fn with_threads(root: impl Into<PathBuf>, threads: Option<usize>) -> TexResult<Self> {
        if threads == Some(0) {
            return Err(TexError::config("fetch threads must be >= 1 when set"));
        }
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("texstream-fetch-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| TexError::config(format!("failed to build fetch thread pool: {e}")))?;
        let (tx, rx) = channel();
        Ok(Self {
            root: Arc::new(root.into()),
            pool,
            tx,
            rx,
            requests: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Block until a result arrives or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Option<FetchEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = self.rx.recv_timeout(left).ok()?;
            if self.requests.remove(&event.request()).is_some() {
                return Some(event);
            }
        }
    }
}

fn resolve(root: &Path, req: &FetchRequest) -> Option<PathBuf> {
    match &req.source {
        TextureSource::File(path) => Some(path.clone()),
        TextureSource::Url(url) => match url.strip_prefix("file://") {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                tracing::warn!(url, "directory fetcher only serves file:// urls");
                None
            }
        },
        TextureSource::Asset => SEARCH_EXTENSIONS
            .iter()
            .map(|ext| root.join(format!("{}.{ext}", req.texture)))
            .find(|p| p.is_file()),
    }
}

fn read_range(
    path: &Path,
    offset: usize,
    max_bytes: Option<usize>,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = Vec::new();
    match max_bytes {
        Some(n) => file.take(n as u64).read_to_end(&mut buf)?,
        None => file.read_to_end(&mut buf)?,
    };
    let complete = offset as u64 + buf.len() as u64 >= len;
    Ok((buf, complete))
}

fn serve(root: &Path, req: &FetchRequest) -> FetchEvent {
    let Some(path) = resolve(root, req) else {
        return FetchEvent::Missing { id: req.id };
    };
    match read_range(&path, req.offset, req.max_bytes) {
        Ok((bytes, complete)) => FetchEvent::Data {
            id: req.id,
            bytes,
            complete,
            codec: path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(ImageCodec::from_file_name),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FetchEvent::Missing { id: req.id },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "texture read failed");
            FetchEvent::Failed {
                id: req.id,
                error: TexError::Io(e),
            }
        }
    }
}

impl TextureFetcher for DirectoryFetcher {
    fn submit(&mut self, request: FetchRequest) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.requests.insert(request.id, Arc::clone(&cancel));
        let root = Arc::clone(&self.root);
        let tx = self.tx.clone();
        self.pool.spawn(move || {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            // The receiver only goes away with the pool itself.
            let _ = tx.send(serve(&root, &request));
        });
    }

    fn cancel(&mut self, id: RequestId) {
        if let Some(flag) = self.requests.remove(&id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn cancel_all(&mut self) {
        for (_, flag) in self.requests.drain() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn poll(&mut self, max: usize) -> Vec<FetchEvent> {
        let requests = &mut self.requests;
        self.rx
            .try_iter()
            .filter(|event| requests.remove(&event.request()).is_some())
            .take(max)
            .collect()
    }

    fn pending(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/fetch.rs"]
mod tests;
