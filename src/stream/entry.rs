use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::raw::PixelBuffer;

const URL_ID_SEED: u64 = 0x5f3c_9d1e_a7b2_4c60;

/// Texture asset id. `0` is the null id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureId(pub u64);

impl TextureId {
    /// Id that never names an asset; requests for it get the default texture.
    pub const NULL: Self = Self(0);

    /// True for [`Self::NULL`].
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Stable id for a url-addressed texture. Never returns the null id.
    pub fn from_url(url: &str) -> Self {
        Self(xxh3_64_with_seed(url.as_bytes(), URL_ID_SEED).max(1))
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Which list an entry lives in. The same id can be tracked once per list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    /// Scene and UI textures.
    Standard,
    /// Icons drawn at a fixed small size.
    Scale,
}

/// Lookup key of a streaming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    pub id: TextureId,
    /// List the entry was requested through.
    pub list: ListKind,
}

impl TextureKey {
    /// Key for `id` in `list`.
    pub fn new(id: TextureId, list: ListKind) -> Self {
        Self { id, list }
    }
}

/// Externally assigned priority class, ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BoostLevel {
    #[default]
    None,
    Selected,
    AvatarBaked,
    Preview,
    Ui,
    Icon,
}

impl BoostLevel {
    /// List an entry with this boost is filed under.
    pub fn list_kind(self) -> ListKind {
        match self {
            Self::Icon => ListKind::Scale,
            _ => ListKind::Standard,
        }
    }

    /// Always decode at full resolution and never evict for inactivity.
    pub fn never_discard(self) -> bool {
        matches!(self, Self::Ui | Self::Icon)
    }

    pub(crate) fn rank(self) -> u8 {
        self as u8
    }
}

/// Lifecycle of a streaming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureState {
    /// Known but nothing requested yet.
    Unrequested,
    /// Waiting for bytes.
    Fetching,
    /// A decode is in flight.
    Decoding,
    /// A decoded image is available.
    Ready,
    /// Compressed bytes were dropped for inactivity.
    Evictable,
    /// Removed from the scheduler.
    Deleted,
    /// The asset does not exist or cannot be decoded; the default texture stands in.
    Missing,
}

/// Callback run once when a texture finishes loading. The flag is `false` when it went missing.
pub type LoadedCallback = Box<dyn FnOnce(&TextureRef, bool) + Send>;

struct Status {
    image: Option<Arc<PixelBuffer>>,
    discard_level: Option<u8>,
    full_size: (u32, u32),
    state: TextureState,
    boost: BoostLevel,
    virtual_size: f32,
    loaded: Option<bool>,
    callbacks: Vec<LoadedCallback>,
}

struct Shared {
    key: TextureKey,
    components: Option<u8>,
    status: Mutex<Status>,
}

/// Shared handle to a streamed texture.
///
/// The scheduler keeps one clone per entry; every other clone marks the texture as externally
/// referenced, which blocks its deletion.
#[derive(Clone)]
pub struct TextureRef {
    inner: Arc<Shared>,
}

impl fmt::Debug for TextureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("TextureRef")
            .field("key", &self.inner.key)
            .field("state", &status.state)
            .field("discard_level", &status.discard_level)
            .finish()
    }
}

impl TextureRef {
    pub(crate) fn new(key: TextureKey, boost: BoostLevel, components: Option<u8>) -> Self {
        Self {
            inner: Arc::new(Shared {
                key,
                components,
                status: Mutex::new(Status {
                    image: None,
                    discard_level: None,
                    full_size: (0, 0),
                    state: TextureState::Unrequested,
                    boost,
                    virtual_size: 0.0,
                    loaded: None,
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    /// A texture that is permanently loaded with `image`.
    pub(crate) fn preloaded(key: TextureKey, image: Arc<PixelBuffer>) -> Self {
        let tex = Self::new(key, BoostLevel::Ui, None);
        {
            let mut status = tex.status();
            status.full_size = (image.width(), image.height());
            status.image = Some(image);
            status.discard_level = Some(0);
            status.state = TextureState::Ready;
            status.loaded = Some(true);
        }
        tex
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> TextureKey {
        self.inner.key
    }

    pub fn id(&self) -> TextureId {
        self.inner.key.id
    }

    /// Component count decoded images are converted to, if one was requested.
    pub fn explicit_components(&self) -> Option<u8> {
        self.inner.components
    }

    /// Current best image.
    pub fn image(&self) -> Option<Arc<PixelBuffer>> {
        self.status().image.clone()
    }

    /// Discard level of [`Self::image`].
    pub fn discard_level(&self) -> Option<u8> {
        self.status().discard_level
    }

    /// Full-resolution size from the header, `(0, 0)` until known.
    pub fn full_size(&self) -> (u32, u32) {
        self.status().full_size
    }

    pub fn state(&self) -> TextureState {
        self.status().state
    }

    pub fn boost(&self) -> BoostLevel {
        self.status().boost
    }

    /// Raise the boost class. Lower classes are ignored.
    pub fn set_boost(&self, boost: BoostLevel) {
        let mut status = self.status();
        status.boost = status.boost.max(boost);
    }

    /// On-screen pixel area the renderer wants this texture at. Zero means unused.
    pub fn virtual_size(&self) -> f32 {
        self.status().virtual_size
    }

    pub fn set_virtual_size(&self, pixels: f32) {
        self.status().virtual_size = pixels.max(0.0);
    }

    /// Report one more on-screen use; the largest area wins.
    pub fn add_texture_stats(&self, pixels: f32) {
        let mut status = self.status();
        status.virtual_size = status.virtual_size.max(pixels);
    }

    /// Other holders besides the scheduler.
    pub fn external_refs(&self) -> usize {
        Arc::strong_count(&self.inner).saturating_sub(1)
    }

    /// Run `callback` once loading finishes, or right away if it already has.
    pub fn on_loaded(&self, callback: impl FnOnce(&TextureRef, bool) + Send + 'static) {
        let mut status = self.status();
        let Some(ok) = status.loaded else {
            status.callbacks.push(Box::new(callback));
            return;
        };
        drop(status);
        callback(self, ok);
    }

    pub(crate) fn set_state(&self, state: TextureState) {
        self.status().state = state;
    }

    pub(crate) fn set_full_size(&self, width: u32, height: u32) {
        self.status().full_size = (width, height);
    }

    pub(crate) fn set_image(&self, image: Option<Arc<PixelBuffer>>, discard_level: Option<u8>) {
        let mut status = self.status();
        status.image = image;
        status.discard_level = discard_level;
    }

    /// Record the load result and hand back the callbacks to run. Only the first call returns
    /// any.
    pub(crate) fn finish_loading(&self, ok: bool) -> Vec<LoadedCallback> {
        let mut status = self.status();
        if status.loaded.is_some() {
            return Vec::new();
        }
        status.loaded = Some(ok);
        std::mem::take(&mut status.callbacks)
    }

    /// Run callbacks returned by [`Self::finish_loading`] without holding the status lock.
    pub(crate) fn run_callbacks(&self, callbacks: Vec<LoadedCallback>, ok: bool) {
        for cb in callbacks {
            cb(self, ok);
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/entry.rs"]
mod tests;
