use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use smallvec::SmallVec;

use super::arena::{Arena, Handle};
use super::config::{StreamingConfig, frame_window};
use super::decode::{DecodeOutcome, DecodePool, DecodeRequest, DecodeResult, DecodeService};
use super::entry::{
    BoostLevel, ListKind, LoadedCallback, TextureId, TextureKey, TextureRef, TextureState,
};
use super::fetch::{FetchEvent, FetchRequest, RequestId, TextureFetcher, TextureSource};
use crate::formatted::{FormattedImage, ImageCodec};
use crate::foundation::clock::{Clock, Deadline, SystemClock};
use crate::foundation::error::TexResult;
use crate::foundation::memory::{self, HostMemory, TextureMemoryBudget};
use crate::j2c::MAX_DISCARD_LEVEL;
use crate::raw::{MAX_IMAGE_SIZE, PixelBuffer, Rgba8};

/// Upper bound of a computed decode priority.
pub const MAX_DECODE_PRIORITY: f32 = 2_000_000.0;

const DISCARD_WEIGHT: f32 = 100_000.0;
const BOOST_WEIGHT: f32 = 1_000.0;
/// Priority changes inside this ratio band do not move an entry in the priority index.
const RESORT_BAND: (f32, f32) = (0.8, 1.25);
const DEFAULT_TEXTURE_SIZE: u32 = 8;

/// Priority index key: descending by value, so iteration starts at the most urgent entry.
#[derive(Debug, Clone, Copy)]
struct PriorityKey(f32);

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.total_cmp(&self.0)
    }
}

fn needs_resort(old: f32, new: f32) -> bool {
    if old <= 0.0 || new <= 0.0 {
        return old != new;
    }
    let ratio = new / old;
    ratio < RESORT_BAND.0 || ratio > RESORT_BAND.1
}

#[derive(Debug)]
struct DecodeTicket {
    id: RequestId,
    cancel: Arc<AtomicBool>,
    /// Compressed bytes handed to the decoder.
    bytes: usize,
}

#[derive(Debug)]
struct SavedRaw {
    image: Arc<PixelBuffer>,
    discard_level: Option<u8>,
    since: Instant,
}

enum Step {
    Fetch { offset: usize, max_bytes: Option<usize> },
    Decode(u8),
    Idle,
}

#[derive(Debug)]
struct Entry {
    tex: TextureRef,
    source: TextureSource,
    /// Codec guessed from the source name, used until the fetcher declares one.
    codec_hint: Option<ImageCodec>,
    /// `None` before the first bytes arrive and while the image travels with a decode.
    formatted: Option<FormattedImage>,
    fetch: Option<RequestId>,
    decode: Option<DecodeTicket>,
    fetch_complete: bool,
    /// Byte count of the last finished decode. Equal to the current count means more bytes
    /// are needed before decoding again.
    decoded_bytes: Option<usize>,
    /// Value stored in the priority index.
    priority: f32,
    desired_discard: u8,
    max_discard: u8,
    last_referenced: Instant,
    saved_raw: Option<SavedRaw>,
    gl_bytes: i64,
}

impl Entry {
    fn progressive(&self) -> bool {
        match &self.formatted {
            Some(img) => img.codec() == ImageCodec::J2c,
            None => self.codec_hint.is_none_or(|c| c == ImageCodec::J2c),
        }
    }

    fn compute_desired_discard(&self) -> u8 {
        let (w, h) = self.tex.full_size();
        if w == 0 || h == 0 {
            return 0;
        }
        let mut min_level = 0u8;
        while (w >> min_level) > MAX_IMAGE_SIZE || (h >> min_level) > MAX_IMAGE_SIZE {
            min_level += 1;
        }
        let max_level = self.max_discard.max(min_level);
        if self.tex.boost().never_discard() {
            return min_level;
        }
        let vsize = self.tex.virtual_size();
        if vsize <= 0.0 {
            return max_level;
        }
        // Each discard level quarters the area.
        let level = ((w as f32 * h as f32 / vsize).log2() / 2.0).floor();
        let level = if level.is_finite() && level > 0.0 {
            level.min(u8::MAX as f32) as u8
        } else {
            0
        };
        level.clamp(min_level, max_level)
    }

    fn compute_priority(&self) -> f32 {
        let state = self.tex.state();
        if matches!(state, TextureState::Missing | TextureState::Deleted) {
            return -1.0;
        }
        let boost = self.tex.boost();
        let vsize = self.tex.virtual_size();
        if vsize <= 0.0 && boost == BoostLevel::None {
            return 0.0;
        }
        let bonus = boost.rank() as f32 * BOOST_WEIGHT;
        let current = self
            .tex
            .discard_level()
            .map_or(self.max_discard as i32 + 1, i32::from);
        let ddiscard = current - self.desired_discard as i32;
        if ddiscard <= 0 {
            return 1.0 + bonus;
        }
        (ddiscard as f32 * DISCARD_WEIGHT + vsize.sqrt() + bonus).min(MAX_DECODE_PRIORITY)
    }

    fn is_satisfied(&self) -> bool {
        self.tex
            .discard_level()
            .is_some_and(|level| level <= self.desired_discard)
    }

    fn first_request(&self, first_fetch_bytes: usize, have: usize) -> Step {
        let max_bytes = self
            .progressive()
            .then(|| first_fetch_bytes.saturating_sub(have).max(1));
        Step::Fetch {
            offset: have,
            max_bytes,
        }
    }

    fn next_step(&mut self, first_fetch_bytes: usize) -> Step {
        let desired = self.desired_discard;
        let complete = self.fetch_complete;
        let decoded_bytes = self.decoded_bytes;
        let Some(img) = self.formatted.as_mut() else {
            return self.first_request(first_fetch_bytes, 0);
        };
        let have = img.data_size();
        if have == 0 || img.width() == 0 {
            if complete {
                return Step::Idle;
            }
            return self.first_request(first_fetch_bytes, have);
        }
        let stalled = decoded_bytes == Some(have);

        if img.codec() != ImageCodec::J2c {
            return match (complete, stalled) {
                (true, true) => Step::Idle,
                (true, false) => Step::Decode(desired),
                (false, _) => Step::Fetch {
                    offset: have,
                    max_bytes: None,
                },
            };
        }

        if !stalled
            && (complete
                || img
                    .calc_discard_level_bytes(have)
                    .is_some_and(|level| level <= desired))
        {
            return Step::Decode(desired);
        }
        if complete {
            return Step::Idle;
        }
        let needed = img.calc_data_size(desired);
        let wanted = if stalled { needed.max(have * 2) } else { needed };
        Step::Fetch {
            offset: have,
            max_bytes: Some(wanted.saturating_sub(have).max(1)),
        }
    }

    /// State to fall back to once no request is outstanding.
    fn idle_state(&self) -> TextureState {
        if self.tex.image().is_some() {
            TextureState::Ready
        } else {
            TextureState::Unrequested
        }
    }
}

/// Per-frame counters returned by [`TextureList::update_images`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStats {
    /// Fetch events applied, stale ones included.
    pub fetch_results: usize,
    /// Decode results applied, stale ones included.
    pub decode_results: usize,
    /// Entries whose priority was recomputed.
    pub priorities_updated: usize,
    pub fetches_started: usize,
    pub decodes_started: usize,
    /// Entries that dropped their bytes and became evictable.
    pub evicted: usize,
    /// Entries removed from the list.
    pub deleted: usize,
}

/// Snapshot of one entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureInfo {
    pub state: TextureState,
    /// Priority as stored in the priority index.
    pub priority: f32,
    /// Discard level the entry is streaming toward.
    pub desired_discard: u8,
    /// Discard level of the image currently shown, `None` before the first decode.
    pub discard_level: Option<u8>,
    /// Compressed bytes held, including bytes travelling with a decode.
    pub formatted_bytes: usize,
    /// Full-resolution size from the header, `(0, 0)` while unknown.
    pub full_size: (u32, u32),
    pub fetch_in_flight: bool,
    pub decode_in_flight: bool,
}

type PendingCallbacks = Vec<(TextureRef, Vec<LoadedCallback>, bool)>;

/// Known-texture set and the per-frame streaming scheduler.
///
/// Entries live in one arena. `by_key` orders them by id for round-robin passes and lookups;
/// `by_priority` orders them by decode priority. Both are updated together on every insert and
/// removal.
pub struct TextureList {
    config: StreamingConfig,
    clock: Arc<dyn Clock>,
    arena: Arena<Entry>,
    by_key: BTreeMap<TextureKey, Handle>,
    by_priority: BTreeSet<(PriorityKey, Handle)>,
    fetcher: Box<dyn TextureFetcher>,
    decoder: Box<dyn DecodeService>,
    next_request: u64,
    fetch_requests: HashMap<RequestId, Handle>,
    decode_requests: HashMap<RequestId, Handle>,
    missing: HashSet<TextureKey>,
    last_update_key: Option<TextureKey>,
    last_fetch_key: Option<TextureKey>,
    last_frame: Option<Instant>,
    default_texture: TextureRef,
    budget: TextureMemoryBudget,
    resident_bytes: i64,
    callbacks: PendingCallbacks,
    stats: UpdateStats,
}

impl std::fmt::Debug for TextureList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureList")
            .field("entries", &self.arena.len())
            .field("fetches", &self.fetch_requests.len())
            .field("decodes", &self.decode_requests.len())
            .field("resident_bytes", &self.resident_bytes)
            .finish()
    }
}

impl TextureList {
    /// Scheduler driven by the wall clock.
    pub fn new(
        config: StreamingConfig,
        fetcher: Box<dyn TextureFetcher>,
        decoder: Box<dyn DecodeService>,
    ) -> TexResult<Self> {
        Self::with_clock(config, fetcher, decoder, Arc::new(SystemClock))
    }

    /// Scheduler decoding on a [`DecodePool`] sized by `config.decode_threads`.
    pub fn with_decode_pool(
        config: StreamingConfig,
        fetcher: Box<dyn TextureFetcher>,
    ) -> TexResult<Self> {
        let pool = DecodePool::new(config.decode_threads)?;
        Self::new(config, fetcher, Box::new(pool))
    }

    /// Scheduler reading time from `clock`. Fails when `config` does not validate.
    pub fn with_clock(
        config: StreamingConfig,
        fetcher: Box<dyn TextureFetcher>,
        decoder: Box<dyn DecodeService>,
        clock: Arc<dyn Clock>,
    ) -> TexResult<Self> {
        config.validate()?;
        let mut grey = PixelBuffer::with_size(DEFAULT_TEXTURE_SIZE, DEFAULT_TEXTURE_SIZE, 3)?;
        grey.fill(Rgba8::new(128, 128, 128, 255))?;
        let default_texture = TextureRef::preloaded(
            TextureKey::new(TextureId::NULL, ListKind::Standard),
            Arc::new(grey),
        );
        let budget = TextureMemoryBudget::derive(HostMemory::default(), &config.memory, 0);
        Ok(Self {
            config,
            clock,
            arena: Arena::default(),
            by_key: BTreeMap::new(),
            by_priority: BTreeSet::new(),
            fetcher,
            decoder,
            next_request: 1,
            fetch_requests: HashMap::new(),
            decode_requests: HashMap::new(),
            missing: HashSet::new(),
            last_update_key: None,
            last_fetch_key: None,
            last_frame: None,
            default_texture,
            budget,
            resident_bytes: 0,
            callbacks: Vec::new(),
            stats: UpdateStats::default(),
        })
    }

    /// Settings the list was built with.
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Re-derive the memory budget after hardware detection.
    pub fn set_host_memory(&mut self, host: HostMemory, requested_mb: i64) {
        self.budget = TextureMemoryBudget::derive(host, &self.config.memory, requested_mb);
    }

    /// Current texture memory budget.
    pub fn budget(&self) -> TextureMemoryBudget {
        self.budget
    }

    /// Decoded bytes held by this list's entries.
    pub fn resident_bytes(&self) -> i64 {
        self.resident_bytes
    }

    /// Stand-in for null ids and missing assets.
    pub fn default_texture(&self) -> TextureRef {
        self.default_texture.clone()
    }

    /// Entries tracked, in every state.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// True when no entry is tracked.
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Existing entry for `key`, without creating one.
    pub fn find(&self, key: TextureKey) -> Option<TextureRef> {
        let handle = self.by_key.get(&key)?;
        self.arena.get(*handle).map(|e| e.tex.clone())
    }

    /// Bookkeeping snapshot of the entry for `key`.
    pub fn texture_info(&self, key: TextureKey) -> Option<TextureInfo> {
        let e = self.by_key.get(&key).and_then(|h| self.arena.get(*h))?;
        let formatted_bytes = match (&e.formatted, &e.decode) {
            (Some(img), _) => img.data_size(),
            (None, Some(ticket)) => ticket.bytes,
            (None, None) => 0,
        };
        Some(TextureInfo {
            state: e.tex.state(),
            priority: e.priority,
            desired_discard: e.desired_discard,
            discard_level: e.tex.discard_level(),
            formatted_bytes,
            full_size: e.tex.full_size(),
            fetch_in_flight: e.fetch.is_some(),
            decode_in_flight: e.decode.is_some(),
        })
    }

    /// Request an asset texture. Null ids return the default texture.
    pub fn get_texture(
        &mut self,
        id: TextureId,
        boost: BoostLevel,
        components: Option<u8>,
    ) -> TextureRef {
        if id.is_null() {
            return self.default_texture();
        }
        self.get_or_insert(id, TextureSource::Asset, None, boost, components)
    }

    /// Request a texture addressed by url. Its id is the url's hash.
    pub fn get_texture_from_url(
        &mut self,
        url: &str,
        boost: BoostLevel,
        components: Option<u8>,
    ) -> TextureRef {
        let hint = ImageCodec::from_file_name(url);
        let source = TextureSource::Url(url.to_owned());
        self.get_or_insert(TextureId::from_url(url), source, hint, boost, components)
    }

    /// Request a texture from a local file. A missing file yields the default texture.
    pub fn get_texture_from_file(
        &mut self,
        path: &Path,
        boost: BoostLevel,
        components: Option<u8>,
    ) -> TextureRef {
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "texture file not found");
            return self.default_texture();
        }
        let hint = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ImageCodec::from_file_name);
        let id = TextureId::from_url(&format!("file://{}", path.display()));
        let source = TextureSource::File(path.to_path_buf());
        self.get_or_insert(id, source, hint, boost, components)
    }

    fn get_or_insert(
        &mut self,
        id: TextureId,
        source: TextureSource,
        codec_hint: Option<ImageCodec>,
        boost: BoostLevel,
        components: Option<u8>,
    ) -> TextureRef {
        let key = TextureKey::new(id, boost.list_kind());
        if let Some(tex) = self.find(key) {
            tex.set_boost(boost);
            return tex;
        }

        let tex = TextureRef::new(key, boost, components);
        if self.missing.contains(&key) {
            tex.set_image(self.default_texture.image(), Some(0));
            tex.set_state(TextureState::Missing);
            // Already reported once; later callbacks fire immediately.
            drop(tex.finish_loading(false));
        }
        let mut entry = Entry {
            tex: tex.clone(),
            source,
            codec_hint,
            formatted: None,
            fetch: None,
            decode: None,
            fetch_complete: false,
            decoded_bytes: None,
            priority: 0.0,
            desired_discard: 0,
            max_discard: MAX_DISCARD_LEVEL,
            last_referenced: self.clock.now(),
            saved_raw: None,
            gl_bytes: 0,
        };
        entry.desired_discard = entry.compute_desired_discard();
        entry.priority = entry.compute_priority();
        let priority = entry.priority;
        let handle = self.arena.insert(entry);
        self.by_key.insert(key, handle);
        self.by_priority.insert((PriorityKey(priority), handle));
        tracing::debug!(id = %id, list = ?key.list, ?boost, "texture added");
        tex
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    /// Run one frame of streaming work: apply finished fetches and decodes, recompute a window of
    /// priorities, evict idle entries and start new requests, spending at most `max_time` on the
    /// request pass once the minimum window has been serviced.
    #[tracing::instrument(skip(self), fields(entries = self.arena.len()))]
    pub fn update_images(&mut self, max_time: Duration) -> UpdateStats {
        self.stats = UpdateStats::default();
        let now = self.clock.now();
        let interval = self
            .last_frame
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.last_frame = Some(now);
        let deadline = Deadline::new(now, Some(max_time));

        self.poll_services();
        self.update_priorities(interval, now);
        self.flush_over_budget(now);
        self.update_fetch(interval, &deadline);
        self.run_callbacks();

        let snapshot = memory::global().snapshot();
        tracing::debug!(
            resident = self.resident_bytes,
            max_resident = self.budget.max_resident_bytes(),
            formatted = snapshot.formatted_bytes,
            raw = snapshot.raw_bytes,
            fetches = self.fetch_requests.len(),
            decodes = self.decode_requests.len(),
            "texture memory"
        );
        self.stats
    }

    /// Give `tex` top priority and service it right away.
    pub fn force_immediate_update(&mut self, tex: &TextureRef) {
        let Some(&handle) = self.by_key.get(&tex.key()) else {
            return;
        };
        let now = self.clock.now();
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        e.desired_discard = e.compute_desired_discard();
        e.last_referenced = now;
        let old = e.priority;
        e.priority = MAX_DECODE_PRIORITY;
        self.by_priority.remove(&(PriorityKey(old), handle));
        self.by_priority
            .insert((PriorityKey(MAX_DECODE_PRIORITY), handle));
        if tex.state() == TextureState::Evictable {
            self.revive(handle);
        }
        self.service(handle);
    }

    /// Cancel every outstanding fetch. Entries fall back to their idle state and are requested
    /// again by later frames.
    pub fn clear_fetching_requests(&mut self) {
        self.fetcher.cancel_all();
        for (_, handle) in self.fetch_requests.drain() {
            if let Some(e) = self.arena.get_mut(handle) {
                e.fetch = None;
                e.tex.set_state(e.idle_state());
            }
        }
        tracing::info!("cleared all texture fetch requests");
    }

    /// Fetch and decode every wanted texture until nothing is left to do or `max_time` passes.
    pub fn decode_all_images(&mut self, max_time: Duration) -> UpdateStats {
        self.stats = UpdateStats::default();
        let deadline = Deadline::new(Instant::now(), Some(max_time));
        let handles: Vec<Handle> = self.by_key.values().copied().collect();
        for handle in &handles {
            self.refresh_priority(*handle);
        }
        loop {
            let progressed = self.poll_services();
            let order: Vec<Handle> = self.by_priority.iter().map(|(_, h)| *h).collect();
            let started = order.into_iter().filter(|h| self.service(*h)).count();
            self.run_callbacks();
            if started == 0
                && self.fetcher.pending() == 0
                && self.decoder.pending() == 0
                && self.fetch_requests.is_empty()
                && self.decode_requests.is_empty()
            {
                break;
            }
            if deadline.expired() {
                tracing::warn!(
                    fetches = self.fetch_requests.len(),
                    decodes = self.decode_requests.len(),
                    "decode_all_images ran out of time"
                );
                break;
            }
            if started == 0 && progressed == 0 {
                std::thread::yield_now();
            }
        }
        self.stats
    }

    fn poll_services(&mut self) -> usize {
        let fetched = self.fetcher.poll(self.config.max_fetch_results);
        let decoded = self.decoder.poll(self.config.max_decode_results);
        let n = fetched.len() + decoded.len();
        for event in fetched {
            self.apply_fetch(event);
        }
        for result in decoded {
            self.apply_decode(result);
        }
        n
    }

    fn round_robin(
        &self,
        after: Option<TextureKey>,
        count: usize,
    ) -> SmallVec<[(TextureKey, Handle); 64]> {
        let tail = self
            .by_key
            .range((after.map_or(Bound::Unbounded, Bound::Excluded), Bound::Unbounded));
        tail.chain(self.by_key.iter())
            .take(count.min(self.by_key.len()))
            .map(|(k, h)| (*k, *h))
            .collect()
    }

    /// Recompute desired discard and priority, moving the entry in the priority index when the
    /// change is large enough. Returns the fresh priority.
    fn refresh_priority(&mut self, handle: Handle) -> f32 {
        let Some(e) = self.arena.get_mut(handle) else {
            return 0.0;
        };
        e.desired_discard = e.compute_desired_discard();
        let fresh = e.compute_priority();
        if needs_resort(e.priority, fresh) {
            self.by_priority.remove(&(PriorityKey(e.priority), handle));
            self.by_priority.insert((PriorityKey(fresh), handle));
            e.priority = fresh;
        }
        fresh
    }

    fn update_priorities(&mut self, interval: Duration, now: Instant) {
        let window = frame_window(self.config.max_priority_updates, interval);
        let batch = self.round_robin(self.last_update_key, window);
        if let Some((key, _)) = batch.last() {
            self.last_update_key = Some(*key);
        }
        for (_, handle) in batch {
            self.update_entry(handle, now);
            self.stats.priorities_updated += 1;
        }
    }

    fn update_entry(&mut self, handle: Handle, now: Instant) {
        let saved_raw_timeout = self.config.saved_raw_timeout();
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if let Some(saved) = &e.saved_raw
            && now.saturating_duration_since(saved.since) > saved_raw_timeout
        {
            e.saved_raw = None;
        }

        let priority = self.refresh_priority(handle);
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if priority > 0.0 {
            e.last_referenced = now;
            if e.tex.state() == TextureState::Evictable {
                self.revive(handle);
            }
            return;
        }

        let idle = now.saturating_duration_since(e.last_referenced);
        let never_discard = e.tex.boost().never_discard();
        self.cancel_requests(handle);
        let Some(e) = self.arena.get(handle) else {
            return;
        };
        let state = e.tex.state();
        if !never_discard
            && idle > self.config.flush_timeout()
            && matches!(state, TextureState::Ready | TextureState::Unrequested)
        {
            self.evict(handle, now);
        }
        let Some(e) = self.arena.get(handle) else {
            return;
        };
        if matches!(
            e.tex.state(),
            TextureState::Evictable | TextureState::Missing
        ) && e.tex.external_refs() == 0
            && idle > self.config.delete_timeout()
        {
            self.remove_entry(handle);
        }
    }

    /// Over the resident budget, flush the lowest-priority idle entries right away.
    fn flush_over_budget(&mut self, now: Instant) {
        if self.resident_bytes <= self.budget.max_resident_bytes() {
            return;
        }
        let victims: SmallVec<[Handle; 64]> = self
            .by_priority
            .iter()
            .rev()
            .take_while(|(p, _)| p.0 <= 0.0)
            .filter(|(_, h)| {
                self.arena.get(*h).is_some_and(|e| {
                    e.decode.is_none()
                        && e.tex.state() == TextureState::Ready
                        && !e.tex.boost().never_discard()
                })
            })
            .take(self.config.max_flush_per_frame)
            .map(|(_, h)| *h)
            .collect();
        tracing::debug!(
            resident = self.resident_bytes,
            victims = victims.len(),
            "over texture budget"
        );
        for handle in victims {
            self.cancel_requests(handle);
            self.evict(handle, now);
        }
    }

    fn update_fetch(&mut self, interval: Duration, deadline: &Deadline) {
        let len = self.by_key.len();
        if len == 0 {
            return;
        }
        let high = frame_window(self.config.high_priority_count, interval).min(len);
        let medium = frame_window(self.config.max_medium_updates, interval);
        let min_count = self.config.min_medium_updates.min(len - high);

        let top: SmallVec<[Handle; 64]> =
            self.by_priority.iter().take(high).map(|(_, h)| *h).collect();
        for &handle in &top {
            self.service(handle);
        }

        // The cursor only moves past entries actually visited, so a window cut short by the
        // deadline resumes where it stopped on the next frame. At least one entry is visited per
        // frame.
        let window = self.round_robin(self.last_fetch_key, medium);
        let mut visited = 0usize;
        let mut serviced = 0usize;
        for (key, handle) in window {
            if visited > 0 && serviced >= min_count && deadline.expired_at(self.clock.now()) {
                break;
            }
            visited += 1;
            self.last_fetch_key = Some(key);
            if top.contains(&handle) {
                continue;
            }
            if self.config.skip_low_priority
                && let Some(e) = self.arena.get(handle)
                && e.priority <= 0.0
                && e.fetch.is_none()
                && e.decode.is_none()
            {
                continue;
            }
            self.service(handle);
            serviced += 1;
        }
    }

    /// Start the next fetch or decode an entry needs. Returns whether a request was submitted.
    fn service(&mut self, handle: Handle) -> bool {
        let first_fetch_bytes = self.config.first_fetch_bytes;
        let Some(e) = self.arena.get_mut(handle) else {
            return false;
        };
        if e.fetch.is_some()
            || e.decode.is_some()
            || e.priority <= 0.0
            || !matches!(
                e.tex.state(),
                TextureState::Unrequested | TextureState::Ready
            )
            || e.is_satisfied()
        {
            return false;
        }
        match e.next_step(first_fetch_bytes) {
            Step::Fetch { offset, max_bytes } => self.start_fetch(handle, offset, max_bytes),
            Step::Decode(level) => self.start_decode(handle, level),
            Step::Idle => false,
        }
    }

    fn start_fetch(&mut self, handle: Handle, offset: usize, max_bytes: Option<usize>) -> bool {
        let id = self.next_request_id();
        let Some(e) = self.arena.get_mut(handle) else {
            return false;
        };
        let request = FetchRequest {
            id,
            texture: e.tex.id(),
            source: e.source.clone(),
            offset,
            max_bytes,
        };
        e.fetch = Some(id);
        e.tex.set_state(TextureState::Fetching);
        tracing::debug!(id = %request.texture, offset, ?max_bytes, "fetch submitted");
        self.fetch_requests.insert(id, handle);
        self.fetcher.submit(request);
        self.stats.fetches_started += 1;
        true
    }

    fn start_decode(&mut self, handle: Handle, discard_level: u8) -> bool {
        let id = self.next_request_id();
        let slice = self.config.decode_slice();
        let Some(e) = self.arena.get_mut(handle) else {
            return false;
        };
        let Some(image) = e.formatted.take() else {
            return false;
        };
        let cancel = Arc::new(AtomicBool::new(false));
        e.decode = Some(DecodeTicket {
            id,
            cancel: Arc::clone(&cancel),
            bytes: image.data_size(),
        });
        e.tex.set_state(TextureState::Decoding);
        let key = e.tex.key();
        tracing::debug!(id = %key.id, discard_level, "decode submitted");
        self.decode_requests.insert(id, handle);
        self.decoder.submit(DecodeRequest {
            id,
            key,
            image,
            discard_level,
            slice,
            cancel,
        });
        self.stats.decodes_started += 1;
        true
    }

    fn new_formatted(&self, codec: Option<ImageCodec>) -> FormattedImage {
        match codec {
            Some(ImageCodec::J2c) | None => FormattedImage::create_j2c(self.config.j2c),
            Some(other) => FormattedImage::create_from_type(other),
        }
    }

    fn apply_fetch(&mut self, event: FetchEvent) {
        self.stats.fetch_results += 1;
        let id = event.request();
        let Some(handle) = self.fetch_requests.remove(&id) else {
            tracing::debug!(request = id.0, "dropping stale fetch result");
            return;
        };
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if e.fetch != Some(id) {
            return;
        }
        e.fetch = None;

        match event {
            FetchEvent::Data {
                bytes,
                complete,
                codec,
                ..
            } => {
                let codec = codec.or(e.codec_hint);
                if e.formatted.is_none() {
                    let img = self.new_formatted(codec);
                    if let Some(e) = self.arena.get_mut(handle) {
                        e.formatted = Some(img);
                    }
                }
                let Some(e) = self.arena.get_mut(handle) else {
                    return;
                };
                let Some(img) = e.formatted.as_mut() else {
                    return;
                };
                img.append_data(&bytes);
                e.fetch_complete = complete;
                match img.update_data() {
                    Ok(()) => {
                        e.tex.set_full_size(img.width(), img.height());
                        e.max_discard = if img.codec() == ImageCodec::J2c {
                            MAX_DISCARD_LEVEL
                        } else if img.codec() == ImageCodec::Dxt {
                            img.max_discard_level()
                        } else {
                            0
                        };
                        e.tex.set_state(e.idle_state());
                    }
                    Err(err) if complete => {
                        tracing::warn!(id = %e.tex.id(), error = %err, "unreadable texture data");
                        self.mark_missing(handle);
                    }
                    Err(_) => e.tex.set_state(e.idle_state()),
                }
            }
            FetchEvent::Missing { .. } => {
                tracing::info!(id = %e.tex.id(), "texture asset missing");
                self.mark_missing(handle);
            }
            FetchEvent::Failed { error, .. } => {
                tracing::warn!(id = %e.tex.id(), error = %error, "texture fetch failed");
                e.tex.set_state(e.idle_state());
            }
        }
    }

    fn apply_decode(&mut self, result: DecodeResult) {
        self.stats.decode_results += 1;
        let Some(handle) = self.decode_requests.remove(&result.id) else {
            tracing::debug!(request = result.id.0, "dropping stale decode result");
            return;
        };
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        let Some(ticket) = e.decode.take_if(|t| t.id == result.id) else {
            return;
        };
        e.formatted = Some(result.image);

        match result.outcome {
            DecodeOutcome::Decoded(raw) => {
                e.decoded_bytes = Some(ticket.bytes);
                let raw = convert_components(raw, e.tex.explicit_components());
                let bytes = raw.data_size() as i64;
                let delta = bytes - e.gl_bytes;
                e.gl_bytes = bytes;
                self.resident_bytes += delta;
                memory::global().add_gl(delta);
                let level = e.formatted.as_ref().and_then(|img| img.discard_level());
                e.tex.set_image(Some(Arc::new(raw)), level);
                e.saved_raw = None;
                e.tex.set_state(TextureState::Ready);
                tracing::debug!(id = %e.tex.id(), ?level, "texture decoded");
                // Loaded once the wanted resolution is reached or no more bytes will come.
                if e.is_satisfied() || e.fetch_complete {
                    let callbacks = e.tex.finish_loading(true);
                    if !callbacks.is_empty() {
                        self.callbacks.push((e.tex.clone(), callbacks, true));
                    }
                }
            }
            DecodeOutcome::Cancelled => e.tex.set_state(e.idle_state()),
            DecodeOutcome::Failed(err) => {
                e.decoded_bytes = Some(ticket.bytes);
                if e.fetch_complete {
                    tracing::warn!(id = %e.tex.id(), error = %err, "texture decode failed");
                    self.mark_missing(handle);
                } else {
                    tracing::debug!(id = %e.tex.id(), error = %err, "partial decode failed");
                    e.tex.set_state(e.idle_state());
                }
            }
        }
    }

    fn mark_missing(&mut self, handle: Handle) {
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if let Some(ticket) = &e.decode {
            ticket.cancel.store(true, Ordering::Relaxed);
        }
        e.formatted = None;
        e.fetch_complete = false;
        e.saved_raw = None;
        self.resident_bytes -= e.gl_bytes;
        memory::global().add_gl(-e.gl_bytes);
        e.gl_bytes = 0;
        e.tex.set_image(self.default_texture.image(), Some(0));
        e.tex.set_state(TextureState::Missing);
        self.missing.insert(e.tex.key());
        let callbacks = e.tex.finish_loading(false);
        if !callbacks.is_empty() {
            self.callbacks.push((e.tex.clone(), callbacks, false));
        }
    }

    /// Cancel the entry's outstanding fetch and flag its decode as unwanted.
    fn cancel_requests(&mut self, handle: Handle) {
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if let Some(id) = e.fetch.take() {
            self.fetcher.cancel(id);
            self.fetch_requests.remove(&id);
            e.tex.set_state(e.idle_state());
        }
        if let Some(ticket) = &e.decode {
            ticket.cancel.store(true, Ordering::Relaxed);
        }
    }

    fn evict(&mut self, handle: Handle, now: Instant) {
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        if e.decode.is_some() {
            return;
        }
        if let Some(img) = e.formatted.as_mut() {
            img.delete_data();
        }
        e.fetch_complete = false;
        e.decoded_bytes = None;
        if let Some(image) = e.tex.image() {
            e.saved_raw = Some(SavedRaw {
                image,
                discard_level: e.tex.discard_level(),
                since: now,
            });
        }
        e.tex.set_image(None, None);
        self.resident_bytes -= e.gl_bytes;
        memory::global().add_gl(-e.gl_bytes);
        e.gl_bytes = 0;
        e.tex.set_state(TextureState::Evictable);
        self.stats.evicted += 1;
        tracing::debug!(id = %e.tex.id(), "texture evicted");
    }

    fn revive(&mut self, handle: Handle) {
        let Some(e) = self.arena.get_mut(handle) else {
            return;
        };
        match e.saved_raw.take() {
            Some(saved) => {
                let bytes = saved.image.data_size() as i64;
                e.gl_bytes = bytes;
                self.resident_bytes += bytes;
                memory::global().add_gl(bytes);
                e.tex.set_image(Some(saved.image), saved.discard_level);
                e.tex.set_state(TextureState::Ready);
            }
            None => e.tex.set_state(TextureState::Unrequested),
        }
        tracing::debug!(id = %e.tex.id(), "evicted texture back in use");
    }

    fn remove_entry(&mut self, handle: Handle) {
        let Some(e) = self.arena.remove(handle) else {
            return;
        };
        self.by_key.remove(&e.tex.key());
        self.by_priority.remove(&(PriorityKey(e.priority), handle));
        if let Some(id) = e.fetch {
            self.fetcher.cancel(id);
            self.fetch_requests.remove(&id);
        }
        if let Some(ticket) = &e.decode {
            ticket.cancel.store(true, Ordering::Relaxed);
            self.decode_requests.remove(&ticket.id);
        }
        self.resident_bytes -= e.gl_bytes;
        memory::global().add_gl(-e.gl_bytes);
        e.tex.set_image(None, None);
        e.tex.set_state(TextureState::Deleted);
        self.stats.deleted += 1;
        tracing::debug!(id = %e.tex.id(), "texture deleted");
    }

    fn run_callbacks(&mut self) {
        for (tex, callbacks, ok) in std::mem::take(&mut self.callbacks) {
            tex.run_callbacks(callbacks, ok);
        }
    }
}

/// Convert a decoded image to the requested component count (3 or 4 only).
fn convert_components(raw: PixelBuffer, wanted: Option<u8>) -> PixelBuffer {
    let Some(c) = wanted else {
        return raw;
    };
    if c == raw.components() || !matches!(c, 3 | 4) || !matches!(raw.components(), 3 | 4) {
        return raw;
    }
    let converted = PixelBuffer::with_size(raw.width(), raw.height(), c).and_then(|mut out| {
        out.copy_from(&raw)?;
        Ok(out)
    });
    match converted {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, components = c, "component conversion failed");
            raw
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/scheduler.rs"]
mod tests;
