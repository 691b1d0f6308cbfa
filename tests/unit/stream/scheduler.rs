use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;

use super::*;
use crate::foundation::clock::ManualClock;
use crate::j2c::{BuiltinEngine, J2cCodec, J2cConfig};
use crate::stream::decode::InlineDecoder;
use crate::stream::fetch::MemoryFetcher;

fn pattern(w: u32, h: u32, c: u8) -> PixelBuffer {
    let data: Vec<u8> = (0..w * h * c as u32).map(|i| (i * 7 % 251) as u8).collect();
    PixelBuffer::from_data(&data, w, h, c).unwrap()
}

fn j2c_bytes(raw: &PixelBuffer) -> Vec<u8> {
    let config = J2cConfig {
        reversible: true,
        ..J2cConfig::default()
    };
    let mut img = FormattedImage::new(Box::new(J2cCodec::with_engine(config, &BuiltinEngine)));
    img.encode(raw, None, Duration::ZERO).unwrap();
    img.take_data()
}

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let mut raw = PixelBuffer::with_size(w, h, 4).unwrap();
    raw.fill(Rgba8::new(10, 20, 30, 255)).unwrap();
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.encode(&raw, None, Duration::ZERO).unwrap();
    img.take_data()
}

struct Harness {
    list: TextureList,
    fetcher: MemoryFetcher,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(StreamingConfig::default())
    }

    fn with_config(config: StreamingConfig) -> Self {
        let fetcher = MemoryFetcher::new();
        let clock = ManualClock::new();
        let list = TextureList::with_clock(
            config,
            Box::new(fetcher.clone()),
            Box::new(InlineDecoder::new()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self {
            list,
            fetcher,
            clock,
        }
    }

    fn frame_after(&mut self, dt: Duration) -> UpdateStats {
        self.clock.advance(dt);
        self.list.update_images(Duration::from_millis(50))
    }

    fn frame(&mut self) -> UpdateStats {
        self.frame_after(Duration::from_millis(100))
    }

    fn load(&mut self, tex: &TextureRef) {
        for _ in 0..64 {
            if tex.discard_level() == Some(0) {
                return;
            }
            self.frame();
        }
        panic!("texture did not load: {tex:?}");
    }

    fn info(&self, tex: &TextureRef) -> TextureInfo {
        self.list.texture_info(tex.key()).unwrap()
    }
}

/// Fetcher that never answers and records what was asked of it.
#[derive(Clone, Default)]
struct StallFetcher {
    log: Arc<Mutex<(Vec<RequestId>, Vec<RequestId>, usize)>>,
}

impl TextureFetcher for StallFetcher {
    fn submit(&mut self, request: FetchRequest) {
        self.log.lock().unwrap().0.push(request.id);
    }

    fn cancel(&mut self, id: RequestId) {
        self.log.lock().unwrap().1.push(id);
    }

    fn cancel_all(&mut self) {
        self.log.lock().unwrap().2 += 1;
    }

    fn poll(&mut self, _max: usize) -> Vec<FetchEvent> {
        Vec::new()
    }

    fn pending(&self) -> usize {
        0
    }
}

fn stalled_list() -> (TextureList, StallFetcher, ManualClock) {
    let fetcher = StallFetcher::default();
    let clock = ManualClock::new();
    let list = TextureList::with_clock(
        StreamingConfig::default(),
        Box::new(fetcher.clone()),
        Box::new(InlineDecoder::new()),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (list, fetcher, clock)
}

#[test]
fn priority_key_orders_descending() {
    let mut keys = vec![PriorityKey(1.0), PriorityKey(-1.0), PriorityKey(50.0)];
    keys.sort();
    let values: Vec<f32> = keys.iter().map(|k| k.0).collect();
    assert_eq!(values, vec![50.0, 1.0, -1.0]);
}

#[test]
fn small_priority_changes_keep_their_slot() {
    assert!(!needs_resort(100.0, 110.0));
    assert!(!needs_resort(100.0, 81.0));
    assert!(needs_resort(100.0, 130.0));
    assert!(needs_resort(100.0, 70.0));
    assert!(needs_resort(0.0, 5.0));
    assert!(!needs_resort(0.0, 0.0));
}

#[test]
fn null_id_returns_default_texture() {
    let mut h = Harness::new();
    let tex = h.list.get_texture(TextureId::NULL, BoostLevel::None, None);
    assert!(tex.id().is_null());
    assert_eq!(tex.state(), TextureState::Ready);
    assert_eq!(tex.image().unwrap().width(), DEFAULT_TEXTURE_SIZE);
    assert!(h.list.is_empty());
}

#[test]
fn repeated_requests_share_one_entry() {
    let mut h = Harness::new();
    let a = h.list.get_texture(TextureId(7), BoostLevel::None, None);
    let b = h.list.get_texture(TextureId(7), BoostLevel::Preview, None);
    assert_eq!(a.key(), b.key());
    assert_eq!(a.boost(), BoostLevel::Preview);
    assert_eq!(h.list.len(), 1);

    let icon = h.list.get_texture(TextureId(7), BoostLevel::Icon, None);
    assert_eq!(icon.key().list, ListKind::Scale);
    assert_eq!(h.list.len(), 2);
    assert!(h.list.find(TextureKey::new(TextureId(7), ListKind::Scale)).is_some());
}

#[test]
fn streams_j2c_to_full_resolution() {
    let mut h = Harness::new();
    let src = pattern(64, 64, 4);
    h.fetcher
        .insert(TextureId(1), ImageCodec::J2c, j2c_bytes(&src));

    let tex = h.list.get_texture(TextureId(1), BoostLevel::None, None);
    tex.set_virtual_size(64.0 * 64.0);
    h.load(&tex);

    assert_eq!(tex.state(), TextureState::Ready);
    assert_eq!(tex.full_size(), (64, 64));
    assert_eq!(tex.image().unwrap().data(), src.data());

    let served = h.fetcher.served();
    assert_eq!(served[0].offset, 0);
    assert_eq!(served[0].max_bytes, Some(h.list.config().first_fetch_bytes));
    assert!(served.windows(2).all(|w| w[0].offset < w[1].offset));
    assert!(h.list.resident_bytes() >= src.data_size() as i64);
}

#[test]
fn small_virtual_size_stops_at_a_coarser_level() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(2), ImageCodec::J2c, j2c_bytes(&pattern(64, 64, 3)));
    let tex = h.list.get_texture(TextureId(2), BoostLevel::None, None);
    // A quarter of the side: two levels down.
    tex.set_virtual_size(16.0 * 16.0);
    for _ in 0..32 {
        h.frame();
    }
    assert_eq!(h.info(&tex).desired_discard, 2);
    let level = tex.discard_level().unwrap();
    assert!(level <= 2);
    assert!(level > 0);
}

#[test]
fn loaded_callback_fires_once() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(3), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(3), BoostLevel::None, None);
    tex.set_virtual_size(32.0 * 32.0);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tex.on_loaded(move |t, ok| {
        assert!(ok);
        assert!(t.image().is_some());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    h.load(&tex);
    for _ in 0..4 {
        h.frame();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let late = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&late);
    tex.on_loaded(move |_, ok| {
        assert!(ok);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_asset_uses_default_and_is_not_retried() {
    let mut h = Harness::new();
    let tex = h.list.get_texture(TextureId(404), BoostLevel::None, None);
    tex.set_virtual_size(1024.0);
    let failed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failed);
    tex.on_loaded(move |_, ok| {
        if !ok {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    for _ in 0..10 {
        h.frame();
    }
    assert_eq!(tex.state(), TextureState::Missing);
    assert_eq!(
        tex.image().unwrap().data(),
        h.list.default_texture().image().unwrap().data()
    );
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(h.fetcher.served().len(), 1);
    assert!(h.info(&tex).priority < 0.0);
}

#[test]
fn explicit_components_convert_decoded_images() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(5), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(5), BoostLevel::None, Some(3));
    tex.set_virtual_size(32.0 * 32.0);
    h.load(&tex);
    let image = tex.image().unwrap();
    assert_eq!(image.components(), 3);
    assert_eq!(image.data_size(), 32 * 32 * 3);
}

#[test]
fn ui_boost_loads_without_virtual_size() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(6), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(6), BoostLevel::Ui, None);
    assert!(h.info(&tex).priority > 0.0);
    h.load(&tex);
    assert_eq!(h.info(&tex).desired_discard, 0);

    let idle = h.list.get_texture(TextureId(8), BoostLevel::None, None);
    h.frame();
    assert_eq!(h.info(&idle).priority, 0.0);
    assert!(!h.info(&idle).fetch_in_flight);
}

#[test]
fn zero_priority_entry_is_evicted_then_deleted() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(9), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(9), BoostLevel::None, None);
    tex.set_virtual_size(32.0 * 32.0);
    h.load(&tex);
    assert!(h.info(&tex).formatted_bytes > 0);

    tex.set_virtual_size(0.0);
    h.frame_after(Duration::from_secs(10));
    assert_eq!(tex.state(), TextureState::Ready);

    let stats = h.frame_after(Duration::from_secs(25));
    assert_eq!(stats.evicted, 1);
    assert_eq!(tex.state(), TextureState::Evictable);
    assert_eq!(h.info(&tex).formatted_bytes, 0);
    assert!(tex.image().is_none());
    assert_eq!(h.list.resident_bytes(), 0);

    // Still held here, so it survives the delete timeout.
    h.frame_after(Duration::from_secs(61));
    assert_eq!(h.list.len(), 1);

    let key = tex.key();
    let observer = h.list.find(key).unwrap();
    drop(tex);
    drop(observer);
    let stats = h.frame_after(Duration::from_secs(1));
    assert_eq!(stats.deleted, 1);
    assert!(h.list.is_empty());
    assert!(h.list.texture_info(key).is_none());
}

#[test]
fn raising_priority_before_timeout_cancels_eviction() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(10), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(10), BoostLevel::None, None);
    tex.set_virtual_size(32.0 * 32.0);
    h.load(&tex);

    tex.set_virtual_size(0.0);
    h.frame_after(Duration::from_secs(20));
    tex.set_virtual_size(32.0 * 32.0);
    h.frame_after(Duration::from_secs(1));
    tex.set_virtual_size(0.0);
    h.frame_after(Duration::from_secs(20));

    assert_eq!(tex.state(), TextureState::Ready);
    assert!(h.info(&tex).formatted_bytes > 0);
}

#[test]
fn evicted_entry_comes_back_from_saved_raw() {
    let mut h = Harness::new();
    h.fetcher
        .insert(TextureId(11), ImageCodec::J2c, j2c_bytes(&pattern(32, 32, 4)));
    let tex = h.list.get_texture(TextureId(11), BoostLevel::None, None);
    tex.set_virtual_size(32.0 * 32.0);
    h.load(&tex);
    let before = tex.image().unwrap();

    tex.set_virtual_size(0.0);
    h.frame_after(Duration::from_secs(31));
    assert_eq!(tex.state(), TextureState::Evictable);

    tex.set_virtual_size(32.0 * 32.0);
    h.frame_after(Duration::from_secs(1));
    assert_eq!(tex.state(), TextureState::Ready);
    assert!(Arc::ptr_eq(&tex.image().unwrap(), &before));
    assert_eq!(tex.discard_level(), Some(0));
}

#[test]
fn zero_priority_cancels_outstanding_fetch() {
    let (mut list, fetcher, clock) = stalled_list();
    let tex = list.get_texture(TextureId(12), BoostLevel::None, None);
    tex.set_virtual_size(256.0);
    clock.advance(Duration::from_millis(100));
    list.update_images(Duration::from_millis(50));
    assert_eq!(tex.state(), TextureState::Fetching);
    assert!(list.texture_info(tex.key()).unwrap().fetch_in_flight);

    tex.set_virtual_size(0.0);
    clock.advance(Duration::from_millis(100));
    list.update_images(Duration::from_millis(50));

    let log = fetcher.log.lock().unwrap();
    assert_eq!(log.1, log.0);
    assert_eq!(tex.state(), TextureState::Unrequested);
    assert!(!list.texture_info(tex.key()).unwrap().fetch_in_flight);
}

#[test]
fn clear_fetching_requests_resets_entries() {
    let (mut list, fetcher, clock) = stalled_list();
    let a = list.get_texture(TextureId(13), BoostLevel::None, None);
    let b = list.get_texture(TextureId(14), BoostLevel::None, None);
    a.set_virtual_size(256.0);
    b.set_virtual_size(256.0);
    // The first frame has no interval and refreshes a single priority.
    for _ in 0..2 {
        clock.advance(Duration::from_secs(1));
        list.update_images(Duration::from_millis(50));
    }
    assert_eq!(fetcher.log.lock().unwrap().0.len(), 2);

    list.clear_fetching_requests();
    assert_eq!(fetcher.log.lock().unwrap().2, 1);
    for tex in [&a, &b] {
        assert_eq!(tex.state(), TextureState::Unrequested);
        assert!(!list.texture_info(tex.key()).unwrap().fetch_in_flight);
    }

    // Asked again on the next frame.
    clock.advance(Duration::from_secs(1));
    list.update_images(Duration::from_millis(50));
    assert_eq!(fetcher.log.lock().unwrap().0.len(), 4);
}

#[test]
fn force_immediate_update_requests_right_away() {
    let mut h = Harness::new();
    let tex = h.list.get_texture(TextureId(15), BoostLevel::None, None);
    assert!(h.fetcher.served().is_empty());
    h.list.force_immediate_update(&tex);
    assert_eq!(tex.state(), TextureState::Fetching);
    assert_eq!(h.info(&tex).priority, MAX_DECODE_PRIORITY);
    assert_eq!(h.fetcher.pending(), 1);
}

#[test]
fn decode_all_images_finishes_every_wanted_texture() {
    let mut h = Harness::new();
    let mut textures = Vec::new();
    for id in 20..24 {
        let src = pattern(32, 32, 4);
        h.fetcher.insert(TextureId(id), ImageCodec::J2c, j2c_bytes(&src));
        let tex = h.list.get_texture(TextureId(id), BoostLevel::None, None);
        tex.set_virtual_size(32.0 * 32.0);
        textures.push(tex);
    }
    let unwanted = h.list.get_texture(TextureId(30), BoostLevel::None, None);

    let stats = h.list.decode_all_images(Duration::from_secs(30));
    assert!(stats.decodes_started >= 4);
    for tex in &textures {
        assert_eq!(tex.discard_level(), Some(0));
    }
    assert_eq!(unwanted.state(), TextureState::Unrequested);
}

#[test]
fn priority_window_scales_with_frame_time() {
    let mut h = Harness::with_config(StreamingConfig {
        max_priority_updates: 2,
        ..StreamingConfig::default()
    });
    for id in 40..45 {
        h.list.get_texture(TextureId(id), BoostLevel::None, None);
    }
    // First frame has no interval: one entry.
    let stats = h.list.update_images(Duration::from_millis(50));
    assert_eq!(stats.priorities_updated, 1);
    let stats = h.frame_after(Duration::from_secs(1));
    assert_eq!(stats.priorities_updated, 2);
}

/// Clock that moves forward 1ms on every read, so any frame budget runs out mid-pass.
#[derive(Debug)]
struct TickingClock {
    now: Mutex<Instant>,
}

impl Clock for TickingClock {
    fn now(&self) -> Instant {
        let mut now = self.now.lock().unwrap();
        *now += Duration::from_millis(1);
        *now
    }
}

#[test]
fn round_robin_reaches_every_entry_under_a_tight_budget() {
    let config = StreamingConfig {
        high_priority_count: 1,
        min_medium_updates: 0,
        ..StreamingConfig::default()
    };
    let clock = TickingClock {
        now: Mutex::new(Instant::now()),
    };
    let mut list = TextureList::with_clock(
        config,
        Box::new(StallFetcher::default()),
        Box::new(InlineDecoder::new()),
        Arc::new(clock),
    )
    .unwrap();
    let textures: Vec<_> = (1..=10)
        .map(|id| list.get_texture(TextureId(id), BoostLevel::Ui, None))
        .collect();

    for _ in 0..200 {
        list.update_images(Duration::from_millis(2));
    }
    let fetching = textures
        .iter()
        .filter(|tex| list.texture_info(tex.key()).unwrap().fetch_in_flight)
        .count();
    assert_eq!(fetching, textures.len());
}

#[test]
fn over_budget_flushes_idle_entries() {
    let mut h = Harness::new();
    let mut textures = Vec::new();
    for id in 50..52 {
        h.fetcher.insert(TextureId(id), ImageCodec::Png, png_bytes(1024, 1024));
        let tex = h.list.get_texture(TextureId(id), BoostLevel::None, None);
        tex.set_virtual_size(1024.0 * 1024.0);
        textures.push(tex);
    }
    for tex in &textures {
        h.load(tex);
    }
    assert!(h.list.resident_bytes() > h.list.budget().max_resident_bytes());

    for tex in &textures {
        tex.set_virtual_size(0.0);
    }
    let stats = h.frame();
    assert_eq!(stats.evicted, 2);
    assert_eq!(h.list.resident_bytes(), 0);
    for tex in &textures {
        assert_eq!(tex.state(), TextureState::Evictable);
    }
}

#[test]
fn url_and_file_requests() {
    let mut h = Harness::new();
    let url = "http://example.invalid/tex/a.j2c";
    h.fetcher.insert(
        TextureId::from_url(url),
        ImageCodec::J2c,
        j2c_bytes(&pattern(16, 16, 3)),
    );
    let tex = h.list.get_texture_from_url(url, BoostLevel::None, None);
    assert_eq!(tex.id(), TextureId::from_url(url));
    tex.set_virtual_size(256.0);
    h.load(&tex);

    let missing = h.list.get_texture_from_file(
        &PathBuf::from("target/unit-stream/no-such-file.png"),
        BoostLevel::None,
        None,
    );
    assert!(missing.id().is_null());

    let dir = PathBuf::from("target").join("unit-stream").join("scheduler_file");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("tile.png");
    std::fs::write(&path, png_bytes(4, 4)).unwrap();
    let tex = h.list.get_texture_from_file(&path, BoostLevel::None, None);
    assert!(!tex.id().is_null());
    assert_eq!(tex.state(), TextureState::Unrequested);
    assert_eq!(h.list.len(), 2);
}
