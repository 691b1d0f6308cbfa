use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

fn key(id: u64) -> TextureKey {
    TextureKey::new(TextureId(id), ListKind::Standard)
}

#[test]
fn url_ids_are_stable_and_never_null() {
    let a = TextureId::from_url("http://example.invalid/a.png");
    assert_eq!(a, TextureId::from_url("http://example.invalid/a.png"));
    assert_ne!(a, TextureId::from_url("http://example.invalid/b.png"));
    assert!(!a.is_null());
    assert!(TextureId::NULL.is_null());
    assert_eq!(TextureId(0xab).to_string(), "00000000000000ab");
}

#[test]
fn keys_order_by_id_then_list() {
    let mut keys = vec![
        TextureKey::new(TextureId(2), ListKind::Standard),
        TextureKey::new(TextureId(1), ListKind::Scale),
        TextureKey::new(TextureId(1), ListKind::Standard),
    ];
    keys.sort();
    assert_eq!(keys[0], TextureKey::new(TextureId(1), ListKind::Standard));
    assert_eq!(keys[1], TextureKey::new(TextureId(1), ListKind::Scale));
}

#[test]
fn boost_classes() {
    assert_eq!(BoostLevel::Icon.list_kind(), ListKind::Scale);
    assert_eq!(BoostLevel::Ui.list_kind(), ListKind::Standard);
    assert!(BoostLevel::Ui.never_discard());
    assert!(!BoostLevel::Selected.never_discard());
    assert!(BoostLevel::Icon.rank() > BoostLevel::None.rank());

    let tex = TextureRef::new(key(1), BoostLevel::Preview, None);
    tex.set_boost(BoostLevel::Selected);
    assert_eq!(tex.boost(), BoostLevel::Preview);
    tex.set_boost(BoostLevel::Ui);
    assert_eq!(tex.boost(), BoostLevel::Ui);
}

#[test]
fn texture_stats_keep_largest_area() {
    let tex = TextureRef::new(key(1), BoostLevel::None, None);
    tex.add_texture_stats(100.0);
    tex.add_texture_stats(40.0);
    assert_eq!(tex.virtual_size(), 100.0);
    tex.set_virtual_size(-5.0);
    assert_eq!(tex.virtual_size(), 0.0);
}

#[test]
fn external_refs_count_clones() {
    let tex = TextureRef::new(key(1), BoostLevel::None, None);
    assert_eq!(tex.external_refs(), 0);
    let held = tex.clone();
    assert_eq!(tex.external_refs(), 1);
    drop(held);
    assert_eq!(tex.external_refs(), 0);
}

#[test]
fn loaded_callbacks_fire_once() {
    let tex = TextureRef::new(key(7), BoostLevel::None, None);
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    tex.on_loaded(move |t, ok| {
        assert!(ok);
        assert_eq!(t.id(), TextureId(7));
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let cbs = tex.finish_loading(true);
    tex.run_callbacks(cbs, true);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(tex.finish_loading(true).is_empty());

    // Late registration runs immediately.
    let h = Arc::clone(&hits);
    tex.on_loaded(move |_, _| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn preloaded_texture_is_ready() {
    let image = Arc::new(PixelBuffer::with_size(4, 4, 3).unwrap());
    let tex = TextureRef::preloaded(key(0), image);
    assert_eq!(tex.state(), TextureState::Ready);
    assert_eq!(tex.full_size(), (4, 4));
    assert_eq!(tex.discard_level(), Some(0));
    assert!(tex.image().is_some());
}
