//! Progressive texture streaming.
//!
//! [`TextureList`] tracks every known texture and, once per frame, decides which ones get bytes
//! fetched, which get decoded and to what discard level, and which are evicted. Fetching and
//! decoding happen behind the [`TextureFetcher`] and [`DecodeService`] traits; callers read
//! results through [`TextureRef`] handles.

mod arena;
mod config;
mod decode;
mod entry;
mod fetch;
mod scheduler;

pub use config::{StreamingConfig, frame_window};
pub use decode::{
    DecodeOutcome, DecodePool, DecodeRequest, DecodeResult, DecodeService, InlineDecoder,
    run_decode,
};
pub use entry::{
    BoostLevel, ListKind, LoadedCallback, TextureId, TextureKey, TextureRef, TextureState,
};
pub use fetch::{
    DirectoryFetcher, FetchEvent, FetchRequest, MemoryFetcher, RequestId, TextureFetcher,
    TextureSource,
};
pub use scheduler::{MAX_DECODE_PRIORITY, TextureInfo, TextureList, UpdateStats};
