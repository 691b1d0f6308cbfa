#![forbid(unsafe_code)]

pub mod formatted;
pub mod foundation;
pub mod j2c;
pub mod raw;
pub mod stream;

pub use formatted::{DecodeStatus, FormattedCodec, FormattedImage, ImageCodec};
pub use foundation::clock::{Clock, Deadline, ManualClock, SystemClock};
pub use foundation::error::{TexError, TexResult};
pub use foundation::memory::{HostMemory, MemoryConfig, MemorySnapshot, TextureMemoryBudget};
pub use j2c::{EnginePreference, J2cCodec, J2cConfig};
pub use raw::{PixelBuffer, Rgba8};
pub use stream::{
    BoostLevel, DecodePool, DirectoryFetcher, InlineDecoder, MemoryFetcher, StreamingConfig,
    TextureId, TextureList, TextureRef, TextureState,
};
