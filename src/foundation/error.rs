/// Convenience result type used across texstream.
pub type TexResult<T> = Result<T, TexError>;

/// Top-level error taxonomy used by the image and streaming APIs.
#[derive(thiserror::Error, Debug)]
pub enum TexError {
    /// A buffer size was out of range or the allocator refused it.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// A formatted buffer is missing, too small, or carries a bad header.
    #[error("uninitialized image: {0}")]
    Uninitialized(String),

    /// No codec implementation is registered for the request.
    #[error("codec unavailable: {0}")]
    CodecUnavailable(String),

    /// Upstream reported that the texture does not exist.
    #[error("asset missing: {0}")]
    AssetMissing(String),

    /// A pixel-level precondition was violated by the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Codec-level decode failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// Codec-level encode failure.
    #[error("encode error: {0}")]
    Encode(String),

    /// Invalid configuration values.
    #[error("config error: {0}")]
    Config(String),

    /// Local file load/save failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped lower-level error from dependencies.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TexError {
    /// Build a [`TexError::Allocation`] value.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Build a [`TexError::Uninitialized`] value.
    pub fn uninitialized(msg: impl Into<String>) -> Self {
        Self::Uninitialized(msg.into())
    }

    /// Build a [`TexError::CodecUnavailable`] value.
    pub fn codec_unavailable(msg: impl Into<String>) -> Self {
        Self::CodecUnavailable(msg.into())
    }

    /// Build a [`TexError::AssetMissing`] value.
    pub fn asset_missing(msg: impl Into<String>) -> Self {
        Self::AssetMissing(msg.into())
    }

    /// Build a [`TexError::InvariantViolation`] value.
    ///
    /// Invariant violations are programmer errors: they are always logged, and builds with the
    /// `strict-invariants` feature panic instead of returning.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "pixel invariant violated");
        if cfg!(all(debug_assertions, feature = "strict-invariants")) {
            panic!("invariant violation: {msg}");
        }
        Self::InvariantViolation(msg)
    }

    /// Build a [`TexError::Decode`] value.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Build a [`TexError::Encode`] value.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Build a [`TexError::Config`] value.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures that should mark a texture as permanently failed for this attempt.
    pub fn is_terminal_for_attempt(&self) -> bool {
        matches!(
            self,
            Self::Uninitialized(_) | Self::AssetMissing(_) | Self::CodecUnavailable(_)
        )
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
