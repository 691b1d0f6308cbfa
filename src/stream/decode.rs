use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

use super::entry::TextureKey;
use super::fetch::RequestId;
use crate::formatted::{DecodeStatus, FormattedImage};
use crate::foundation::error::{TexError, TexResult};
use crate::raw::PixelBuffer;

/// One decode job. The image travels with the request and comes back in the result, so at most
/// one decode per texture can exist.
#[derive(Debug)]
pub struct DecodeRequest {
    pub id: RequestId,
    pub key: TextureKey,
    pub image: FormattedImage,
    /// Discard level to decode toward.
    pub discard_level: u8,
    /// Time slice between cancellation checks.
    pub slice: Duration,
    /// Set when the result is no longer wanted.
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(PixelBuffer),
    Cancelled,
    Failed(TexError),
}

#[derive(Debug)]
pub struct DecodeResult {
    pub id: RequestId,
    pub key: TextureKey,
    pub image: FormattedImage,
    pub outcome: DecodeOutcome,
}

/// Decode service. Cancellation is cooperative through [`DecodeRequest::cancel`].
pub trait DecodeService: Send {
    fn submit(&mut self, request: DecodeRequest);

    /// Up to `max` finished jobs.
    fn poll(&mut self, max: usize) -> Vec<DecodeResult>;

    /// Jobs submitted and not yet returned by `poll`.
    fn pending(&self) -> usize;
}

/// Run a decode to completion in time slices, checking the cancel flag between slices.
pub fn run_decode(mut req: DecodeRequest) -> DecodeResult {
    let mut raw = PixelBuffer::new();
    req.image.set_discard_level(Some(req.discard_level));
    let outcome = loop {
        if req.cancel.load(Ordering::Relaxed) {
            break DecodeOutcome::Cancelled;
        }
        match req.image.decode(&mut raw, req.slice) {
            Ok(DecodeStatus::Pending) => continue,
            Ok(DecodeStatus::Done) => break DecodeOutcome::Decoded(raw),
            Err(e) => break DecodeOutcome::Failed(e),
        }
    };
    DecodeResult {
        id: req.id,
        key: req.key,
        image: req.image,
        outcome,
    }
}

/// Decode service backed by a dedicated rayon pool. Results come back over a channel.
#[derive(Debug)]
pub struct DecodePool {
    pool: rayon::ThreadPool,
    tx: Sender<DecodeResult>,
    rx: Receiver<DecodeResult>,
    in_flight: usize,
}

impl DecodePool {
    pub fn new(threads: Option<usize>) -> TexResult<Self> {
        if threads == Some(0) {
            return Err(TexError::config("decode threads must be >= 1 when set"));
        }
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("texstream-decode-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| TexError::config(format!("failed to build decode thread pool: {e}")))?;
        let (tx, rx) = channel();
        Ok(Self {
            pool,
            tx,
            rx,
            in_flight: 0,
        })
    }

    /// Block until a result arrives or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Option<DecodeResult> {
        let result = self.rx.recv_timeout(timeout).ok()?;
        self.in_flight = self.in_flight.saturating_sub(1);
        Some(result)
    }
}

impl DecodeService for DecodePool {
    fn submit(&mut self, request: DecodeRequest) {
        let tx = self.tx.clone();
        self.in_flight += 1;
        self.pool.spawn(move || {
            // The receiver only goes away with the pool itself.
            let _ = tx.send(run_decode(request));
        });
    }

    fn poll(&mut self, max: usize) -> Vec<DecodeResult> {
        let out: Vec<_> = self.rx.try_iter().take(max).collect();
        self.in_flight = self.in_flight.saturating_sub(out.len());
        out
    }

    fn pending(&self) -> usize {
        self.in_flight
    }
}

/// Decode service that runs jobs on the polling thread, in submission order.
#[derive(Debug, Default)]
pub struct InlineDecoder {
    queue: VecDeque<DecodeRequest>,
}

impl InlineDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecodeService for InlineDecoder {
    fn submit(&mut self, request: DecodeRequest) {
        self.queue.push_back(request);
    }

    fn poll(&mut self, max: usize) -> Vec<DecodeResult> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).map(run_decode).collect()
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/decode.rs"]
mod tests;
