//! Frame sources feeding the outbound video track.
//!
//! A [`FrameSource`] lives for the whole process; each session borrows it for
//! the lifetime of its [`pump`] task.

pub mod h264;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;

pub use h264::H264FileSource;

/// One encoded access unit, ready to be handed to the track packetizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream ended.
    async fn next_frame(&mut self) -> Option<EncodedFrame>;
}

pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

pub fn shared(source: impl FrameSource + 'static) -> SharedFrameSource {
    Arc::new(Mutex::new(Box::new(source)))
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("track rejected sample: {0}")]
    Track(#[from] webrtc::Error),
}

/// Destination of pumped frames, usually a local RTP track.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_frame(&self, frame: &EncodedFrame) -> Result<(), MediaError>;
}

/// Copies frames from `source` into `sink` until the source ends.
///
/// Write failures are logged and skipped; the track stays usable for later
/// frames. Returns the number of frames written.
pub async fn pump(source: SharedFrameSource, sink: Arc<dyn SampleSink>) -> u64 {
    let mut source = source.lock().await;
    let mut written = 0u64;
    while let Some(frame) = source.next_frame().await {
        match sink.write_frame(&frame).await {
            Ok(()) => {
                written += 1;
                if written == 1 {
                    tracing::debug!(target: "beach_cam::media", size = frame.data.len(), "first frame written");
                }
            }
            Err(err) => {
                tracing::warn!(target: "beach_cam::media", error = %err, "sample write failed");
            }
        }
    }
    tracing::debug!(target: "beach_cam::media", frames = written, "frame source exhausted");
    written
}
