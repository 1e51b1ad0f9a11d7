use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Interval, MissedTickBehavior, interval};
use webrtc::media::io::h264_reader::{H264Reader, NalUnitType};

use super::{EncodedFrame, FrameSource};

const READ_CAPACITY: usize = 1_048_576;

/// Replays an Annex-B H.264 elementary stream, one NAL unit per frame.
///
/// Slice NAL units are paced at the configured frame rate; parameter sets and
/// SEI units pass through immediately.
pub struct H264FileSource {
    stream: Bytes,
    reader: H264Reader<Cursor<Bytes>>,
    frame_interval: Duration,
    ticker: Interval,
    looping: bool,
}

impl H264FileSource {
    pub async fn open(path: impl AsRef<Path>, fps: u32, looping: bool) -> std::io::Result<Self> {
        let path = path.as_ref();
        let stream = tokio::fs::read(path).await?;
        tracing::debug!(
            target: "beach_cam::media",
            path = %path.display(),
            bytes = stream.len(),
            fps,
            looping,
            "loaded h264 stream"
        );
        Ok(Self::from_bytes(Bytes::from(stream), fps, looping))
    }

    pub fn from_bytes(stream: Bytes, fps: u32, looping: bool) -> Self {
        let frame_interval = Duration::from_secs(1) / fps.max(1);
        let mut ticker = interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            reader: H264Reader::new(Cursor::new(stream.clone()), READ_CAPACITY),
            stream,
            frame_interval,
            ticker,
            looping,
        }
    }

    fn rewind(&mut self) {
        self.reader = H264Reader::new(Cursor::new(self.stream.clone()), READ_CAPACITY);
    }
}

#[async_trait]
impl FrameSource for H264FileSource {
    async fn next_frame(&mut self) -> Option<EncodedFrame> {
        let mut rewound = false;
        loop {
            match self.reader.next_nal() {
                Ok(nal) => {
                    let is_slice = matches!(
                        nal.unit_type,
                        NalUnitType::CodedSliceIdr | NalUnitType::CodedSliceNonIdr
                    );
                    if is_slice {
                        self.ticker.tick().await;
                    }
                    return Some(EncodedFrame {
                        data: nal.data.freeze(),
                        duration: if is_slice {
                            self.frame_interval
                        } else {
                            Duration::ZERO
                        },
                    });
                }
                Err(err) => {
                    // An empty stream would otherwise spin on rewinds.
                    if !self.looping || rewound {
                        tracing::debug!(target: "beach_cam::media", error = %err, "h264 stream ended");
                        return None;
                    }
                    self.rewind();
                    rewound = true;
                }
            }
        }
    }
}
