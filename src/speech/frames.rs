//! # Frame Streaming
//!
//! Splits normalized PCM into fixed-size frames and sends them one by one,
//! pacing them so the upstream sees roughly real-time audio.
//!
//! With the default 1280-byte frames each frame carries 40ms of 16kHz mono
//! audio, and the streamer waits 40ms after every frame except the last.
//! A clip that fits in one frame sends a single frame that both opens and
//! closes the session.

use super::connection::UpstreamConnection;
use super::error::SpeechError;
use super::protocol::{AudioData, Common, OutboundFrame, STATUS_CONTINUE, STATUS_FIRST, STATUS_LAST};
use super::SessionParameters;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    First,
    Middle,
    Last,
    /// The whole clip fits in one frame.
    Sole,
}

/// A view of one frame's worth of audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame<'a> {
    pub index: usize,
    pub offset: usize,
    pub payload: &'a [u8],
    pub role: FrameRole,
}

impl Frame<'_> {
    pub fn opens_session(&self) -> bool {
        matches!(self.role, FrameRole::First | FrameRole::Sole)
    }

    pub fn closes_session(&self) -> bool {
        matches!(self.role, FrameRole::Last | FrameRole::Sole)
    }

    /// `data.status` on the wire.
    pub fn status(&self) -> u8 {
        match self.role {
            FrameRole::First => STATUS_FIRST,
            FrameRole::Middle => STATUS_CONTINUE,
            FrameRole::Last | FrameRole::Sole => STATUS_LAST,
        }
    }
}

/// Split `audio` into `ceil(len / frame_size)` frames. Empty audio yields none.
pub fn split_frames(audio: &[u8], frame_size: usize) -> Vec<Frame<'_>> {
    let frame_size = frame_size.max(1);
    let len = audio.len();

    audio
        .chunks(frame_size)
        .enumerate()
        .map(|(index, payload)| {
            let offset = index * frame_size;
            let first = offset == 0;
            let last = offset + frame_size >= len;
            let role = match (first, last) {
                (true, true) => FrameRole::Sole,
                (true, false) => FrameRole::First,
                (false, true) => FrameRole::Last,
                (false, false) => FrameRole::Middle,
            };
            Frame {
                index,
                offset,
                payload,
                role,
            }
        })
        .collect()
}

/// What was sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames: usize,
    pub bytes: usize,
}

pub struct FrameStreamer<'a> {
    app_id: &'a str,
    session: &'a SessionParameters,
    frame_size: usize,
    interval: Duration,
}

impl<'a> FrameStreamer<'a> {
    pub fn new(app_id: &'a str, session: &'a SessionParameters, frame_size: usize, interval: Duration) -> Self {
        Self {
            app_id,
            session,
            frame_size,
            interval,
        }
    }

    /// The JSON text message for one frame.
    pub fn encode(&self, frame: &Frame<'_>) -> String {
        let data = AudioData::new(frame.status(), frame.payload);
        let message = if frame.opens_session() {
            OutboundFrame::First {
                common: Common { app_id: self.app_id },
                business: self.session,
                data,
            }
        } else {
            OutboundFrame::Continuation { data }
        };
        message.to_json()
    }

    /// Send every frame in order. Stops at the first send failure.
    pub async fn stream(
        &self,
        connection: &mut dyn UpstreamConnection,
        audio: &[u8],
    ) -> Result<StreamStats, SpeechError> {
        let frames = split_frames(audio, self.frame_size);
        let mut stats = StreamStats::default();

        for frame in &frames {
            connection.send_text(self.encode(frame)).await?;
            stats.frames += 1;
            stats.bytes += frame.payload.len();

            debug!(
                index = frame.index,
                offset = frame.offset,
                bytes = frame.payload.len(),
                status = frame.status(),
                "sent audio frame"
            );

            if !frame.closes_session() {
                tokio::time::sleep(self.interval).await;
            }
        }

        Ok(stats)
    }
}
