//! Collaborators supplied by the owning session and dispatcher.

use std::sync::Arc;

use mirador_canvas::DictionaryWindow;
use mirador_protocol::messages::{ChannelWait, ImageCompression};

use crate::cache::ImageCache;

/// Outcome of driving the dispatcher during a cooperative wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStatus {
    /// More messages were dispatched; re-check the awaited condition.
    Pumped,
    /// The wait was cancelled (channel going down); give up.
    Cancelled,
}

/// The dispatcher's event source, driven while a handler is suspended.
///
/// Cache waits call `pump` in a loop: the implementation reads and dispatches
/// further messages on the same channel, which is the only way the awaited
/// cache entry can appear.
pub trait MessagePump {
    fn pump(&mut self) -> PumpStatus;

    /// Blocks until the named sibling channels have drained past the given
    /// serials. Used to order cross-channel cache invalidations.
    fn wait_for_channels(&mut self, waits: &[ChannelWait]) -> PumpStatus;
}

/// Wakes the host UI loop from another thread so it services the channel
/// (pending presentation, due timers).
pub trait UiWaker: Send + Sync {
    fn wake(&self);
}

/// The session owning this channel: media clock, audio playback state, and
/// the caches shared between all display channels.
pub trait Session {
    /// Current media time in milliseconds, or `None` while the session has
    /// no audio-clock reference.
    fn mm_time(&self) -> Option<u32>;

    fn playback_active(&self) -> bool {
        false
    }

    fn playback_latency_ms(&self) -> u32 {
        0
    }

    /// Asks the audio playback side to resynchronise its latency estimate.
    fn sync_playback_latency(&self) {}

    fn cache_size_bytes(&self) -> i64;

    fn glz_window_bytes(&self) -> i64;

    fn preferred_compression(&self) -> ImageCompression {
        ImageCompression::Invalid
    }

    fn image_cache(&self) -> Arc<ImageCache>;

    fn glz_window(&self) -> Arc<dyn DictionaryWindow>;

    /// Server host, for the accelerated pipeline's sidecar connection.
    fn host(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn main_port(&self) -> Option<u16> {
        None
    }

    fn tls_port(&self) -> Option<u16> {
        None
    }
}
