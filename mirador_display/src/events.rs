//! Events the channel queues for the host UI.

use mirador_protocol::geometry::Rect;
use mirador_protocol::messages::SurfaceFormat;

/// User-visible signal emitted by the channel. The host drains these after
/// every batch of messages or timer firings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayEvent {
    /// The main display buffer exists; `shmid` is -1 for heap backing.
    PrimaryCreate {
        format: SurfaceFormat,
        width: u32,
        height: u32,
        stride: u32,
        shmid: i32,
    },
    /// The main display buffer is gone and must not be accessed anymore.
    PrimaryDestroy,
    /// The named region of the primary was updated.
    Invalidate(Rect),
    /// The display mark changed; the display should be shown or hidden.
    Mark(bool),
    /// The monitors layout changed.
    MonitorsChanged,
    /// The stream-report status string changed.
    StreamReportChanged,
}
