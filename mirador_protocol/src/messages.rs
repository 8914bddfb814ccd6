//! Typed message sets exchanged with the display server.
//!
//! Transport framing and parsing live outside this crate; the channel is
//! handed fully parsed [`DisplayMsg`] values and replies with [`ClientMsg`]
//! values queued for the sender.

use crate::geometry::{Clip, Rect};

/// Pixel layout of a surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceFormat {
    /// 32 bits per pixel, xRGB.
    Rgb32,
    /// 16 bits per pixel, 5-5-5.
    Rgb16_555,
    /// 8-bit alpha only.
    Alpha8,
}

/// Codec tag of a server-driven video stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    Mjpeg,
}

/// Image compression the client may ask the server to prefer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageCompression {
    Invalid,
    Off,
    AutoGlz,
    AutoLz,
    Quic,
    Glz,
    Lz,
    Lz4,
}

/// Capabilities the channel advertises or negotiates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    SizedStream,
    MonitorsConfig,
    Composite,
    A8Surface,
    Lz4Compression,
    StreamReport,
    PreferredCompression,
}

/// One virtual head of the guest display layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorHead {
    pub id: u32,
    pub surface_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Reference to an image held in the session pixmap cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageRef(pub u64);

/// Raster operation selector, forwarded opaquely to the canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rop(pub u16);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Brush {
    Solid(u32),
    Pattern { image: ImageRef, pos: (i32, i32) },
}

/// Fields common to every drawing op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawBase {
    pub surface_id: u32,
    pub bbox: Rect,
    pub clip: Clip,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FillData {
    pub brush: Brush,
    pub rop: Rop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueData {
    pub src_image: ImageRef,
    pub src_area: Rect,
    pub brush: Brush,
    pub rop: Rop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyData {
    pub src_image: ImageRef,
    pub src_area: Rect,
    pub rop: Rop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rop3Data {
    pub src_image: ImageRef,
    pub src_area: Rect,
    pub brush: Brush,
    pub rop3: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StrokeData {
    pub points: Vec<(i32, i32)>,
    pub brush: Brush,
    pub fore_mode: Rop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextData {
    pub glyphs: Vec<u8>,
    pub back_area: Rect,
    pub fore_brush: Brush,
    pub back_brush: Brush,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransparentData {
    pub src_image: ImageRef,
    pub src_area: Rect,
    pub transparent_color: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlphaBlendData {
    pub alpha: u8,
    pub src_image: ImageRef,
    pub src_area: Rect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeData {
    pub flags: u32,
    pub src_image: ImageRef,
    pub mask_image: Option<ImageRef>,
}

/// Operands of one drawing op; the base rectangle and clip travel alongside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrawOp {
    Fill(FillData),
    Opaque(OpaqueData),
    Copy(CopyData),
    Blend(CopyData),
    Blackness,
    Whiteness,
    Invers,
    Rop3(Rop3Data),
    Stroke(StrokeData),
    Text(TextData),
    Transparent(TransparentData),
    AlphaBlend(AlphaBlendData),
    Composite(CompositeData),
}

impl DrawOp {
    pub fn name(&self) -> &'static str {
        match self {
            DrawOp::Fill(_) => "fill",
            DrawOp::Opaque(_) => "opaque",
            DrawOp::Copy(_) => "copy",
            DrawOp::Blend(_) => "blend",
            DrawOp::Blackness => "blackness",
            DrawOp::Whiteness => "whiteness",
            DrawOp::Invers => "invers",
            DrawOp::Rop3(_) => "rop3",
            DrawOp::Stroke(_) => "stroke",
            DrawOp::Text(_) => "text",
            DrawOp::Transparent(_) => "transparent",
            DrawOp::AlphaBlend(_) => "alpha_blend",
            DrawOp::Composite(_) => "composite",
        }
    }
}

/// Cached-resource kinds named by invalidation lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Pixmap,
    Other(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: u64,
}

/// Sibling channel named by a cross-channel drain barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelWait {
    pub channel_type: u8,
    pub channel_id: u8,
    pub message_serial: u64,
}

/// Stream flags; only the top-down bit is interpreted by the channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags(pub u32);

impl StreamFlags {
    pub const TOP_DOWN: u32 = 1;

    pub fn top_down(&self) -> bool {
        self.0 & Self::TOP_DOWN != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCreate {
    pub id: u32,
    pub surface_id: u32,
    pub codec: VideoCodec,
    pub flags: StreamFlags,
    pub dest: Rect,
    pub stream_width: u32,
    pub stream_height: u32,
    pub clip: Clip,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamData {
    pub id: u32,
    pub media_time: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDataSized {
    pub id: u32,
    pub media_time: u32,
    pub dest: Rect,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamActivateReport {
    pub stream_id: u32,
    pub unique_id: u32,
    pub max_window_size: u32,
    pub timeout_ms: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_port: i32,
    pub on_movie_detection: u32,
    pub on_variation_capture: u32,
    pub max_sampling_fps: u32,
}

/// Encoded frame for the accelerated path, delivered in-band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrameData {
    pub sequence: u32,
    pub media_time: u32,
    pub data: Vec<u8>,
}

/// Every message the server sends on the display channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayMsg {
    Mode {
        x_res: u32,
        y_res: u32,
        bits: u32,
    },
    Mark,
    Reset,
    CopyBits {
        base: DrawBase,
        src_pos: (i32, i32),
    },
    InvalList(Vec<ResourceRef>),
    InvalAllPixmaps {
        wait: Vec<ChannelWait>,
    },
    InvalPalette {
        id: u64,
    },
    InvalAllPalettes,
    StreamCreate(StreamCreate),
    StreamData(StreamData),
    StreamClip {
        id: u32,
        clip: Clip,
    },
    StreamDestroy {
        id: u32,
    },
    StreamDestroyAll,
    StreamDataSized(StreamDataSized),
    StreamActivateReport(StreamActivateReport),
    Draw {
        base: DrawBase,
        op: DrawOp,
    },
    SurfaceCreate {
        surface_id: u32,
        format: SurfaceFormat,
        width: u32,
        height: u32,
        primary: bool,
    },
    SurfaceDestroy {
        surface_id: u32,
    },
    MonitorsConfig {
        max_allowed: u32,
        heads: Vec<MonitorHead>,
    },
    StreamConfig(StreamConfig),
    StreamFrameData(StreamFrameData),
}

/// Messages the channel sends back to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMsg {
    DisplayInit {
        pixmap_cache_id: u8,
        pixmap_cache_size: i64,
        glz_dictionary_id: u8,
        glz_dictionary_window_size: i64,
    },
    PreferredCompression {
        compression: ImageCompression,
    },
    StreamReport(StreamReport),
    StreamConfig(StreamConfig),
    StreamStatData {
        backlog_size: u32,
    },
}

/// One QoS window, as reported to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamReport {
    pub stream_id: u32,
    pub unique_id: u32,
    pub start_frame_mm_time: u32,
    pub end_frame_mm_time: u32,
    pub num_frames: u32,
    pub num_drops: u32,
    pub last_frame_delay: i32,
    pub audio_delay: u32,
}
