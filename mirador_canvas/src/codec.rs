//! Video codec seams: the MJPEG path used by server-driven streams and the
//! external decoder pair used by the accelerated pipeline.

use anyhow::Result;

use mirador_protocol::messages::VideoCodec;
use mirador_protocol::wire::AuxCodec;

/// Decoder attached to one server-driven video stream.
///
/// `decode_frame` consumes one complete compressed frame and produces a
/// 32-bit RGB raster of `width * height * 4` bytes, top-down. `None` means
/// the codec skipped the frame (corrupt data is logged, not fatal).
pub trait StreamFrameDecoder {
    fn decode_frame(&mut self, data: &[u8], width: u32, height: u32) -> Result<Option<Vec<u8>>>;
}

/// Builds stream decoders at stream-create time.
pub trait StreamCodecFactory {
    fn create(&self, codec: VideoCodec) -> Result<Box<dyn StreamFrameDecoder>>;
}

/// Frame in the decoder's native pixel format, before RGB conversion.
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<i32>,
}

/// 32-bit RGB output of the converter, handed to the UI thread.
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub data: Vec<u8>,
}

/// Stateful decoder for the accelerated pipeline, opened per codec and
/// dimension combination and reopened on stream restarts.
pub trait FrameDecoder: Send {
    /// Feeds encoded bytes; returns the number of bytes consumed and the
    /// completed frame, if any.
    fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<DecodedFrame>)>;
}

/// Converts a native-format frame to 32-bit RGB.
pub trait PixelConverter: Send {
    fn to_rgb32(&mut self, frame: &DecodedFrame) -> Result<RgbFrame>;
}

/// Opens decoders and converters for the accelerated pipeline's thread.
pub trait CodecBackendFactory: Send + Sync {
    fn open_decoder(&self, codec: AuxCodec, width: u32, height: u32)
        -> Result<Box<dyn FrameDecoder>>;
    fn open_converter(&self, width: u32, height: u32) -> Result<Box<dyn PixelConverter>>;
}
