//! Recording fakes for the channel's collaborators.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use anyhow::Result;

use mirador_canvas::codec::{
    CodecBackendFactory, DecodedFrame, FrameDecoder, PixelConverter, RgbFrame, StreamCodecFactory,
    StreamFrameDecoder,
};
use mirador_canvas::{
    Canvas, CanvasConfig, CanvasFactory, DecoderFactory, DictionaryWindow, ImageDecoder, NoShm,
    PixmapRef,
};
use mirador_display::cache::ImageCache;
use mirador_display::{
    AuxPipelineOptions, ChannelConfig, DisplayChannel, MessagePump, PumpStatus, Session, UiWaker,
};
use mirador_protocol::geometry::{Clip, Rect, Region};
use mirador_protocol::messages::{
    AlphaBlendData, ChannelWait, CompositeData, CopyData, FillData, OpaqueData, Rop3Data,
    StrokeData, TextData, TransparentData, VideoCodec,
};
use mirador_protocol::wire::AuxCodec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanvasCall {
    Draw(&'static str, Rect),
    CopyBits(Rect),
    PutImage {
        dest: Rect,
        width: u32,
        height: u32,
        stride: isize,
    },
    Clear,
}

pub type CanvasLog = Rc<RefCell<Vec<CanvasCall>>>;

struct RecordingCanvas {
    log: CanvasLog,
}

impl RecordingCanvas {
    fn record(&self, call: CanvasCall) {
        self.log.borrow_mut().push(call);
    }
}

impl Canvas for RecordingCanvas {
    fn draw_fill(&mut self, bbox: &Rect, _clip: &Clip, _data: &FillData) {
        self.record(CanvasCall::Draw("fill", *bbox));
    }
    fn draw_opaque(&mut self, bbox: &Rect, _clip: &Clip, _data: &OpaqueData) {
        self.record(CanvasCall::Draw("opaque", *bbox));
    }
    fn draw_copy(&mut self, bbox: &Rect, _clip: &Clip, _data: &CopyData) {
        self.record(CanvasCall::Draw("copy", *bbox));
    }
    fn draw_blend(&mut self, bbox: &Rect, _clip: &Clip, _data: &CopyData) {
        self.record(CanvasCall::Draw("blend", *bbox));
    }
    fn draw_blackness(&mut self, bbox: &Rect, _clip: &Clip) {
        self.record(CanvasCall::Draw("blackness", *bbox));
    }
    fn draw_whiteness(&mut self, bbox: &Rect, _clip: &Clip) {
        self.record(CanvasCall::Draw("whiteness", *bbox));
    }
    fn draw_invers(&mut self, bbox: &Rect, _clip: &Clip) {
        self.record(CanvasCall::Draw("invers", *bbox));
    }
    fn draw_rop3(&mut self, bbox: &Rect, _clip: &Clip, _data: &Rop3Data) {
        self.record(CanvasCall::Draw("rop3", *bbox));
    }
    fn draw_stroke(&mut self, bbox: &Rect, _clip: &Clip, _data: &StrokeData) {
        self.record(CanvasCall::Draw("stroke", *bbox));
    }
    fn draw_text(&mut self, bbox: &Rect, _clip: &Clip, _data: &TextData) {
        self.record(CanvasCall::Draw("text", *bbox));
    }
    fn draw_transparent(&mut self, bbox: &Rect, _clip: &Clip, _data: &TransparentData) {
        self.record(CanvasCall::Draw("transparent", *bbox));
    }
    fn draw_alpha_blend(&mut self, bbox: &Rect, _clip: &Clip, _data: &AlphaBlendData) {
        self.record(CanvasCall::Draw("alpha_blend", *bbox));
    }
    fn draw_composite(&mut self, bbox: &Rect, _clip: &Clip, _data: &CompositeData) {
        self.record(CanvasCall::Draw("composite", *bbox));
    }
    fn copy_bits(&mut self, bbox: &Rect, _clip: &Clip, _src_pos: (i32, i32)) {
        self.record(CanvasCall::CopyBits(*bbox));
    }
    fn put_image(&mut self, dest: &Rect, src: PixmapRef<'_>, _clip: Option<&Region>) {
        self.record(CanvasCall::PutImage {
            dest: *dest,
            width: src.width,
            height: src.height,
            stride: src.stride,
        });
    }
    fn clear(&mut self) {
        self.record(CanvasCall::Clear);
    }
}

pub struct FakeCanvasFactory {
    pub log: CanvasLog,
}

impl FakeCanvasFactory {
    pub fn new() -> (Rc<Self>, CanvasLog) {
        let log: CanvasLog = Rc::new(RefCell::new(Vec::new()));
        (Rc::new(Self { log: log.clone() }), log)
    }
}

impl CanvasFactory for FakeCanvasFactory {
    fn create_canvas(&self, _config: CanvasConfig) -> Result<Box<dyn Canvas>> {
        Ok(Box::new(RecordingCanvas {
            log: self.log.clone(),
        }))
    }
}

struct NullImageDecoder;

impl ImageDecoder for NullImageDecoder {
    fn decode(&mut self, src: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(src);
        Ok(())
    }
}

pub struct FakeDecoderFactory;

impl DecoderFactory for FakeDecoderFactory {
    fn lossless_dictionary(&self, _window: &Arc<dyn DictionaryWindow>) -> Box<dyn ImageDecoder> {
        Box::new(NullImageDecoder)
    }
    fn deflate(&self) -> Box<dyn ImageDecoder> {
        Box::new(NullImageDecoder)
    }
    fn jpeg(&self) -> Box<dyn ImageDecoder> {
        Box::new(NullImageDecoder)
    }
}

struct SolidFrameDecoder {
    decoded: Rc<Cell<usize>>,
}

impl StreamFrameDecoder for SolidFrameDecoder {
    fn decode_frame(&mut self, _data: &[u8], width: u32, height: u32) -> Result<Option<Vec<u8>>> {
        self.decoded.set(self.decoded.get() + 1);
        Ok(Some(vec![0x7f; (width * height * 4) as usize]))
    }
}

pub struct FakeStreamCodecs {
    pub decoded: Rc<Cell<usize>>,
}

impl FakeStreamCodecs {
    pub fn new() -> (Rc<Self>, Rc<Cell<usize>>) {
        let decoded = Rc::new(Cell::new(0));
        (
            Rc::new(Self {
                decoded: decoded.clone(),
            }),
            decoded,
        )
    }
}

impl StreamCodecFactory for FakeStreamCodecs {
    fn create(&self, _codec: VideoCodec) -> Result<Box<dyn StreamFrameDecoder>> {
        Ok(Box::new(SolidFrameDecoder {
            decoded: self.decoded.clone(),
        }))
    }
}

struct FakeWindow;

impl DictionaryWindow for FakeWindow {}

pub struct FakeSession {
    pub mm_time: Cell<Option<u32>>,
    pub playback_active: Cell<bool>,
    pub playback_latency: Cell<u32>,
    pub sync_requests: Cell<u32>,
    pub images: Arc<ImageCache>,
    window: Arc<dyn DictionaryWindow>,
}

impl FakeSession {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            mm_time: Cell::new(Some(0)),
            playback_active: Cell::new(false),
            playback_latency: Cell::new(0),
            sync_requests: Cell::new(0),
            images: Arc::new(ImageCache::new()),
            window: Arc::new(FakeWindow),
        })
    }
}

impl Session for FakeSession {
    fn mm_time(&self) -> Option<u32> {
        self.mm_time.get()
    }
    fn playback_active(&self) -> bool {
        self.playback_active.get()
    }
    fn playback_latency_ms(&self) -> u32 {
        self.playback_latency.get()
    }
    fn sync_playback_latency(&self) {
        self.sync_requests.set(self.sync_requests.get() + 1);
    }
    fn cache_size_bytes(&self) -> i64 {
        80 * 1024 * 1024
    }
    fn glz_window_bytes(&self) -> i64 {
        32 * 1024 * 1024
    }
    fn image_cache(&self) -> Arc<ImageCache> {
        self.images.clone()
    }
    fn glz_window(&self) -> Arc<dyn DictionaryWindow> {
        self.window.clone()
    }
}

/// Pump whose `pump` never delivers anything; waits record their barrier.
pub struct RecordingPump {
    pub barriers: Vec<Vec<ChannelWait>>,
}

impl RecordingPump {
    pub fn new() -> Self {
        Self {
            barriers: Vec::new(),
        }
    }
}

impl MessagePump for RecordingPump {
    fn pump(&mut self) -> PumpStatus {
        PumpStatus::Cancelled
    }
    fn wait_for_channels(&mut self, waits: &[ChannelWait]) -> PumpStatus {
        self.barriers.push(waits.to_vec());
        PumpStatus::Pumped
    }
}

pub struct ChannelWaker {
    tx: Sender<()>,
}

impl ChannelWaker {
    pub fn new(tx: Sender<()>) -> Arc<Self> {
        Arc::new(Self { tx })
    }
}

impl UiWaker for ChannelWaker {
    fn wake(&self) {
        let _ = self.tx.send(());
    }
}

struct SizedFrameDecoder {
    width: u32,
    height: u32,
}

impl FrameDecoder for SizedFrameDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<DecodedFrame>)> {
        Ok((
            data.len(),
            Some(DecodedFrame {
                width: self.width,
                height: self.height,
                planes: vec![data.to_vec()],
                strides: vec![(self.width * 4) as i32],
            }),
        ))
    }
}

struct SolidConverter {
    width: u32,
    height: u32,
}

impl PixelConverter for SolidConverter {
    fn to_rgb32(&mut self, _frame: &DecodedFrame) -> Result<RgbFrame> {
        Ok(RgbFrame {
            width: self.width,
            height: self.height,
            stride: (self.width * 4) as i32,
            data: vec![0xab; (self.width * self.height * 4) as usize],
        })
    }
}

pub struct FakeBackend;

impl CodecBackendFactory for FakeBackend {
    fn open_decoder(
        &self,
        _codec: AuxCodec,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FrameDecoder>> {
        Ok(Box::new(SizedFrameDecoder { width, height }))
    }
    fn open_converter(&self, width: u32, height: u32) -> Result<Box<dyn PixelConverter>> {
        Ok(Box::new(SolidConverter { width, height }))
    }
}

/// A channel over recording fakes, plus the handles tests assert against.
pub struct Harness {
    pub channel: DisplayChannel,
    pub session: Rc<FakeSession>,
    pub canvas_log: CanvasLog,
    pub decoded_frames: Rc<Cell<usize>>,
}

pub fn init_logs() {
    let env = env_logger::Env::default().default_filter_or("warn");
    let _ = env_logger::Builder::from_env(env).is_test(true).try_init();
}

pub fn harness(channel_id: u8) -> Harness {
    harness_with_aux(channel_id, None)
}

pub fn harness_with_aux(channel_id: u8, aux: Option<AuxPipelineOptions>) -> Harness {
    init_logs();
    let session = FakeSession::new();
    let (canvas_factory, canvas_log) = FakeCanvasFactory::new();
    let (stream_codecs, decoded_frames) = FakeStreamCodecs::new();
    let channel = DisplayChannel::new(ChannelConfig {
        channel_id,
        session: session.clone(),
        canvas_factory,
        decoder_factory: Rc::new(FakeDecoderFactory),
        stream_codecs,
        shm: Box::new(NoShm),
        adaptive_streaming: Some(true),
        aux,
    });
    Harness {
        channel,
        session,
        canvas_log,
        decoded_frames,
    }
}
