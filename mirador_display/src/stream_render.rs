//! Accelerated video stream pipeline.
//!
//! Encoded frames reach the channel either over a sidecar TCP connection or
//! in-band as frame messages. A dedicated thread decodes them through the
//! external codec backend, converts to 32-bit RGB, and hands each frame to
//! the UI thread one at a time: the thread publishes the frame, wakes the
//! host, and blocks until the presentation callback signals completion.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};

use mirador_canvas::codec::{CodecBackendFactory, FrameDecoder, PixelConverter, RgbFrame};
use mirador_canvas::PixmapRef;
use mirador_protocol::geometry::Rect;
use mirador_protocol::messages::{ClientMsg, StreamConfig, StreamFrameData};
use mirador_protocol::wire::EncodedFrame;

use crate::channel::DisplayChannel;
use crate::config::StreamSettings;
use crate::events::DisplayEvent;
use crate::session::UiWaker;
use crate::timer::{TimerId, TimerQueue, TimerToken};

/// Combined queue depth at which backlog reports start.
const BACKLOG_REPORT_THRESHOLD: usize = 7;
/// Cap on the decoder-visible queue; the oldest frame is dropped beyond it.
const DECODER_QUEUE_CAP: usize = 32;
/// Minimum spacing between backlog reports.
const STAT_INTERVAL: Duration = Duration::from_secs(1);

/// Host-supplied pieces of the accelerated pipeline.
pub struct AuxPipelineOptions {
    pub backend: Arc<dyn CodecBackendFactory>,
    pub waker: Arc<dyn UiWaker>,
    /// Overrides the settings file location; defaults next to the executable.
    pub config_path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuxStatus {
    Start,
    PauseReq,
    PauseRsp,
    RunReq,
    RunRsp,
    FinReq,
    FinRsp,
}

/// Decoded frame parked for the UI thread.
pub(crate) struct PendingFrame {
    pub dest: Rect,
    pub stride: i32,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct Handoff {
    frame: Option<PendingFrame>,
    /// True while the UI callback is presenting the taken frame.
    busy: bool,
}

struct AuxShared {
    status: AuxStatus,
    msgq: VecDeque<Vec<u8>>,
    handoff: Handoff,
    socket: Option<TcpStream>,
    thread_alive: bool,
}

impl AuxShared {
    fn new() -> Self {
        Self {
            status: AuxStatus::Start,
            msgq: VecDeque::new(),
            handoff: Handoff::default(),
            socket: None,
            thread_alive: false,
        }
    }
}

struct AuxCtx {
    shared: Mutex<AuxShared>,
    cond: Condvar,
    waker: Arc<dyn UiWaker>,
    backend: Arc<dyn CodecBackendFactory>,
}

/// Sidecar connection target, resolved before the thread starts.
pub(crate) struct SidecarTarget {
    pub host: String,
    pub port: u16,
    pub handshake: String,
}

pub(crate) struct StreamRender {
    ctx: Arc<AuxCtx>,
    thread: Option<JoinHandle<()>>,
    config_path: Option<PathBuf>,
    pub(crate) settings: StreamSettings,
    pub(crate) in_band: bool,
    pub(crate) major_protocol: i32,
    pub(crate) minor_protocol: i32,
    pub(crate) latency_queue: VecDeque<StreamFrameData>,
    pub(crate) expected_sequence: u32,
    pub(crate) timer: Option<TimerId>,
    pub(crate) last_stat: Option<Instant>,
}

impl StreamRender {
    pub fn new(options: AuxPipelineOptions) -> Self {
        let config_path = options.config_path;
        let settings = read_settings(config_path.as_deref());
        Self {
            ctx: Arc::new(AuxCtx {
                shared: Mutex::new(AuxShared::new()),
                cond: Condvar::new(),
                waker: options.waker,
                backend: options.backend,
            }),
            thread: None,
            config_path,
            settings,
            in_band: settings.stream_port == 0,
            major_protocol: 0,
            minor_protocol: 0,
            latency_queue: VecDeque::new(),
            expected_sequence: 0,
            timer: None,
            last_stat: None,
        }
    }

    pub fn reload_settings(&mut self) {
        self.settings = read_settings(self.config_path.as_deref());
    }

    /// Spawns the decode thread. A negative stream port leaves the pipeline
    /// off entirely.
    pub fn start(&mut self, sidecar: Option<SidecarTarget>) {
        if self.thread.is_some() {
            return;
        }
        if self.settings.stream_port < 0 {
            log::info!("stream render: disabled by configuration");
            return;
        }
        {
            let mut shared = self.ctx.shared.lock();
            shared.status = AuxStatus::Start;
            shared.thread_alive = true;
            shared.handoff = Handoff::default();
        }
        let ctx = self.ctx.clone();
        self.thread = Some(std::thread::spawn(move || decode_thread(ctx, sidecar)));
        log::debug!("stream render: decode thread started");
    }

    /// Requests the finish handshake and joins the decode thread, closing
    /// its socket to unblock any pending read.
    fn join_thread(&mut self) {
        {
            let mut shared = self.ctx.shared.lock();
            while shared.thread_alive
                && shared.status != AuxStatus::Start
                && shared.status != AuxStatus::FinRsp
            {
                log::debug!("stream render: waiting for decode thread to finish");
                if let Some(socket) = shared.socket.take() {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                shared.status = AuxStatus::FinReq;
                shared.handoff = Handoff::default();
                self.ctx.cond.notify_all();
                self.ctx.cond.wait(&mut shared);
            }
            if shared.status == AuxStatus::Start {
                shared.status = AuxStatus::FinReq;
                if let Some(socket) = shared.socket.take() {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                self.ctx.cond.notify_all();
            }
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Finish handshake plus queue and schedule teardown.
    pub fn shutdown(&mut self, timers: &mut TimerQueue) {
        self.join_thread();
        self.reset_schedule(timers);
        self.ctx.shared.lock().msgq.clear();
    }

    /// Drops everything still waiting on the latency timer and forgets the
    /// expected sequence number.
    pub fn reset_schedule(&mut self, timers: &mut TimerQueue) {
        if let Some(timer) = self.timer.take() {
            timers.cancel(timer);
        }
        self.latency_queue.clear();
        self.expected_sequence = 0;
    }

    pub fn decoder_queue_len(&self) -> usize {
        self.ctx.shared.lock().msgq.len()
    }

    pub fn send_to_decoder(&self, payload: Vec<u8>) {
        let mut shared = self.ctx.shared.lock();
        if shared.msgq.len() >= DECODER_QUEUE_CAP {
            shared.msgq.pop_front();
            log::warn!("stream render: decoder queue full, dropping oldest frame");
        }
        shared.msgq.push_back(payload);
        self.ctx.cond.notify_all();
    }

    /// Parks the decode thread between frames. Must not be called while a
    /// frame presentation is pending on this thread.
    pub fn pause(&self) {
        let mut shared = self.ctx.shared.lock();
        if !shared.thread_alive {
            return;
        }
        shared.status = AuxStatus::PauseReq;
        self.ctx.cond.notify_all();
        while shared.status == AuxStatus::PauseReq && shared.thread_alive {
            self.ctx.cond.wait(&mut shared);
        }
    }

    pub fn resume(&self) {
        let mut shared = self.ctx.shared.lock();
        if matches!(shared.status, AuxStatus::PauseReq | AuxStatus::PauseRsp) {
            shared.status = AuxStatus::RunReq;
            self.ctx.cond.notify_all();
        }
    }

    pub(crate) fn take_pending_frame(&self) -> Option<PendingFrame> {
        let mut shared = self.ctx.shared.lock();
        let frame = shared.handoff.frame.take()?;
        shared.handoff.busy = true;
        Some(frame)
    }

    pub(crate) fn presentation_done(&self) {
        let mut shared = self.ctx.shared.lock();
        shared.handoff.busy = false;
        self.ctx.cond.notify_all();
    }

    pub fn thread_alive(&self) -> bool {
        self.ctx.shared.lock().thread_alive
    }
}

impl Drop for StreamRender {
    fn drop(&mut self) {
        self.join_thread();
    }
}

fn read_settings(path: Option<&Path>) -> StreamSettings {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(StreamSettings::default_path);
    match StreamSettings::load_or_create(&path) {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("stream settings unavailable ({err:#}), using defaults");
            StreamSettings::default()
        }
    }
}

fn connect_sidecar(target: &SidecarTarget) -> Result<TcpStream> {
    let mut socket = TcpStream::connect((target.host.as_str(), target.port))
        .with_context(|| format!("connecting to {}:{}", target.host, target.port))?;
    socket
        .write_all(target.handshake.as_bytes())
        .context("sending stream handshake")?;
    log::info!("stream render: connected to {}:{}", target.host, target.port);
    Ok(socket)
}

fn decode_thread(ctx: Arc<AuxCtx>, sidecar: Option<SidecarTarget>) {
    let socket = match &sidecar {
        Some(target) => match connect_sidecar(target) {
            Ok(socket) => {
                ctx.shared.lock().socket = socket.try_clone().ok();
                Some(socket)
            }
            Err(err) => {
                log::error!("stream render: {err:#}");
                finish_thread(&ctx);
                return;
            }
        },
        None => {
            log::debug!("stream render: consuming in-band frames");
            None
        }
    };

    run_decode(&ctx, socket);
    finish_thread(&ctx);
}

/// Marks the thread gone; every exit path ends in the FIN_RSP state so the
/// join handshake never waits on a dead thread.
fn finish_thread(ctx: &AuxCtx) {
    let mut shared = ctx.shared.lock();
    shared.thread_alive = false;
    shared.status = AuxStatus::FinRsp;
    ctx.cond.notify_all();
}

enum ReadOutcome {
    Frame(EncodedFrame),
    Finish,
    Failed(anyhow::Error),
}

fn run_decode(ctx: &AuxCtx, mut socket: Option<TcpStream>) {
    let mut decoder: Option<Box<dyn FrameDecoder>> = None;
    let mut converter: Option<Box<dyn PixelConverter>> = None;
    let mut dims = (0u32, 0u32);

    loop {
        if !process_pause_fin(ctx) {
            return;
        }

        let frame = match read_encoded_frame(ctx, socket.as_mut()) {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::Finish => return,
            ReadOutcome::Failed(err) => {
                log::error!("stream render: {err:#}");
                return;
            }
        };

        let (width, height) = (frame.header.width, frame.header.height);
        let needs_init = decoder.is_none()
            || frame.header.sequence == 0
            || frame.private.is_some()
            || (width, height) != dims;
        if needs_init {
            decoder = match ctx.backend.open_decoder(frame.codec(), width, height) {
                Ok(decoder) => Some(decoder),
                Err(err) => {
                    log::error!("stream render: codec open failed: {err:#}");
                    return;
                }
            };
            converter = match ctx.backend.open_converter(width, height) {
                Ok(converter) => Some(converter),
                Err(err) => {
                    log::error!("stream render: converter open failed: {err:#}");
                    return;
                }
            };
            dims = (width, height);
        }
        let (Some(decoder), Some(converter)) = (decoder.as_mut(), converter.as_mut()) else {
            return;
        };

        let mut data = frame.data.as_slice();
        while !data.is_empty() {
            let (consumed, native) = match decoder.decode(data) {
                Ok(step) => step,
                Err(err) => {
                    log::error!("stream render: decode failed: {err:#}");
                    return;
                }
            };
            if let Some(native) = native {
                let rgb = match converter.to_rgb32(&native) {
                    Ok(rgb) => rgb,
                    Err(err) => {
                        log::error!("stream render: RGB conversion failed: {err:#}");
                        return;
                    }
                };
                if !hand_off_frame(ctx, rgb) {
                    break;
                }
            }
            if consumed == 0 {
                break;
            }
            data = &data[consumed..];
        }
    }
}

/// Services pause and finish requests between frames. Returns false when the
/// thread should exit.
fn process_pause_fin(ctx: &AuxCtx) -> bool {
    let mut shared = ctx.shared.lock();
    if shared.status == AuxStatus::FinReq {
        log::debug!("stream render: finish requested, decode thread exiting");
        shared.status = AuxStatus::FinRsp;
        ctx.cond.notify_all();
        return false;
    }
    while matches!(shared.status, AuxStatus::PauseReq | AuxStatus::PauseRsp) {
        log::debug!("stream render: pause requested, decode thread waiting");
        shared.status = AuxStatus::PauseRsp;
        ctx.cond.notify_all();
        ctx.cond.wait(&mut shared);
        if shared.status == AuxStatus::FinReq {
            shared.status = AuxStatus::FinRsp;
            ctx.cond.notify_all();
            return false;
        }
    }
    shared.status = AuxStatus::RunRsp;
    true
}

fn read_encoded_frame(ctx: &AuxCtx, socket: Option<&mut TcpStream>) -> ReadOutcome {
    match socket {
        Some(socket) => match EncodedFrame::read_from(socket) {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(err) => ReadOutcome::Failed(err.context("reading sidecar frame")),
        },
        None => {
            let payload = {
                let mut shared = ctx.shared.lock();
                loop {
                    if shared.status == AuxStatus::FinReq {
                        log::debug!("stream render: finish requested, decode thread exiting");
                        shared.status = AuxStatus::FinRsp;
                        ctx.cond.notify_all();
                        return ReadOutcome::Finish;
                    }
                    if let Some(payload) = shared.msgq.pop_front() {
                        break payload;
                    }
                    if shared.status == AuxStatus::PauseReq {
                        shared.status = AuxStatus::PauseRsp;
                        ctx.cond.notify_all();
                    }
                    ctx.cond.wait(&mut shared);
                }
            };
            match EncodedFrame::from_payload(&payload) {
                Ok(frame) => ReadOutcome::Frame(frame),
                Err(err) => ReadOutcome::Failed(err.context("parsing in-band frame")),
            }
        }
    }
}

/// Publishes one RGB frame for the UI thread and blocks until it was
/// presented. Returns false when a pause or finish request preempted the
/// hand-off.
fn hand_off_frame(ctx: &AuxCtx, rgb: RgbFrame) -> bool {
    let mut shared = ctx.shared.lock();
    if matches!(shared.status, AuxStatus::PauseReq | AuxStatus::FinReq) {
        log::debug!("stream render: pause or finish requested, skipping hand-off");
        return false;
    }
    shared.handoff.frame = Some(PendingFrame {
        dest: Rect::from_size(0, 0, rgb.width, rgb.height),
        stride: rgb.stride,
        data: rgb.data,
    });
    ctx.waker.wake();
    while shared.handoff.frame.is_some() || shared.handoff.busy {
        if shared.status == AuxStatus::FinReq {
            return false;
        }
        ctx.cond.wait(&mut shared);
    }
    true
}

impl DisplayChannel {
    /// Spawns (or re-spawns) the accelerated pipeline per the settings
    /// snapshot, resolving the sidecar target when one is configured.
    pub(crate) fn aux_start(&mut self) {
        let target = match self.aux.as_ref() {
            None => return,
            Some(aux) if aux.settings.stream_port > 0 && !aux.in_band => {
                let settings = aux.settings;
                match self.aux_sidecar_target(&settings) {
                    Some(target) => Some(target),
                    None => {
                        log::error!("stream render: no usable stream port, pipeline disabled");
                        return;
                    }
                }
            }
            Some(_) => None,
        };
        if let Some(aux) = self.aux.as_mut() {
            aux.start(target);
        }
    }

    fn aux_sidecar_target(&self, settings: &StreamSettings) -> Option<SidecarTarget> {
        let base_port = match self.session.tls_port().or(self.session.main_port()) {
            Some(port) => port,
            None => {
                log::error!("stream render: session has no main or tls port");
                return None;
            }
        };
        let port = if settings.stream_port > 1000 {
            u16::try_from(settings.stream_port).ok()?
        } else {
            u16::try_from(base_port as i64 + settings.stream_port as i64).ok()?
        };

        let mut host = self.session.host();
        if host == "localhost" {
            host = "127.0.0.1".to_string();
        }
        let handshake = format!(
            "stream_port={}\nstream_onMovieDetection={}\non_variation_capture={}\nmax_sampling_fps={}\n",
            settings.stream_port,
            settings.stream_on_movie_detection,
            settings.on_variation_capture,
            settings.max_sampling_fps
        );
        log::info!("stream render: target {host}:{port}");
        Some(SidecarTarget {
            host,
            port,
            handshake,
        })
    }

    pub(crate) fn handle_stream_config(&mut self, config: &StreamConfig) {
        let Some(aux) = self.aux.as_mut() else {
            return;
        };
        log::info!(
            "server stream config: port {}, on_movie_detection {}, on_variation_capture {}, \
             max_sampling_fps {}",
            config.stream_port,
            config.on_movie_detection,
            config.on_variation_capture,
            config.max_sampling_fps
        );

        // The server reuses the first two config fields to carry its
        // negotiated protocol level.
        aux.major_protocol = config.on_movie_detection as i32;
        aux.minor_protocol = config.on_variation_capture as i32;
        log::debug!(
            "stream render: protocol level {}.{}",
            aux.major_protocol,
            aux.minor_protocol
        );
        aux.reload_settings();

        if aux.settings.stream_port == 0 {
            aux.in_band = true;
            let settings = aux.settings;
            self.outbox.push_back(ClientMsg::StreamConfig(StreamConfig {
                stream_port: settings.stream_port,
                on_movie_detection: settings.stream_on_movie_detection as u32,
                on_variation_capture: settings.on_variation_capture as u32,
                max_sampling_fps: settings.max_sampling_fps as u32,
            }));
        }
    }

    pub(crate) fn handle_stream_frame_data(&mut self, frame: StreamFrameData) {
        let Some(aux) = self.aux.as_mut() else {
            return;
        };

        if frame.media_time == 0 || aux.settings.audio_sync_not == 1 {
            aux.send_to_decoder(frame.data);
            return;
        }

        if aux.expected_sequence != 0 {
            aux.expected_sequence = aux.expected_sequence.wrapping_add(1);
            if frame.sequence != aux.expected_sequence {
                log::debug!(
                    "stream render: sequence jump ({} expected {}), resetting schedule",
                    frame.sequence,
                    aux.expected_sequence
                );
                aux.reset_schedule(&mut self.timers);
            }
        }
        if aux.expected_sequence == 0 {
            aux.expected_sequence = frame.sequence;
        }

        let decoder_backlog = aux.decoder_queue_len();
        let latency_backlog = aux.latency_queue.len();
        if decoder_backlog + latency_backlog >= BACKLOG_REPORT_THRESHOLD {
            if aux.major_protocol >= 2
                && aux
                    .last_stat
                    .map(|at| at.elapsed() >= STAT_INTERVAL)
                    .unwrap_or(true)
            {
                self.outbox.push_back(ClientMsg::StreamStatData {
                    backlog_size: (decoder_backlog + latency_backlog) as u32,
                });
                aux.last_stat = Some(Instant::now());
            }
            log::info!(
                "stream render: backlog decoder {decoder_backlog}, latency {latency_backlog}"
            );
        }

        aux.latency_queue.push_back(frame);
        self.schedule_aux_frame();
    }

    /// Arms the latency timer for the head of the in-band queue, delaying
    /// frames to line up with audio playback when it is active.
    pub(crate) fn schedule_aux_frame(&mut self) {
        let mm_time = self.session.mm_time().unwrap_or(0);
        let audio_delay = if self.session.playback_active() {
            self.session.playback_latency_ms()
        } else {
            0
        };

        let Some(aux) = self.aux.as_mut() else {
            return;
        };
        if aux.timer.is_some() {
            return;
        }
        let Some(head) = aux.latency_queue.front() else {
            return;
        };

        let mut latency = head.media_time as i64 - mm_time as i64;
        if audio_delay > 0 {
            latency = head.media_time as i64 + 400 + 15 - audio_delay as i64 - mm_time as i64 + 80;
        }
        if latency < 0 {
            if audio_delay > 0 {
                log::info!(
                    "stream render: frame late by {} ms (ts: {}, mmtime: {}, audio delay: {})",
                    -latency,
                    head.media_time,
                    mm_time,
                    audio_delay
                );
            }
            latency = 0;
        }
        log::debug!("stream render: video latency {latency} ms");

        aux.timer = Some(self.timers.arm(
            Duration::from_millis(latency as u64),
            TimerToken::AuxDispatch,
        ));
    }

    /// Latency-timer callback: moves the head frame to the decoder queue.
    pub(crate) fn aux_dispatch(&mut self) {
        let Some(aux) = self.aux.as_mut() else {
            return;
        };
        aux.timer = None;
        if let Some(frame) = aux.latency_queue.pop_front() {
            aux.send_to_decoder(frame.data);
            self.schedule_aux_frame();
        }
    }

    /// Presents the decode thread's pending frame on the primary surface.
    /// Called by the host UI after a wake; a no-op when nothing is pending.
    pub fn present_aux_frame(&mut self) {
        let Some(frame) = self.aux.as_ref().and_then(|aux| aux.take_pending_frame()) else {
            return;
        };

        if let Some(surface) = self.surfaces.find_mut(0) {
            surface.canvas.put_image(
                &frame.dest,
                PixmapRef {
                    data: &frame.data,
                    width: frame.dest.width(),
                    height: frame.dest.height(),
                    stride: frame.stride as isize,
                },
                None,
            );
        } else {
            log::warn!("stream render: primary surface missing, dropping frame");
        }
        self.events.push_back(DisplayEvent::Invalidate(frame.dest));

        if let Some(aux) = self.aux.as_ref() {
            aux.presentation_done();
        }
    }

    /// Whether the accelerated pipeline's decode thread is running.
    pub fn aux_thread_alive(&self) -> bool {
        self.aux
            .as_ref()
            .map(|aux| aux.thread_alive())
            .unwrap_or(false)
    }

    /// Parks the decode thread (e.g. while the widget is hidden).
    pub fn pause_stream_render(&self) {
        if let Some(aux) = self.aux.as_ref() {
            aux.pause();
        }
    }

    pub fn resume_stream_render(&self) {
        if let Some(aux) = self.aux.as_ref() {
            aux.resume();
        }
    }
}
