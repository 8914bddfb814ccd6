//! The display channel: message dispatch, surface lifecycle, the mark state
//! machine, and the monitors layout.

use std::collections::{HashSet, VecDeque};
use std::env;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use mirador_canvas::{
    CanvasConfig, CanvasFactory, DecoderFactory, PixelBuffer, ShmAllocator, SurfaceDecoders,
};
use mirador_canvas::codec::StreamCodecFactory;
use mirador_protocol::messages::{
    Capability, ClientMsg, DisplayMsg, ImageCompression, MonitorHead, SurfaceFormat,
};

use crate::cache::{ImageCache, PaletteCache};
use crate::events::DisplayEvent;
use crate::session::{MessagePump, PumpStatus, Session};
use crate::stream::StreamTable;
use crate::stream_render::{AuxPipelineOptions, StreamRender};
use crate::surface::{PrimaryInfo, Surface, SurfaceRegistry};
use crate::timer::{TimerId, TimerQueue, TimerToken};

/// Setting this variable withholds the stream-report capability and stops
/// all QoS reporting.
pub const DISABLE_ADAPTIVE_STREAMING_ENV: &str = "MIRADOR_DISABLE_ADAPTIVE_STREAMING";

const MONITORS_MAX: u32 = 256;

/// Everything the channel needs from its owner at construction time.
pub struct ChannelConfig {
    pub channel_id: u8,
    pub session: Rc<dyn Session>,
    pub canvas_factory: Rc<dyn CanvasFactory>,
    pub decoder_factory: Rc<dyn DecoderFactory>,
    pub stream_codecs: Rc<dyn StreamCodecFactory>,
    pub shm: Box<dyn ShmAllocator>,
    /// Overrides the environment-driven adaptive-streaming switch.
    pub adaptive_streaming: Option<bool>,
    /// When present, the accelerated pipeline is wired up.
    pub aux: Option<AuxPipelineOptions>,
}

pub struct DisplayChannel {
    pub(crate) channel_id: u8,
    pub(crate) session: Rc<dyn Session>,
    pub(crate) canvas_factory: Rc<dyn CanvasFactory>,
    pub(crate) decoder_factory: Rc<dyn DecoderFactory>,
    pub(crate) stream_codecs: Rc<dyn StreamCodecFactory>,
    pub(crate) shm: Box<dyn ShmAllocator>,

    pub(crate) surfaces: SurfaceRegistry,
    pub(crate) images: Arc<ImageCache>,
    pub(crate) palettes: Arc<PaletteCache>,
    pub(crate) streams: StreamTable,
    pub(crate) monitors: Vec<MonitorHead>,
    pub(crate) monitors_max: u32,

    pub(crate) mark: bool,
    pub(crate) mark_false_timer: Option<TimerId>,

    pub(crate) report: String,
    pub(crate) adaptive_streaming: bool,
    advertised_caps: Vec<Capability>,
    negotiated_caps: HashSet<Capability>,

    pub(crate) timers: TimerQueue,
    pub(crate) events: VecDeque<DisplayEvent>,
    pub(crate) outbox: VecDeque<ClientMsg>,

    pub(crate) aux: Option<StreamRender>,
}

impl DisplayChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let adaptive_streaming = config.adaptive_streaming.unwrap_or_else(|| {
            if env::var_os(DISABLE_ADAPTIVE_STREAMING_ENV).is_some() {
                log::debug!("adaptive video disabled");
                false
            } else {
                true
            }
        });

        let mut advertised_caps = vec![
            Capability::SizedStream,
            Capability::MonitorsConfig,
            Capability::Composite,
            Capability::A8Surface,
        ];
        #[cfg(feature = "lz4")]
        advertised_caps.push(Capability::Lz4Compression);
        if adaptive_streaming {
            advertised_caps.push(Capability::StreamReport);
        }

        let mut channel = Self {
            channel_id: config.channel_id,
            images: config.session.image_cache(),
            session: config.session,
            canvas_factory: config.canvas_factory,
            decoder_factory: config.decoder_factory,
            stream_codecs: config.stream_codecs,
            shm: config.shm,
            surfaces: SurfaceRegistry::new(),
            palettes: Arc::new(PaletteCache::new()),
            streams: StreamTable::new(),
            monitors: Vec::new(),
            monitors_max: 1,
            mark: false,
            mark_false_timer: None,
            report: String::new(),
            adaptive_streaming,
            advertised_caps,
            negotiated_caps: HashSet::new(),
            timers: TimerQueue::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
            aux: config.aux.map(StreamRender::new),
        };
        channel.aux_start();
        channel
    }

    /// Sent once the channel link is up.
    pub fn channel_up(&mut self) {
        let cache_size = self.session.cache_size_bytes();
        let glz_size = self.session.glz_window_bytes();
        log::debug!("display up: cache size {cache_size}, glz window {glz_size} (bytes)");
        self.outbox.push_back(ClientMsg::DisplayInit {
            pixmap_cache_id: 1,
            pixmap_cache_size: cache_size / 4,
            glz_dictionary_id: 1,
            glz_dictionary_window_size: glz_size / 4,
        });
        self.events.push_back(DisplayEvent::MonitorsChanged);

        let preferred = self.session.preferred_compression();
        if self.has_negotiated(Capability::PreferredCompression)
            && preferred != ImageCompression::Invalid
        {
            self.outbox.push_back(ClientMsg::PreferredCompression {
                compression: preferred,
            });
        }
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.advertised_caps
    }

    pub fn set_negotiated_capabilities(&mut self, caps: &[Capability]) {
        self.negotiated_caps = caps.iter().copied().collect();
    }

    pub(crate) fn has_negotiated(&self, cap: Capability) -> bool {
        self.negotiated_caps.contains(&cap)
    }

    /// Routes one parsed server message. The pump is driven while a handler
    /// suspends on a cache wait or a cross-channel barrier.
    pub fn handle_msg(&mut self, msg: DisplayMsg, pump: &mut dyn MessagePump) {
        match msg {
            DisplayMsg::Mode { x_res, y_res, bits } => self.handle_mode(x_res, y_res, bits),
            DisplayMsg::Mark => self.handle_mark(),
            DisplayMsg::Reset => self.handle_reset(),
            DisplayMsg::CopyBits { base, src_pos } => self.handle_copy_bits(&base, src_pos),
            DisplayMsg::InvalList(resources) => self.handle_inval_list(&resources),
            DisplayMsg::InvalAllPixmaps { wait } => {
                if pump.wait_for_channels(&wait) == PumpStatus::Cancelled {
                    log::debug!("inval-all-pixmaps barrier cancelled");
                    return;
                }
                self.images.clear();
            }
            DisplayMsg::InvalPalette { id } => {
                self.palettes.remove(id);
            }
            DisplayMsg::InvalAllPalettes => self.palettes.clear(),
            DisplayMsg::StreamCreate(create) => self.handle_stream_create(&create),
            DisplayMsg::StreamData(data) => self.handle_stream_data(data),
            DisplayMsg::StreamClip { id, clip } => self.handle_stream_clip(id, clip),
            DisplayMsg::StreamDestroy { id } => self.destroy_stream(id),
            DisplayMsg::StreamDestroyAll => self.clear_streams(),
            DisplayMsg::StreamDataSized(data) => self.handle_stream_data_sized(data),
            DisplayMsg::StreamActivateReport(msg) => self.handle_stream_activate_report(&msg),
            DisplayMsg::Draw { base, op } => self.handle_draw(&base, &op),
            DisplayMsg::SurfaceCreate {
                surface_id,
                format,
                width,
                height,
                primary,
            } => self.handle_surface_create(surface_id, format, width, height, primary),
            DisplayMsg::SurfaceDestroy { surface_id } => self.handle_surface_destroy(surface_id),
            DisplayMsg::MonitorsConfig { max_allowed, heads } => {
                self.handle_monitors_config(max_allowed, &heads)
            }
            DisplayMsg::StreamConfig(config) => self.handle_stream_config(&config),
            DisplayMsg::StreamFrameData(frame) => self.handle_stream_frame_data(frame),
        }
    }

    /// Fires one timer token. Any still-pending queue entry for the same
    /// target is cancelled first, so direct calls stay consistent with
    /// [`poll_timers`](Self::poll_timers).
    pub fn on_timer(&mut self, token: TimerToken) {
        match token {
            TimerToken::StreamRender(id) => {
                if let Some(stream) = self.streams.get_mut(id) {
                    if let Some(timer) = stream.timer.take() {
                        self.timers.cancel(timer);
                    }
                }
                self.render_stream(id);
            }
            TimerToken::MarkFalse => {
                if let Some(timer) = self.mark_false_timer.take() {
                    self.timers.cancel(timer);
                }
                self.mark = false;
                self.events.push_back(DisplayEvent::Mark(false));
            }
            TimerToken::AuxDispatch => {
                let pending = self.aux.as_mut().and_then(|aux| aux.timer.take());
                if let Some(timer) = pending {
                    self.timers.cancel(timer);
                }
                self.aux_dispatch();
            }
        }
    }

    /// Fires every due timer; returns how many fired.
    pub fn poll_timers(&mut self) -> usize {
        let due = self.timers.take_due(Instant::now());
        let count = due.len();
        for (_, token) in due {
            self.on_timer(token);
        }
        count
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Pending timers with the delay each was armed with.
    pub fn pending_timers(&self) -> Vec<(TimerToken, Duration)> {
        self.timers
            .pending()
            .map(|(_, token, delay)| (token, delay))
            .collect()
    }

    pub fn palette_cache(&self) -> &Arc<PaletteCache> {
        &self.palettes
    }

    pub fn drain_events(&mut self) -> Vec<DisplayEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_outbox(&mut self) -> Vec<ClientMsg> {
        self.outbox.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Observable properties

    pub fn width(&self) -> u32 {
        self.surfaces.primary().map(|s| s.width).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.surfaces.primary().map(|s| s.height).unwrap_or(0)
    }

    pub fn monitors(&self) -> &[MonitorHead] {
        &self.monitors
    }

    pub fn monitors_max(&self) -> u32 {
        self.monitors_max
    }

    pub fn stream_report(&self) -> &str {
        &self.report
    }

    pub fn mark(&self) -> bool {
        self.mark
    }

    /// Details of the primary surface, if one exists.
    pub fn primary(&self) -> Option<PrimaryInfo> {
        self.surfaces.primary().map(|surface| PrimaryInfo {
            format: surface.format,
            width: surface.width,
            height: surface.height,
            stride: surface.stride,
            shmid: surface.buffer.shmid(),
            marked: self.mark,
        })
    }

    /// Runs `f` over the primary's pixel bytes (heap or mapped shm).
    pub fn with_primary_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.surfaces.primary().map(|s| s.buffer.with_bytes(f))
    }

    // ------------------------------------------------------------------
    // Surfaces and the mark state machine

    pub(crate) fn handle_mode(&mut self, x_res: u32, y_res: u32, bits: u32) {
        if self.mark {
            log::warn!("mode change while display is marked");
        }
        let format = if bits == 32 {
            SurfaceFormat::Rgb32
        } else {
            SurfaceFormat::Rgb16_555
        };
        if let Err(err) = self.create_surface(0, format, x_res, y_res, true) {
            log::warn!("mode surface creation failed: {err:#}");
        }
    }

    pub(crate) fn handle_mark(&mut self) {
        if self.surfaces.primary().is_none() {
            log::warn!("mark without a primary surface");
            return;
        }
        self.mark = true;
        self.events.push_back(DisplayEvent::Mark(true));
    }

    pub(crate) fn handle_reset(&mut self) {
        if let Some(primary) = self.surfaces.primary_mut() {
            primary.canvas.clear();
        }
        self.palettes.clear();
        self.mark = false;
        self.events.push_back(DisplayEvent::Mark(false));
    }

    pub(crate) fn handle_surface_create(
        &mut self,
        surface_id: u32,
        format: SurfaceFormat,
        width: u32,
        height: u32,
        primary: bool,
    ) {
        if let Err(err) = self.create_surface(surface_id, format, width, height, primary) {
            log::warn!("surface {surface_id} creation failed: {err:#}");
            return;
        }
        if primary {
            if let Some(timer) = self.mark_false_timer.take() {
                self.timers.cancel(timer);
            }
        }
    }

    pub(crate) fn create_surface(
        &mut self,
        surface_id: u32,
        format: SurfaceFormat,
        width: u32,
        height: u32,
        primary: bool,
    ) -> Result<()> {
        let stride = width * 4;
        let size = height as usize * stride as usize;

        let buffer = if primary {
            if let Some(existing) = self.surfaces.primary() {
                if existing.width == width && existing.height == height {
                    log::debug!("reusing existing primary surface");
                    return Ok(());
                }
                let old_id = existing.id;
                self.events.push_back(DisplayEvent::PrimaryDestroy);
                self.surfaces.remove(old_id);
            }
            log::debug!("create primary canvas");
            match self.shm.alloc(size) {
                Some(segment) => PixelBuffer::shared(segment, size),
                None => PixelBuffer::heap(size),
            }
        } else {
            PixelBuffer::heap(size)
        };

        let decoders = SurfaceDecoders {
            dictionary: self
                .decoder_factory
                .lossless_dictionary(&self.session.glz_window()),
            deflate: self.decoder_factory.deflate(),
            jpeg: self.decoder_factory.jpeg(),
        };
        let canvas = self
            .canvas_factory
            .create_canvas(CanvasConfig {
                format,
                width,
                height,
                stride,
                buffer: buffer.clone(),
                images: self.images.clone(),
                palettes: self.palettes.clone(),
                decoders,
            })
            .context("creating canvas")?;

        let shmid = buffer.shmid();
        self.surfaces.insert(Surface {
            id: surface_id,
            format,
            width,
            height,
            stride,
            primary,
            buffer,
            canvas,
        });

        if primary {
            self.events.push_back(DisplayEvent::PrimaryCreate {
                format,
                width,
                height,
                stride,
                shmid,
            });
            if !self.has_negotiated(Capability::MonitorsConfig) {
                self.monitors = vec![MonitorHead {
                    id: 0,
                    surface_id,
                    x: 0,
                    y: 0,
                    width,
                    height,
                }];
                self.events.push_back(DisplayEvent::MonitorsChanged);
            }
        }
        Ok(())
    }

    pub(crate) fn handle_surface_destroy(&mut self, surface_id: u32) {
        let Some(surface) = self.surfaces.find(surface_id) else {
            // Destroys for ids the server already tore down arrive routinely.
            return;
        };

        if surface.primary {
            log::debug!("primary destroy on channel {}", self.channel_id);
            if self.channel_id != 0 && self.mark_false_timer.is_none() {
                self.mark_false_timer =
                    Some(self.timers.arm(Duration::from_secs(1), TimerToken::MarkFalse));
            }
            self.events.push_back(DisplayEvent::PrimaryDestroy);
        }
        self.surfaces.remove(surface_id);
    }

    pub(crate) fn clear_surfaces(&mut self, keep_primary: bool) {
        if keep_primary {
            if self.surfaces.primary_id().is_some() {
                log::debug!("keeping existing primary surface, migration or reset");
            }
        } else if self.surfaces.primary_id().is_some() {
            self.events.push_back(DisplayEvent::PrimaryDestroy);
        }
        self.surfaces.clear(keep_primary);
    }

    // ------------------------------------------------------------------
    // Monitors config

    pub(crate) fn handle_monitors_config(&mut self, max_allowed: u32, heads: &[MonitorHead]) {
        if heads.is_empty() {
            log::warn!("monitors config without heads");
            return;
        }
        log::debug!(
            "new monitors config from guest: n: {}/{}",
            heads.len(),
            max_allowed
        );

        self.monitors_max = max_allowed;
        if !(1..=MONITORS_MAX).contains(&self.monitors_max) {
            log::warn!("monitors config max_allowed out of range, clamping");
            self.monitors_max = self.monitors_max.clamp(1, MONITORS_MAX);
        }

        let mut count = heads.len() as u32;
        if !(1..=self.monitors_max).contains(&count) {
            log::warn!("monitors config count out of range, clamping");
            count = count.clamp(1, self.monitors_max);
        }

        self.monitors.clear();
        for head in &heads[..count as usize] {
            log::debug!(
                "monitor id: {}, surface id: {}, +{}+{}-{}x{}",
                head.id,
                head.surface_id,
                head.x,
                head.y,
                head.width,
                head.height
            );
            self.monitors.push(*head);
        }
        self.events.push_back(DisplayEvent::MonitorsChanged);
    }

    // ------------------------------------------------------------------
    // Reset and teardown

    /// Channel reset: drop per-channel display state, keep the primary, and
    /// restart the accelerated pipeline. The session clears the shared
    /// caches itself.
    pub fn reset(&mut self) {
        log::debug!("display channel reset");
        if let Some(aux) = self.aux.as_mut() {
            aux.shutdown(&mut self.timers);
            aux.reload_settings();
            aux.in_band = aux.settings.stream_port == 0;
        }
        self.clear_streams();
        self.clear_surfaces(true);
        self.timers.cancel_all();
        self.mark_false_timer = None;
        self.aux_start();
    }

    /// Final teardown: reset plus destruction of everything, including the
    /// primary and the accelerated pipeline.
    pub fn dispose(&mut self) {
        if let Some(timer) = self.mark_false_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(mut aux) = self.aux.take() {
            aux.shutdown(&mut self.timers);
        }
        self.clear_streams();
        self.clear_surfaces(false);
        self.palettes.clear();
        self.timers.cancel_all();
    }
}
