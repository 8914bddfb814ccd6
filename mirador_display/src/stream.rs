//! Server-driven video streams: the sparse stream table, the per-stream
//! frame queue, and the presentation scheduler running against the session
//! media clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mirador_canvas::codec::StreamFrameDecoder;
use mirador_canvas::PixmapRef;
use mirador_protocol::geometry::{Clip, Rect, Region};
use mirador_protocol::messages::{
    StreamActivateReport, StreamCreate, StreamData, StreamDataSized, StreamFlags, VideoCodec,
};

use crate::channel::DisplayChannel;
use crate::events::DisplayEvent;
use crate::timer::{TimerId, TimerToken};

/// Destination carried by a sized frame, overriding the create defaults.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SizedInfo {
    pub dest: Rect,
    pub width: u32,
    pub height: u32,
}

pub(crate) struct QueuedFrame {
    pub media_time: u32,
    pub sized: Option<SizedInfo>,
    pub data: Vec<u8>,
}

/// Snapshot of a stream's playback counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub num_input_frames: u32,
    pub num_drops_on_receive: u32,
    pub num_drops_on_playback: u32,
    pub queued_frames: usize,
    pub timer_armed: bool,
}

/// One finished run of consecutive drops-on-receive.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DropsSeqStats {
    pub start_mm_time: u32,
    pub len: u32,
    pub duration: u32,
}

/// QoS window state, active after a stream-activate-report message.
pub(crate) struct ReportState {
    pub unique_id: u32,
    pub max_window: u32,
    pub timeout: Duration,
    pub start_time: Option<Instant>,
    pub start_frame_mm_time: u32,
    pub num_frames: u32,
    pub num_drops: u32,
    pub drops_seq_len: u32,
}

pub(crate) struct VideoStream {
    pub codec: VideoCodec,
    pub surface_id: u32,
    pub flags: StreamFlags,
    pub dest: Rect,
    pub width: u32,
    pub height: u32,
    pub clip: Clip,
    pub region: Option<Region>,
    pub msgq: VecDeque<QueuedFrame>,
    pub timer: Option<TimerId>,
    pub decoder: Box<dyn StreamFrameDecoder>,
    pub dst_rect: Rect,
    pub hw_accel: bool,

    pub first_frame_mm_time: u32,
    pub num_input_frames: u32,
    pub arrive_late_time: u64,
    pub num_drops_on_receive: u32,
    pub num_drops_on_playback: u32,
    pub decoded_frames: u32,
    pub acum_decode_time_ms: u64,
    pub fskip_level: u8,
    pub fskip_frame: u8,
    pub cur_drops_seq: DropsSeqStats,
    pub drops_seqs: Vec<DropsSeqStats>,
    pub playback_sync_drops_seq_len: u32,
    pub report: Option<ReportState>,
}

impl VideoStream {
    fn new(create: &StreamCreate, decoder: Box<dyn StreamFrameDecoder>) -> Self {
        let mut stream = Self {
            codec: create.codec,
            surface_id: create.surface_id,
            flags: create.flags,
            dest: create.dest,
            width: create.stream_width,
            height: create.stream_height,
            clip: create.clip.clone(),
            region: None,
            msgq: VecDeque::new(),
            timer: None,
            decoder,
            dst_rect: Rect::default(),
            hw_accel: false,
            first_frame_mm_time: 0,
            num_input_frames: 0,
            arrive_late_time: 0,
            num_drops_on_receive: 0,
            num_drops_on_playback: 0,
            decoded_frames: 0,
            acum_decode_time_ms: 0,
            fskip_level: 0,
            fskip_frame: 0,
            cur_drops_seq: DropsSeqStats::default(),
            drops_seqs: Vec::new(),
            playback_sync_drops_seq_len: 0,
            report: None,
        };
        stream.update_region();
        stream
    }

    pub fn update_region(&mut self) {
        self.region = self.clip.to_region();
    }
}

/// Decode-time thresholds mapping to frame-skip levels.
pub(crate) fn fskip_level_for(decode_ms: u64) -> u8 {
    if decode_ms > 120 {
        3
    } else if decode_ms > 80 {
        2
    } else if decode_ms > 40 {
        1
    } else {
        0
    }
}

/// Sparse growable array of streams, keyed by stream id.
#[derive(Default)]
pub(crate) struct StreamTable {
    slots: Vec<Option<Box<VideoStream>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn ensure_slot(&mut self, id: u32) {
        let id = id as usize;
        if id < self.slots.len() {
            return;
        }
        let mut len = self.slots.len().max(1);
        while id >= len {
            len *= 2;
        }
        self.slots.resize_with(len, || None);
    }

    pub fn create(&mut self, id: u32, stream: Box<VideoStream>) -> Result<(), ()> {
        self.ensure_slot(id);
        let slot = &mut self.slots[id as usize];
        if slot.is_some() {
            return Err(());
        }
        *slot = Some(stream);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&VideoStream> {
        self.slots.get(id as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut VideoStream> {
        self.slots.get_mut(id as usize)?.as_deref_mut()
    }

    pub fn take(&mut self, id: u32) -> Option<Box<VideoStream>> {
        self.slots.get_mut(id as usize)?.take()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }
}

impl DisplayChannel {
    pub(crate) fn handle_stream_create(&mut self, create: &StreamCreate) {
        log::debug!(
            "stream create: id {} (table size {})",
            create.id,
            self.streams.capacity()
        );

        let decoder = match self.stream_codecs.create(create.codec) {
            Ok(decoder) => decoder,
            Err(err) => {
                log::warn!("stream {}: no decoder for {:?}: {err:#}", create.id, create.codec);
                return;
            }
        };

        let stream = Box::new(VideoStream::new(create, decoder));
        let hw_accel = stream.hw_accel;
        if self.streams.create(create.id, stream).is_err() {
            log::warn!("stream create for occupied id {}", create.id);
            return;
        }

        self.report = format!(
            "HW accel {}, decode: 0ms, dropped 0, in rate 0, out rate 0",
            if hw_accel { "on" } else { "off" }
        );
        self.events.push_back(DisplayEvent::StreamReportChanged);
    }

    /// Arms the presentation timer for the head frame, dropping any heads
    /// that already missed their media time.
    pub(crate) fn schedule_stream(&mut self, id: u32) {
        loop {
            let mm_time = self.session.mm_time();
            let Some(stream) = self.streams.get_mut(id) else {
                return;
            };
            if stream.timer.is_some() {
                return;
            }
            let Some(head) = stream.msgq.front() else {
                return;
            };

            let delay_ms = match mm_time {
                None => 0,
                Some(now) if now < head.media_time => (head.media_time - now) as u64,
                Some(now) => {
                    log::debug!(
                        "stream {id}: rendering too late by {} ms (ts: {}, mmtime: {}), dropping",
                        now - head.media_time,
                        head.media_time,
                        now
                    );
                    stream.msgq.pop_front();
                    stream.num_drops_on_playback += 1;
                    if stream.msgq.is_empty() {
                        return;
                    }
                    continue;
                }
            };

            log::debug!("stream {id}: scheduling next render in {delay_ms} ms");
            stream.timer = Some(self.timers.arm(
                Duration::from_millis(delay_ms),
                TimerToken::StreamRender(id),
            ));
            return;
        }
    }

    /// Timer callback: pops and presents frames until the queue drains or a
    /// new timer is armed for a future frame.
    pub(crate) fn render_stream(&mut self, id: u32) {
        if let Some(stream) = self.streams.get_mut(id) {
            stream.timer = None;
        }

        loop {
            let Some(stream) = self.streams.get_mut(id) else {
                return;
            };
            let Some(frame) = stream.msgq.pop_front() else {
                log::warn!("stream {id}: render with empty queue");
                return;
            };

            if stream.fskip_frame == 0 {
                let started = Instant::now();

                let last_dest = stream.dst_rect;
                let (dest, width, height) = match &frame.sized {
                    Some(sized) => (sized.dest, sized.width, sized.height),
                    None => (stream.dest, stream.width, stream.height),
                };
                stream.dst_rect = dest;
                let hull = last_dest.union(&dest);

                let decoded = match stream.codec {
                    VideoCodec::Mjpeg => stream.decoder.decode_frame(&frame.data, width, height),
                };
                let rgb = match decoded {
                    Ok(rgb) => rgb,
                    Err(err) => {
                        log::warn!("stream {id}: frame decode failed: {err:#}");
                        None
                    }
                };

                let surface_id = stream.surface_id;
                let top_down = stream.flags.top_down();
                let region = stream.region.clone();

                let mut primary = false;
                if let Some(surface) = self.surfaces.find_mut(surface_id) {
                    primary = surface.primary;
                    if let Some(rgb) = &rgb {
                        let stride = (width * 4) as isize;
                        let stride = if top_down { stride } else { -stride };
                        surface.canvas.put_image(
                            &dest,
                            PixmapRef {
                                data: rgb,
                                width,
                                height,
                                stride,
                            },
                            region.as_ref(),
                        );
                    }
                }
                if primary {
                    self.events.push_back(DisplayEvent::Invalidate(hull));
                }

                let decode_ms = started.elapsed().as_millis() as u64;
                let Some(stream) = self.streams.get_mut(id) else {
                    return;
                };
                stream.acum_decode_time_ms += decode_ms;
                stream.decoded_frames += 1;
                let new_level = fskip_level_for(decode_ms);
                if stream.fskip_level != new_level {
                    log::debug!("stream {id}: fskip level {new_level} - decode time {decode_ms} ms");
                    stream.fskip_level = new_level;
                }
                stream.fskip_frame = stream.fskip_level;
            } else {
                stream.fskip_frame -= 1;
            }

            let Some(stream) = self.streams.get(id) else {
                return;
            };
            if stream.msgq.is_empty() {
                return;
            }
            self.schedule_stream(id);
            let armed = self
                .streams
                .get(id)
                .map(|s| s.timer.is_some())
                .unwrap_or(true);
            if armed {
                return;
            }
            let drained = self
                .streams
                .get(id)
                .map(|s| s.msgq.is_empty())
                .unwrap_or(true);
            if drained {
                return;
            }
        }
    }

    /// Cancels and re-arms the stream's timer against the current clock.
    pub(crate) fn reset_rendering_timer(&mut self, id: u32) {
        if let Some(stream) = self.streams.get_mut(id) {
            if let Some(timer) = stream.timer.take() {
                self.timers.cancel(timer);
            }
        }
        self.schedule_stream(id);
    }

    /// The session's media clock was replaced (e.g. migration); every stream
    /// re-evaluates its queue against the new clock.
    pub fn mm_time_reset(&mut self) {
        for id in self.streams.ids() {
            log::debug!("mm-time reset: stream {id}");
            self.reset_rendering_timer(id);
        }
    }

    /// Detects a clock rewind: a new frame older than the queue tail flushes
    /// the queue before the frame is enqueued.
    fn test_frames_mm_time_reset(&mut self, id: u32, new_media_time: u32) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        let Some(tail) = stream.msgq.back() else {
            return;
        };
        if new_media_time < tail.media_time {
            log::debug!(
                "stream {id}: new frame time {} < tail time {}, resetting",
                new_media_time,
                tail.media_time
            );
            stream.msgq.clear();
            self.reset_rendering_timer(id);
        }
    }

    pub(crate) fn handle_stream_data(&mut self, data: StreamData) {
        self.stream_frame_arrived(data.id, data.media_time, None, data.data);
    }

    pub(crate) fn handle_stream_data_sized(&mut self, data: StreamDataSized) {
        log::debug!("stream {} contains sized data", data.id);
        let sized = SizedInfo {
            dest: data.dest,
            width: data.width,
            height: data.height,
        };
        self.stream_frame_arrived(data.id, data.media_time, Some(sized), data.data);
    }

    fn stream_frame_arrived(
        &mut self,
        id: u32,
        media_time: u32,
        sized: Option<SizedInfo>,
        data: Vec<u8>,
    ) {
        let mm_time = self.session.mm_time();
        if self.streams.get(id).is_none() {
            log::warn!("frame for unknown stream {id}");
            return;
        }

        let media_time = if media_time == 0 {
            log::error!("received frame with invalid 0 timestamp! perhaps wrong graphic driver?");
            mm_time.unwrap_or(0) + 100
        } else {
            media_time
        };

        let latency = mm_time.map(|now| media_time as i64 - now as i64);

        {
            let stream = match self.streams.get_mut(id) {
                Some(stream) => stream,
                None => return,
            };
            if stream.num_input_frames == 0 {
                stream.first_frame_mm_time = media_time;
            }
            stream.num_input_frames += 1;
        }

        match latency {
            Some(late) if late < 0 => {
                log::debug!(
                    "stream {id}: data too late by {} ms (ts: {}, mmtime: {}), dropping",
                    -late,
                    media_time,
                    mm_time.unwrap_or(0)
                );
                let stream = match self.streams.get_mut(id) {
                    Some(stream) => stream,
                    None => return,
                };
                stream.arrive_late_time += (-late) as u64;
                stream.num_drops_on_receive += 1;
                if stream.cur_drops_seq.len == 0 {
                    stream.cur_drops_seq.start_mm_time = media_time;
                }
                stream.cur_drops_seq.len += 1;
                stream.playback_sync_drops_seq_len += 1;
            }
            _ => {
                match latency {
                    None => log::debug!("invalid mm-time, not checking video-audio sync"),
                    Some(latency) => log::debug!("video latency: {latency}"),
                }
                self.test_frames_mm_time_reset(id, media_time);
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.msgq.push_back(QueuedFrame {
                        media_time,
                        sized,
                        data,
                    });
                }
                self.schedule_stream(id);
                if let Some(stream) = self.streams.get_mut(id) {
                    if stream.cur_drops_seq.len > 0 {
                        stream.cur_drops_seq.duration =
                            media_time.wrapping_sub(stream.cur_drops_seq.start_mm_time);
                        let finished = stream.cur_drops_seq;
                        stream.drops_seqs.push(finished);
                        stream.cur_drops_seq = DropsSeqStats::default();
                    }
                    stream.playback_sync_drops_seq_len = 0;
                }
            }
        }

        if self.adaptive_streaming {
            let last_delay = latency.unwrap_or(0).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            self.update_stream_report(id, media_time, last_delay, latency.is_none());

            let resync = self
                .streams
                .get(id)
                .map(|s| s.playback_sync_drops_seq_len >= PLAYBACK_SYNC_DROP_SEQ_LEN_LIMIT)
                .unwrap_or(false);
            if resync {
                self.session.sync_playback_latency();
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.playback_sync_drops_seq_len = 0;
                }
            }
        }
    }

    pub(crate) fn handle_stream_clip(&mut self, id: u32, clip: Clip) {
        let Some(stream) = self.streams.get_mut(id) else {
            log::warn!("clip for unknown stream {id}");
            return;
        };
        stream.clip = clip;
        stream.update_region();
    }

    pub(crate) fn handle_stream_activate_report(&mut self, msg: &StreamActivateReport) {
        let Some(stream) = self.streams.get_mut(msg.stream_id) else {
            log::warn!("activate report for unknown stream {}", msg.stream_id);
            return;
        };
        stream.report = Some(ReportState {
            unique_id: msg.unique_id,
            max_window: msg.max_window_size,
            timeout: Duration::from_millis(msg.timeout_ms as u64),
            start_time: None,
            start_frame_mm_time: 0,
            num_frames: 0,
            num_drops: 0,
            drops_seq_len: 0,
        });
    }

    pub(crate) fn destroy_stream(&mut self, id: u32) {
        let Some(stream) = self.streams.take(id) else {
            return;
        };

        let num_out_frames = stream.num_input_frames
            - stream.num_drops_on_receive
            - stream.num_drops_on_playback;
        log::debug!(
            "stream {id}: #in-frames={} out/in={:.2} #drops-on-receive={} \
             avg-late-time(ms)={:.2} #drops-on-playback={}",
            stream.num_input_frames,
            if stream.num_input_frames > 0 {
                num_out_frames as f64 / stream.num_input_frames as f64
            } else {
                0.0
            },
            stream.num_drops_on_receive,
            if stream.num_drops_on_receive > 0 {
                stream.arrive_late_time as f64 / stream.num_drops_on_receive as f64
            } else {
                0.0
            },
            stream.num_drops_on_playback
        );
        if !stream.drops_seqs.is_empty() {
            log::debug!("stream {id}: #drops-sequences={}", stream.drops_seqs.len());
            let mut total = 0u64;
            for seq in &stream.drops_seqs {
                total += seq.duration as u64;
                log::debug!(
                    "stream {id}: \t len={} start-ms={} duration-ms={}",
                    seq.len,
                    seq.start_mm_time.wrapping_sub(stream.first_frame_mm_time),
                    seq.duration
                );
            }
            log::debug!("stream {id}: drops-total-duration={total}");
        }

        if let Some(timer) = stream.timer {
            self.timers.cancel(timer);
        }

        // A hardware stream's last frame stays on screen; force a repaint.
        if stream.hw_accel {
            let primary = self
                .surfaces
                .find(stream.surface_id)
                .map(|s| s.primary)
                .unwrap_or(false);
            if primary {
                self.events.push_back(DisplayEvent::Invalidate(stream.dst_rect));
            }
        }

        self.report = String::new();
        self.events.push_back(DisplayEvent::StreamReportChanged);
    }

    pub(crate) fn clear_streams(&mut self) {
        for id in self.streams.ids() {
            self.destroy_stream(id);
        }
    }

    /// Playback counters of one stream, for diagnostics.
    pub fn stream_stats(&self, id: u32) -> Option<StreamStats> {
        self.streams.get(id).map(|stream| StreamStats {
            num_input_frames: stream.num_input_frames,
            num_drops_on_receive: stream.num_drops_on_receive,
            num_drops_on_playback: stream.num_drops_on_playback,
            queued_frames: stream.msgq.len(),
            timer_armed: stream.timer.is_some(),
        })
    }

    /// Stream ids with an active hardware-accelerated decode session.
    pub fn va_sessions(&self) -> Vec<u32> {
        self.streams
            .ids()
            .into_iter()
            .filter(|&id| self.streams.get(id).map(|s| s.hw_accel).unwrap_or(false))
            .collect()
    }
}

/// After this many consecutive drops-on-receive, ask the session to
/// resynchronise audio latency.
const PLAYBACK_SYNC_DROP_SEQ_LEN_LIMIT: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDecoder;

    impl StreamFrameDecoder for NullDecoder {
        fn decode_frame(
            &mut self,
            _data: &[u8],
            _width: u32,
            _height: u32,
        ) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn stream() -> Box<VideoStream> {
        let create = StreamCreate {
            id: 0,
            surface_id: 0,
            codec: VideoCodec::Mjpeg,
            flags: StreamFlags::default(),
            dest: Rect::new(0, 0, 16, 16),
            stream_width: 16,
            stream_height: 16,
            clip: Clip::None,
        };
        Box::new(VideoStream::new(&create, Box::new(NullDecoder)))
    }

    #[test]
    fn table_grows_by_doubling_from_one() {
        let mut table = StreamTable::new();
        table.create(0, stream()).unwrap();
        assert_eq!(table.capacity(), 1);
        table.create(5, stream()).unwrap();
        assert_eq!(table.capacity(), 8);
        table.create(8, stream()).unwrap();
        assert_eq!(table.capacity(), 16);
    }

    #[test]
    fn create_into_occupied_slot_fails() {
        let mut table = StreamTable::new();
        table.create(2, stream()).unwrap();
        assert!(table.create(2, stream()).is_err());
        assert!(table.take(2).is_some());
        assert!(table.get(2).is_none());
    }

    #[test]
    fn fskip_thresholds() {
        assert_eq!(fskip_level_for(0), 0);
        assert_eq!(fskip_level_for(40), 0);
        assert_eq!(fskip_level_for(41), 1);
        assert_eq!(fskip_level_for(80), 1);
        assert_eq!(fskip_level_for(81), 2);
        assert_eq!(fskip_level_for(120), 2);
        assert_eq!(fskip_level_for(121), 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn capacity_is_next_power_of_two_of_id_plus_one(id in 0u32..1024) {
                let mut table = StreamTable::new();
                table.create(id, stream()).unwrap();
                prop_assert_eq!(table.capacity(), (id as usize + 1).next_power_of_two());
            }

            #[test]
            fn fskip_level_is_monotonic(a in 0u64..500, b in 0u64..500) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                prop_assert!(fskip_level_for(lo) <= fskip_level_for(hi));
            }
        }
    }
}
