//! QoS reporting back to the server, plus the human-readable stream status
//! string the host can surface in its UI.

use std::time::Instant;

use mirador_protocol::messages::{ClientMsg, StreamReport};

use crate::channel::DisplayChannel;
use crate::events::DisplayEvent;

/// A run of this many dropped frames pushes a report out even if the window
/// is not full yet.
const REPORT_DROP_SEQ_LEN_LIMIT: u32 = 3;

impl DisplayChannel {
    /// Feeds one processed frame into the stream's report window, emitting a
    /// report when the window fills, times out, or a drop streak builds up.
    pub(crate) fn update_stream_report(
        &mut self,
        stream_id: u32,
        frame_time: u32,
        latency: i32,
        invalid_mm_time: bool,
    ) {
        let playback_active = self.session.playback_active();
        let playback_latency = self.session.playback_latency_ms();

        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };
        let hw_accel = stream.hw_accel;
        let Some(report) = stream.report.as_mut() else {
            return;
        };

        let now = Instant::now();
        if report.num_frames == 0 {
            report.start_frame_mm_time = frame_time;
            report.start_time = Some(now);
        }
        report.num_frames += 1;

        if latency < 0 && !invalid_mm_time {
            report.num_drops += 1;
            report.drops_seq_len += 1;
        } else {
            report.drops_seq_len = 0;
        }

        let elapsed = report
            .start_time
            .map(|start| now.duration_since(start))
            .unwrap_or_default();
        if report.num_frames < report.max_window
            && elapsed < report.timeout
            && report.drops_seq_len < REPORT_DROP_SEQ_LEN_LIMIT
        {
            return;
        }

        let msg = StreamReport {
            stream_id,
            unique_id: report.unique_id,
            start_frame_mm_time: report.start_frame_mm_time,
            end_frame_mm_time: frame_time,
            num_frames: report.num_frames,
            num_drops: report.num_drops,
            last_frame_delay: latency,
            audio_delay: if playback_active {
                playback_latency
            } else {
                u32::MAX
            },
        };

        let decode_ms = if stream.decoded_frames > 0 {
            stream.acum_decode_time_ms / stream.decoded_frames as u64
        } else {
            0
        };
        stream.decoded_frames = 0;
        stream.acum_decode_time_ms = 0;

        let elapsed_us = elapsed.as_micros().max(1) as u64;
        let in_fps = report.num_frames as u64 * 1_000_000 / elapsed_us;
        let out_fps =
            (report.num_frames - report.num_drops) as u64 * 1_000_000 / elapsed_us;
        let status = format!(
            "HW accel {}, decode: {:<3}ms, dropped {:<2}, in rate {:<2}, out rate {:<2}",
            if hw_accel { "on" } else { "off" },
            decode_ms,
            report.num_drops,
            in_fps,
            out_fps
        );
        log::debug!(
            "reporting stream {stream_id}, elapsed {}us: {status}",
            elapsed_us
        );

        report.start_time = None;
        report.start_frame_mm_time = 0;
        report.num_frames = 0;
        report.num_drops = 0;
        report.drops_seq_len = 0;

        self.report = status;
        self.events.push_back(DisplayEvent::StreamReportChanged);
        self.outbox.push_back(ClientMsg::StreamReport(msg));
    }
}
