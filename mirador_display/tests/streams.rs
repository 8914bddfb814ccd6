//! Stream scheduling, rendering, clock handling, and QoS reporting.

mod support;

use std::time::Duration;

use mirador_display::{DisplayEvent, TimerToken};
use mirador_protocol::geometry::{Clip, Rect};
use mirador_protocol::messages::{
    ClientMsg, DisplayMsg, StreamActivateReport, StreamCreate, StreamData, StreamDataSized,
    StreamFlags, SurfaceFormat, VideoCodec,
};

use support::{harness, CanvasCall, RecordingPump};

fn primary(width: u32, height: u32) -> DisplayMsg {
    DisplayMsg::SurfaceCreate {
        surface_id: 0,
        format: SurfaceFormat::Rgb32,
        width,
        height,
        primary: true,
    }
}

fn stream_create(id: u32, dest: Rect) -> DisplayMsg {
    DisplayMsg::StreamCreate(StreamCreate {
        id,
        surface_id: 0,
        codec: VideoCodec::Mjpeg,
        flags: StreamFlags(StreamFlags::TOP_DOWN),
        dest,
        stream_width: dest.width(),
        stream_height: dest.height(),
        clip: Clip::None,
    })
}

fn frame(id: u32, media_time: u32) -> DisplayMsg {
    DisplayMsg::StreamData(StreamData {
        id,
        media_time,
        data: vec![0xaa; 16],
    })
}

fn stream_timer_delay(h: &support::Harness, id: u32) -> Option<Duration> {
    h.channel
        .pending_timers()
        .into_iter()
        .find(|(token, _)| *token == TimerToken::StreamRender(id))
        .map(|(_, delay)| delay)
}

#[test]
fn on_time_frame_arms_timer_for_remaining_delta() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 64, 64)), &mut pump);

    h.session.mm_time.set(Some(990));
    h.channel.handle_msg(frame(0, 1000), &mut pump);

    assert_eq!(stream_timer_delay(&h, 0), Some(Duration::from_millis(10)));
    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.num_input_frames, 1);
    assert_eq!(stats.queued_frames, 1);
}

#[test]
fn render_decodes_blits_and_invalidates_union() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    let dest = Rect::new(10, 10, 74, 74);
    h.channel.handle_msg(stream_create(0, dest), &mut pump);
    h.channel.drain_events();

    h.session.mm_time.set(Some(990));
    h.channel.handle_msg(frame(0, 1000), &mut pump);
    h.channel.on_timer(TimerToken::StreamRender(0));

    assert_eq!(h.decoded_frames.get(), 1);
    assert_eq!(
        h.canvas_log.borrow().last(),
        Some(&CanvasCall::PutImage {
            dest,
            width: 64,
            height: 64,
            stride: 64 * 4,
        })
    );
    // First render unions with the zero rectangle, so the hull includes the
    // origin corner.
    assert_eq!(
        h.channel.drain_events(),
        vec![DisplayEvent::Invalidate(Rect::new(0, 0, 74, 74))]
    );
    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.queued_frames, 0);
    assert!(!stats.timer_armed);
}

#[test]
fn bottom_up_stream_blits_with_negative_stride() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    let dest = Rect::new(0, 0, 32, 32);
    h.channel.handle_msg(
        DisplayMsg::StreamCreate(StreamCreate {
            id: 0,
            surface_id: 0,
            codec: VideoCodec::Mjpeg,
            flags: StreamFlags(0),
            dest,
            stream_width: 32,
            stream_height: 32,
            clip: Clip::None,
        }),
        &mut pump,
    );

    h.session.mm_time.set(Some(100));
    h.channel.handle_msg(frame(0, 110), &mut pump);
    h.channel.on_timer(TimerToken::StreamRender(0));

    assert_eq!(
        h.canvas_log.borrow().last(),
        Some(&CanvasCall::PutImage {
            dest,
            width: 32,
            height: 32,
            stride: -(32 * 4),
        })
    );
}

#[test]
fn sized_frame_overrides_destination() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 32, 32)), &mut pump);
    h.channel.drain_events();

    h.session.mm_time.set(Some(100));
    let sized_dest = Rect::new(100, 100, 200, 180);
    h.channel.handle_msg(
        DisplayMsg::StreamDataSized(StreamDataSized {
            id: 0,
            media_time: 150,
            dest: sized_dest,
            width: 100,
            height: 80,
            data: vec![1; 8],
        }),
        &mut pump,
    );
    h.channel.on_timer(TimerToken::StreamRender(0));

    assert_eq!(
        h.canvas_log.borrow().last(),
        Some(&CanvasCall::PutImage {
            dest: sized_dest,
            width: 100,
            height: 80,
            stride: 100 * 4,
        })
    );
}

#[test]
fn late_frames_on_receive_are_counted_and_dropped() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);

    h.session.mm_time.set(Some(620));
    h.channel.handle_msg(frame(0, 500), &mut pump);
    h.channel.handle_msg(frame(0, 540), &mut pump);

    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.num_drops_on_receive, 2);
    assert_eq!(stats.queued_frames, 0);
    assert!(!stats.timer_armed);
}

#[test]
fn queued_frames_overtaken_by_clock_drop_on_playback() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);
    h.channel.drain_events();

    h.session.mm_time.set(Some(400));
    h.channel.handle_msg(frame(0, 500), &mut pump);
    h.channel.handle_msg(frame(0, 540), &mut pump);

    // The media clock jumps past both queued frames before the timer fires.
    h.session.mm_time.set(Some(620));
    h.channel.mm_time_reset();

    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.num_drops_on_playback, 2);
    assert_eq!(stats.queued_frames, 0);
    assert!(!stats.timer_armed);
    assert_eq!(h.decoded_frames.get(), 0);
    assert!(h.channel.drain_events().is_empty());
}

#[test]
fn clock_rewind_flushes_queue_and_reschedules() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);

    h.session.mm_time.set(Some(150));
    h.channel.handle_msg(frame(0, 10_000), &mut pump);
    assert_eq!(stream_timer_delay(&h, 0), Some(Duration::from_millis(9850)));

    // The server migrated; its clock restarted.
    h.channel.handle_msg(frame(0, 200), &mut pump);

    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.queued_frames, 1);
    assert_eq!(stream_timer_delay(&h, 0), Some(Duration::from_millis(50)));
}

#[test]
fn invalid_clock_schedules_immediate_render() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);

    h.session.mm_time.set(None);
    h.channel.handle_msg(frame(0, 500), &mut pump);

    assert_eq!(stream_timer_delay(&h, 0), Some(Duration::ZERO));
}

#[test]
fn zero_media_time_is_patched_past_now() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);

    h.session.mm_time.set(Some(1000));
    h.channel.handle_msg(frame(0, 0), &mut pump);

    // Patched to now + 100, so it queues instead of dropping.
    let stats = h.channel.stream_stats(0).unwrap();
    assert_eq!(stats.queued_frames, 1);
    assert_eq!(stream_timer_delay(&h, 0), Some(Duration::from_millis(100)));
}

#[test]
fn stream_destroy_clears_slot_and_report() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(2, Rect::new(0, 0, 16, 16)), &mut pump);
    assert!(!h.channel.stream_report().is_empty());

    h.channel.handle_msg(DisplayMsg::StreamDestroy { id: 2 }, &mut pump);
    assert!(h.channel.stream_stats(2).is_none());
    assert!(h.channel.stream_report().is_empty());
}

#[test]
fn channel_reset_leaves_no_streams_or_timers() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);
    h.channel.handle_msg(stream_create(3, Rect::new(0, 0, 16, 16)), &mut pump);
    h.session.mm_time.set(Some(0));
    h.channel.handle_msg(frame(0, 50), &mut pump);
    assert!(stream_timer_delay(&h, 0).is_some());

    h.channel.reset();

    assert!(h.channel.stream_stats(0).is_none());
    assert!(h.channel.stream_stats(3).is_none());
    assert!(h.channel.pending_timers().is_empty());
    // The primary survives a reset.
    assert_eq!(h.channel.width(), 640);
}

#[test]
fn report_window_fills_and_emits_once() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);
    h.channel.handle_msg(
        DisplayMsg::StreamActivateReport(StreamActivateReport {
            stream_id: 0,
            unique_id: 77,
            max_window_size: 30,
            timeout_ms: 500,
        }),
        &mut pump,
    );
    h.channel.drain_outbox();

    h.session.mm_time.set(Some(0));
    for i in 0..30u32 {
        h.channel.handle_msg(frame(0, 1000 + i * 10), &mut pump);
    }

    let reports: Vec<_> = h
        .channel
        .drain_outbox()
        .into_iter()
        .filter_map(|msg| match msg {
            ClientMsg::StreamReport(report) => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].stream_id, 0);
    assert_eq!(reports[0].unique_id, 77);
    assert_eq!(reports[0].num_frames, 30);
    assert_eq!(reports[0].num_drops, 0);
    assert_eq!(reports[0].start_frame_mm_time, 1000);
    assert_eq!(reports[0].end_frame_mm_time, 1290);
    assert_eq!(reports[0].audio_delay, u32::MAX);
    assert!(!h.channel.stream_report().is_empty());
}

#[test]
fn drop_streak_of_three_forces_report() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);
    h.channel.handle_msg(
        DisplayMsg::StreamActivateReport(StreamActivateReport {
            stream_id: 0,
            unique_id: 5,
            max_window_size: 1000,
            timeout_ms: 60_000,
        }),
        &mut pump,
    );

    h.session.mm_time.set(Some(5000));
    for i in 0..3u32 {
        h.channel.handle_msg(frame(0, 100 + i), &mut pump);
    }

    let reports: Vec<_> = h
        .channel
        .drain_outbox()
        .into_iter()
        .filter(|msg| matches!(msg, ClientMsg::StreamReport(_)))
        .collect();
    assert_eq!(reports.len(), 1);
}

#[test]
fn reports_disabled_without_adaptive_streaming() {
    let session = support::FakeSession::new();
    let (canvas_factory, _log) = support::FakeCanvasFactory::new();
    let (stream_codecs, _decoded) = support::FakeStreamCodecs::new();
    let mut channel = mirador_display::DisplayChannel::new(mirador_display::ChannelConfig {
        channel_id: 0,
        session: session.clone(),
        canvas_factory,
        decoder_factory: std::rc::Rc::new(support::FakeDecoderFactory),
        stream_codecs,
        shm: Box::new(mirador_canvas::NoShm),
        adaptive_streaming: Some(false),
        aux: None,
    });
    let mut pump = RecordingPump::new();
    channel.handle_msg(primary(640, 480), &mut pump);
    channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);
    channel.handle_msg(
        DisplayMsg::StreamActivateReport(StreamActivateReport {
            stream_id: 0,
            unique_id: 1,
            max_window_size: 1,
            timeout_ms: 1,
        }),
        &mut pump,
    );

    session.mm_time.set(Some(0));
    channel.handle_msg(frame(0, 100), &mut pump);

    assert!(channel
        .drain_outbox()
        .iter()
        .all(|msg| !matches!(msg, ClientMsg::StreamReport(_))));
}

#[test]
fn sustained_receive_drops_trigger_playback_resync() {
    let mut h = harness(0);
    let mut pump = RecordingPump::new();
    h.channel.handle_msg(primary(640, 480), &mut pump);
    h.channel.handle_msg(stream_create(0, Rect::new(0, 0, 16, 16)), &mut pump);

    h.session.mm_time.set(Some(10_000));
    for i in 0..5u32 {
        h.channel.handle_msg(frame(0, 100 + i), &mut pump);
    }

    assert_eq!(h.session.sync_requests.get(), 1);
    assert_eq!(
        h.channel.stream_stats(0).unwrap().num_drops_on_receive,
        5
    );
}
