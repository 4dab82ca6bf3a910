use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel;

use sscs_node::core::StopSignal;
use sscs_node::recorder::{FrameFanout, FrameFormat, VideoFrame};

fn frame(i: u64) -> VideoFrame {
    VideoFrame {
        pts: Duration::from_millis(40 * i),
        keyframe: i == 0,
        format: FrameFormat::AnnexB,
        data: Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A]),
    }
}

#[test]
fn full_subscriber_loses_frames_without_blocking() {
    let (slow_tx, slow_rx) = channel::bounded(2);
    let (fast_tx, fast_rx) = channel::bounded(100);
    let fanout = FrameFanout::new(vec![slow_tx, fast_tx], StopSignal::new());

    let started = Instant::now();
    for i in 0..50 {
        fanout.send(frame(i));
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(slow_rx.len(), 2);
    assert_eq!(fast_rx.len(), 50);
    assert_eq!(fanout.dropped(), 48);
    assert_eq!(fanout.delivered(), 52);
    // the oldest frames are the ones that made it
    assert_eq!(slow_rx.recv().unwrap().pts, Duration::ZERO);
}

#[test]
fn subscriber_added_later_sees_only_new_frames() {
    let fanout = FrameFanout::new(Vec::new(), StopSignal::new());
    fanout.send(frame(0));

    let (tx, rx) = channel::bounded(4);
    fanout.subscribe(tx);
    fanout.send(frame(1));

    assert_eq!(fanout.subscriber_count(), 1);
    assert_eq!(rx.try_recv().unwrap().pts, Duration::from_millis(40));
    assert!(rx.try_recv().is_err());
}
