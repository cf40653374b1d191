use std::{sync::Arc, thread, time::Duration};

use framelatch::{
    Context, ContextOptions, Device, DeviceRef, PixelFormat, SensorType, Stream, StreamOptions,
    VideoMode,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

struct Sim;

impl Device for Sim {
    fn driver_id(&self) -> &str {
        "sim"
    }
}

fn setup() -> Result<(Context, DeviceRef, Stream, Stream), framelatch::Error> {
    let context = Context::new(ContextOptions::builder().fps_log_interval(None).build());
    let device: DeviceRef = Arc::new(Sim);
    context.set_depth_color_sync(&device, true)?;

    let depth = context.create_stream(
        device.clone(),
        &StreamOptions::builder(SensorType::Depth)
            .video_mode(VideoMode::new(PixelFormat::Depth1Mm, 4, 4, 30))
            .build(),
    )?;
    let color = context.create_stream(
        device.clone(),
        &StreamOptions::builder(SensorType::Color)
            .video_mode(VideoMode::new(PixelFormat::Rgb888, 4, 4, 30))
            .build(),
    )?;
    depth.start()?;
    color.start()?;
    Ok((context, device, depth, color))
}

fn push(stream: &Stream, index: u64) -> Result<(), framelatch::Error> {
    if let Some(frame) = stream.acquire_frame() {
        let frame = frame
            .with_frame_index(index)
            .with_timestamp(index * 33_333)
            .publish()?;
        stream.process_new_frame(frame)?;
    }
    Ok(())
}

fn read_until(stream: Stream, last: u64) -> thread::JoinHandle<Result<Vec<u64>, framelatch::Error>> {
    thread::spawn(move || {
        let mut seen = Vec::new();
        loop {
            let frame = stream.read_frame()?;
            seen.push(frame.frame_index);
            if frame.frame_index == last {
                return Ok(seen);
            }
        }
    })
}

#[test]
fn synced_readers_see_ordered_frames() -> Result<(), framelatch::Error> {
    const FRAMES: u64 = 300;
    let (_context, _device, depth, color) = setup()?;
    assert!(depth.is_frame_synced());
    assert!(color.is_frame_synced());

    let depth_reader = read_until(depth.clone(), FRAMES - 1);
    let color_reader = read_until(color.clone(), FRAMES - 1);

    let producer = {
        let (depth, color) = (depth.clone(), color.clone());
        thread::spawn(move || -> Result<(), framelatch::Error> {
            let mut rng = StdRng::seed_from_u64(42);
            for i in 0..FRAMES {
                // Both orders happen on real hardware
                if rng.gen_bool(0.5) {
                    push(&depth, i)?;
                    push(&color, i)?;
                } else {
                    push(&color, i)?;
                    push(&depth, i)?;
                }
                if i % 16 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(())
        })
    };

    producer.join().unwrap()?;
    for reader in [depth_reader, color_reader] {
        let seen = reader.join().unwrap()?;
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
    }
    Ok(())
}

#[test]
fn lost_frames_do_not_stall_the_group() -> Result<(), framelatch::Error> {
    let (_context, _device, depth, color) = setup()?;

    // Color loses every third frame
    for i in 0..30u64 {
        push(&depth, i)?;
        if i % 3 != 0 {
            push(&color, i)?;
        }
    }
    push(&color, 30)?;
    push(&depth, 30)?;

    let depth_frame = depth.read_frame()?;
    let color_frame = color.read_frame()?;
    assert_eq!(depth_frame.frame_index, 30);
    assert_eq!(color_frame.frame_index, 30);
    Ok(())
}

#[test]
fn stopping_a_member_regroups_the_rest() -> Result<(), framelatch::Error> {
    let (context, _device, depth, color) = setup()?;

    color.stop();
    assert!(!color.is_started());

    // With color gone, depth frames latch on their own
    push(&depth, 1)?;
    let ready = context.wait_for_any_stream(&[Some(&depth)], Some(Duration::from_millis(500)))?;
    assert_eq!(ready, 0);
    assert_eq!(depth.read_frame()?.frame_index, 1);

    color.start()?;
    push(&depth, 2)?;
    assert!(depth.peek_frame().is_none());
    push(&color, 2)?;
    assert_eq!(depth.read_frame()?.frame_index, 2);
    assert_eq!(color.read_frame()?.frame_index, 2);
    Ok(())
}
