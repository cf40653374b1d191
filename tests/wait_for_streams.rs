use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use framelatch::{
    Context, ContextOptions, Device, DeviceRef, Error, SensorType, Stream, StreamOptions,
    MAX_WAITED_STREAMS,
};

#[derive(Default)]
struct PokeCounter {
    pokes: AtomicUsize,
}

impl Device for PokeCounter {
    fn driver_id(&self) -> &str {
        "poke-counter"
    }

    fn poke(&self) -> framelatch::Result<()> {
        self.pokes.fetch_add(1, Ordering::Relaxed);
        Err(Error::NotSupported("nothing buffered".into()))
    }
}

fn context() -> Context {
    Context::new(ContextOptions::builder().fps_log_interval(None).build())
}

fn streams(context: &Context, device: &DeviceRef, count: usize) -> Vec<Stream> {
    (0..count)
        .map(|_| {
            let stream = context
                .create_stream(device.clone(), &StreamOptions::builder(SensorType::Ir).build())
                .unwrap();
            stream.start().unwrap();
            stream
        })
        .collect()
}

#[test]
fn consumer_drains_several_producers() -> Result<(), Error> {
    const FRAMES: u64 = 100;

    let context = context();
    let device: DeviceRef = Arc::new(PokeCounter::default());
    let streams = streams(&context, &device, 3);

    let producers: Vec<_> = streams
        .iter()
        .cloned()
        .enumerate()
        .map(|(n, stream)| {
            thread::spawn(move || -> Result<(), Error> {
                for i in 0..FRAMES {
                    if let Some(frame) = stream.acquire_frame() {
                        let frame = frame
                            .with_frame_index(i)
                            .with_timestamp(i * 10_000 + n as u64)
                            .publish()?;
                        stream.process_new_frame(frame)?;
                    }
                    thread::sleep(Duration::from_micros(200 * (n as u64 + 1)));
                }
                Ok(())
            })
        })
        .collect();

    let entries: Vec<Option<&Stream>> = streams.iter().map(Some).collect();
    let mut last = [None::<u64>; 3];
    while last.iter().any(|seen| *seen != Some(FRAMES - 1)) {
        let ready = context.wait_for_any_stream(&entries, Some(Duration::from_secs(5)))?;
        // Only this thread reads, so the ready frame is still there
        let frame = streams[ready].read_frame()?;
        if let Some(previous) = last[ready] {
            assert!(frame.frame_index > previous);
        }
        last[ready] = Some(frame.frame_index);
    }

    for producer in producers {
        producer.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn failing_pokes_do_not_abort_the_wait() {
    let context = context();
    let counter = Arc::new(PokeCounter::default());
    let device: DeviceRef = counter.clone();
    let streams = streams(&context, &device, 2);

    let result = context.wait_for_any_stream(
        &[Some(&streams[0]), Some(&streams[1])],
        Some(Duration::from_millis(20)),
    );
    assert!(matches!(result, Err(Error::TimedOut { streams: 2, .. })));
    assert!(result.unwrap_err().is_retryable());
    // Both streams share the device, so it is poked once per scan
    let pokes = counter.pokes.load(Ordering::Relaxed);
    assert!(pokes >= 1);
}

#[test]
fn wait_limit_is_enforced_before_waiting() {
    let context = context();
    let device: DeviceRef = Arc::new(PokeCounter::default());
    let streams = streams(&context, &device, 1);

    let mut entries: Vec<Option<&Stream>> = vec![None; MAX_WAITED_STREAMS];
    entries[MAX_WAITED_STREAMS - 1] = Some(&streams[0]);
    streams[0]
        .process_new_frame(streams[0].acquire_frame().unwrap().publish().unwrap())
        .unwrap();
    assert_eq!(
        context.wait_for_any_stream(&entries, None).unwrap(),
        MAX_WAITED_STREAMS - 1
    );

    entries.push(None);
    assert!(matches!(
        context.wait_for_any_stream(&entries, None),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn waits_on_separate_threads_are_independent() {
    let context = context();
    let device: DeviceRef = Arc::new(PokeCounter::default());
    let streams = streams(&context, &device, 2);

    let waiters: Vec<_> = streams
        .iter()
        .cloned()
        .map(|stream| {
            let context = context.clone();
            thread::spawn(move || {
                context.wait_for_any_stream(&[Some(&stream)], Some(Duration::from_secs(5)))
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    for (i, stream) in streams.iter().enumerate() {
        let frame = stream
            .acquire_frame()
            .unwrap()
            .with_frame_index(1)
            .with_timestamp(i as u64)
            .publish()
            .unwrap();
        stream.process_new_frame(frame).unwrap();
    }

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Ok(0));
    }
}
