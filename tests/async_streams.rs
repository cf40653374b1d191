#![cfg(feature = "tokio")]

use std::{sync::Arc, time::Duration};

use framelatch::{
    tokio::{AsyncContext, AsyncStream},
    Context, ContextOptions, Device, Error, SensorType, Stream, StreamOptions,
};

struct Sim;

impl Device for Sim {
    fn driver_id(&self) -> &str {
        "sim"
    }
}

fn started_stream(context: &Context) -> Stream {
    let stream = context
        .create_stream(Arc::new(Sim), &StreamOptions::builder(SensorType::Depth).build())
        .unwrap();
    stream.start().unwrap();
    stream
}

fn push(stream: &Stream, index: u64) {
    let frame = stream
        .acquire_frame()
        .unwrap()
        .with_frame_index(index)
        .with_timestamp(index * 1_000)
        .publish()
        .unwrap();
    stream.process_new_frame(frame).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_read_completes_when_frame_arrives() {
    let context = Context::new(ContextOptions::default());
    let stream = started_stream(&context);
    let async_stream = AsyncStream::new(stream.clone());

    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        push(&stream, 5);
    });

    let frame = async_stream.read_frame().await.unwrap();
    assert_eq!(frame.frame_index, 5);
    producer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_wait_reports_timeout_and_ready_stream() {
    let context = Context::new(ContextOptions::default());
    let first = started_stream(&context);
    let second = started_stream(&context);
    let async_context = AsyncContext::new(context.clone());

    let result = async_context
        .wait_for_any_stream(
            vec![Some(first.clone()), Some(second.clone())],
            Some(Duration::from_millis(10)),
        )
        .await;
    assert!(matches!(result, Err(Error::TimedOut { streams: 2, .. })));

    push(&second, 1);
    let ready = async_context
        .wait_for_any_stream(vec![Some(first), None, Some(second.clone())], None)
        .await
        .unwrap();
    assert_eq!(ready, 2);

    let frame = async_context.read_frame(&second).await.unwrap();
    assert_eq!(frame.frame_index, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_read_fails_after_shutdown() {
    let context = Context::new(ContextOptions::default());
    let stream = started_stream(&context);
    let async_stream = AsyncStream::new(stream);

    let reader = tokio::spawn(async move { async_stream.read_frame().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    context.shutdown();

    let result = reader.await.unwrap();
    assert!(matches!(result, Err(Error::ShutDown(_))));
}
