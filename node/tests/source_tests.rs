// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use bytes::Bytes;
use eventsource_kernel::AppendOutcome;
use eventsource_node::config::NodeConfig;
use eventsource_node::errors::NodeError;
use eventsource_node::source::EventSource;
use eventsource_node::telemetry;
use eventsource_kernel::LogError;
use futures::future::join_all;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_append_publishes_high_water() {
    let dir = tempdir().unwrap();
    let source = EventSource::open(&NodeConfig::with_data_dir(dir.path())).await.unwrap();
    let mut commits = source.subscribe();
    assert_eq!(*commits.borrow_and_update(), 0);

    let outcome = source
        .append("sensor-7", 1, Some(Bytes::from_static(b"room-2")), Bytes::from_static(b"21.5"))
        .await
        .unwrap();
    assert_eq!(outcome, AppendOutcome::Committed(1));
    assert!(commits.has_changed().unwrap());
    assert_eq!(*commits.borrow_and_update(), 2);

    // Duplicates do not publish.
    let outcome = source
        .append("sensor-7", 1, None, Bytes::from_static(b"21.5"))
        .await
        .unwrap();
    assert_eq!(outcome, AppendOutcome::Duplicate(1));
    assert!(!commits.has_changed().unwrap());

    let record = source.read(1).await.unwrap();
    assert_eq!(record.payload, Bytes::from_static(b"21.5"));
    assert_eq!(source.high_water_offset(), 2);
}

#[tokio::test]
async fn test_errors_surface_through_facade() {
    let dir = tempdir().unwrap();
    let source = EventSource::open(&NodeConfig::with_data_dir(dir.path())).await.unwrap();

    assert!(matches!(
        source.read(5).await,
        Err(NodeError::Log(LogError::NotFound { offset: 5 }))
    ));
    assert!(matches!(
        source.append("", 1, None, Bytes::new()).await,
        Err(NodeError::Log(LogError::InvalidRecord(_)))
    ));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let dir = tempdir().unwrap();
    let mut config = NodeConfig::with_data_dir(dir.path());
    config.delivery_batch_size = 0;
    assert!(matches!(EventSource::open(&config).await, Err(NodeError::Config(_))));
}

#[tokio::test]
async fn test_acknowledge_and_batch_read() {
    let dir = tempdir().unwrap();
    let source = EventSource::open(&NodeConfig::with_data_dir(dir.path())).await.unwrap();
    for seq in 1..=6 {
        source.append("p", seq, None, Bytes::from(vec![seq as u8])).await.unwrap();
    }

    let batch = source.read_batch(source.resume_point("c"), 4).await.unwrap();
    assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(source.acknowledge("c", 4).await.unwrap());
    assert!(!source.acknowledge("c", 2).await.unwrap());

    let batch = source.read_batch(source.resume_point("c"), 4).await.unwrap();
    assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![5, 6]);
}

#[tokio::test]
async fn test_telemetry_init_is_idempotent() {
    telemetry::init_telemetry();
    telemetry::init_telemetry();

    let dir = tempdir().unwrap();
    let source = EventSource::open(&NodeConfig::with_data_dir(dir.path())).await.unwrap();
    source.append("p", 1, None, Bytes::from_static(b"x")).await.unwrap();

    let rendered = telemetry::render_metrics();
    assert!(rendered.contains("eventsource_records_appended_total"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_high_water_never_moves_back() {
    let dir = tempdir().unwrap();
    let source = EventSource::open(&NodeConfig::with_data_dir(dir.path())).await.unwrap();
    let mut commits = source.subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while commits.changed().await.is_ok() {
            let high_water = *commits.borrow_and_update();
            seen.push(high_water);
            if high_water == 41 {
                break;
            }
        }
        seen
    });

    let producers = (0..4).map(|p| {
        let source = source.clone();
        tokio::spawn(async move {
            for seq in 1..=10 {
                source
                    .append(format!("producer-{}", p), seq, None, Bytes::from_static(b"x"))
                    .await
                    .unwrap();
            }
        })
    });
    for result in join_all(producers).await {
        result.unwrap();
    }

    let seen = tokio::time::timeout(Duration::from_secs(10), watcher)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.last(), Some(&41));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "high-water went back: {:?}", seen);
    assert_eq!(*source.subscribe().borrow(), 41);
}
