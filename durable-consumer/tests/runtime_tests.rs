use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use durable_consumer::codec::{self, KeyValue};
use durable_consumer::test_utils::{
    wait_for, CommitEvent, HandlerMode, MemoryBroker, RecordingCommitHooks, RecordingHandler,
};
use durable_consumer::{
    AsyncHandler, CompletionSink, ConsumerConfig, ConsumerRuntime, Partition, Record,
    RuntimeState, StopPolicy,
};
use uuid::Uuid;

const TOPIC: &str = "test-topic";

fn unique_group() -> String {
    format!("test-group-{}", Uuid::now_v7())
}

fn test_config(group: &str) -> ConsumerConfig {
    ConsumerConfig::new("memory", group, &[TOPIC])
        .with_poll_timeout(Duration::from_millis(20))
        .with_commit_interval(Duration::from_millis(50))
        .with_commit_timeout(Duration::from_millis(500))
}

fn setup_broker(partitions: i32) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, partitions);
    broker
}

async fn assert_redelivered_after_failure(mode: HandlerMode) {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    broker.send(TOPIC, "test-key", "test-value");

    let failing = RecordingHandler::new(mode);
    let mut first = ConsumerRuntime::new(config.clone(), broker.client(&config), failing.clone());
    first.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || failing.call_count() == 1).await,
        "first consumer never received the record"
    );
    // Give the loop a few commit ticks to (not) commit
    tokio::time::sleep(Duration::from_millis(300)).await;
    first.stop().await.unwrap();
    assert_eq!(broker.committed_offset(&group, TOPIC, 0), None);

    let succeeding = RecordingHandler::new(HandlerMode::Succeed);
    let mut second =
        ConsumerRuntime::new(config.clone(), broker.client(&config), succeeding.clone());
    second.start().unwrap();
    let redelivered = wait_for(Duration::from_secs(5), || {
        succeeding.received_values() == vec!["test-value".to_string()]
    })
    .await;
    let committed = wait_for(Duration::from_secs(5), || {
        broker.committed_offset(&group, TOPIC, 0) == Some(1)
    })
    .await;
    second.stop().await.unwrap();

    assert!(redelivered, "record was not redelivered after {mode:?}");
    assert!(committed);
}

#[tokio::test]
async fn test_redelivery_after_failure_signal() {
    assert_redelivered_after_failure(HandlerMode::Fail).await;
}

#[tokio::test]
async fn test_redelivery_after_returned_error() {
    assert_redelivered_after_failure(HandlerMode::ReturnError).await;
}

#[tokio::test]
async fn test_redelivery_after_handler_panic() {
    assert_redelivered_after_failure(HandlerMode::Panic).await;
}

#[tokio::test]
async fn test_no_redelivery_after_commit() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    let partition = Partition::new(TOPIC, 0);
    broker.send(TOPIC, "test-key", "test-value");

    let hooks = Arc::new(RecordingCommitHooks::default());
    let first_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut first = ConsumerRuntime::new(config.clone(), broker.client(&config), first_handler.clone())
        .with_commit_hooks(hooks.clone());
    first.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || hooks.last_committed(&partition) == Some(1)).await,
        "offset was never committed"
    );
    first.stop().await.unwrap();
    assert_eq!(first_handler.received_values(), vec!["test-value".to_string()]);

    let second_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut second =
        ConsumerRuntime::new(config.clone(), broker.client(&config), second_handler.clone());
    second.start().unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(second_handler.received().is_empty());

    broker.send(TOPIC, "test-key", "another-value");
    let received = wait_for(Duration::from_secs(5), || {
        second_handler.received_values() == vec!["another-value".to_string()]
    })
    .await;
    second.stop().await.unwrap();

    assert!(received);
}

#[tokio::test]
async fn test_soft_stop_keeps_partitions_until_evicted() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group)
        .with_max_poll_interval(Duration::from_secs(1))
        .with_stop_policy(StopPolicy::Soft);
    broker.send(TOPIC, "test-key", "first");

    let first_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut first =
        ConsumerRuntime::new(config.clone(), broker.client(&config), first_handler.clone());
    first.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            broker.committed_offset(&group, TOPIC, 0) == Some(1)
        })
        .await
    );
    first.stop().await.unwrap();
    let stopped_at = Instant::now();
    assert_eq!(broker.member_count(&group), 1);

    broker.send(TOPIC, "test-key", "second");
    let second_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut second =
        ConsumerRuntime::new(config.clone(), broker.client(&config), second_handler.clone());
    second.start().unwrap();

    // The stopped member still owns the partition
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(second_handler.received().is_empty());

    let received = wait_for(Duration::from_secs(5), || {
        second_handler.received_values() == vec!["second".to_string()]
    })
    .await;
    let waited = stopped_at.elapsed();
    second.stop().await.unwrap();

    assert!(received, "second consumer never took over the partition");
    assert!(waited >= Duration::from_millis(900));
    assert_eq!(first_handler.received_values(), vec!["first".to_string()]);
}

#[tokio::test]
async fn test_hard_stop_hands_over_immediately() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group).with_max_poll_interval(Duration::from_secs(60));
    broker.send(TOPIC, "test-key", "first");

    let first_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut first =
        ConsumerRuntime::new(config.clone(), broker.client(&config), first_handler.clone());
    first.start().unwrap();
    assert!(wait_for(Duration::from_secs(5), || first_handler.call_count() == 1).await);
    first.stop().await.unwrap();
    assert_eq!(broker.member_count(&group), 0);

    broker.send(TOPIC, "test-key", "second");
    let second_handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut second =
        ConsumerRuntime::new(config.clone(), broker.client(&config), second_handler.clone());
    second.start().unwrap();
    let received = wait_for(Duration::from_secs(5), || {
        second_handler.received_values() == vec!["second".to_string()]
    })
    .await;
    second.stop().await.unwrap();

    assert!(received);
}

#[tokio::test]
async fn test_commit_resumes_after_coordinator_outage() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    let partition = Partition::new(TOPIC, 0);

    let hooks = Arc::new(RecordingCommitHooks::default());
    let handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler.clone())
        .with_commit_hooks(hooks.clone());
    runtime.start().unwrap();

    broker.send(TOPIC, "test-key", "a");
    assert!(
        wait_for(Duration::from_secs(5), || {
            broker.committed_offset(&group, TOPIC, 0) == Some(1)
        })
        .await
    );

    broker.set_commits_available(false);
    broker.send(TOPIC, "test-key", "b");
    broker.send(TOPIC, "test-key", "c");
    assert!(wait_for(Duration::from_secs(5), || handler.call_count() == 3).await);
    assert!(wait_for(Duration::from_secs(5), || hooks.failed_count() >= 1).await);
    assert_eq!(broker.committed_offset(&group, TOPIC, 0), Some(1));

    broker.set_commits_available(true);
    assert!(
        wait_for(Duration::from_secs(5), || {
            broker.committed_offset(&group, TOPIC, 0) == Some(3)
        })
        .await
    );
    runtime.stop().await.unwrap();

    // Every failed attempt carried the offsets completed since the last success
    for event in hooks.events() {
        if let CommitEvent::Failed(offsets, _) = event {
            assert!(offsets.get(&partition).is_some_and(|o| *o > 1));
        }
    }

    // Nothing handled is redelivered
    let next = RecordingHandler::new(HandlerMode::Succeed);
    let mut after = ConsumerRuntime::new(config.clone(), broker.client(&config), next.clone());
    after.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    after.stop().await.unwrap();
    assert!(next.received().is_empty());
    assert_eq!(handler.received_values(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_polling_resumes_after_broker_outage() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);

    let handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler.clone());
    runtime.start().unwrap();

    broker.send(TOPIC, "test-key", "before");
    assert!(
        wait_for(Duration::from_secs(5), || {
            broker.committed_offset(&group, TOPIC, 0) == Some(1)
        })
        .await
    );

    broker.set_available(false);
    broker.send(TOPIC, "test-key", "during");
    // Long enough for several failed polls and back-offs
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(handler.received_values(), vec!["before"]);
    assert_eq!(runtime.state(), RuntimeState::Running);

    broker.set_available(true);
    let committed = wait_for(Duration::from_secs(5), || {
        broker.committed_offset(&group, TOPIC, 0) == Some(2)
    })
    .await;
    assert_eq!(runtime.state(), RuntimeState::Running);
    runtime.stop().await.unwrap();

    assert!(committed, "loop did not recover after the broker came back");
    assert_eq!(handler.received_values(), vec!["before", "during"]);
}

#[tokio::test]
async fn test_slow_commit_times_out_and_recovers() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group).with_commit_timeout(Duration::from_millis(100));

    let hooks = Arc::new(RecordingCommitHooks::default());
    let handler = RecordingHandler::new(HandlerMode::Succeed);
    broker.set_commit_delay(Duration::from_secs(2));
    broker.send(TOPIC, "test-key", "slow");

    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler.clone())
        .with_commit_hooks(hooks.clone());
    runtime.start().unwrap();
    assert!(wait_for(Duration::from_secs(5), || hooks.failed_count() >= 1).await);
    let timed_out = hooks.events().iter().any(|e| match e {
        CommitEvent::Failed(_, error) => error.contains("did not complete"),
        _ => false,
    });
    assert!(timed_out);

    broker.set_commit_delay(Duration::ZERO);
    let committed = wait_for(Duration::from_secs(5), || {
        broker.committed_offset(&group, TOPIC, 0) == Some(1)
    })
    .await;
    runtime.stop().await.unwrap();

    assert!(committed);
}

#[tokio::test]
async fn test_hanging_handler_keeps_polling_and_blocks_commit() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group).with_max_poll_interval(Duration::from_millis(500));

    let held: Arc<Mutex<Vec<CompletionSink>>> = Arc::default();
    let stash = held.clone();
    let received: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = received.clone();
    let handler = move |record: Record, sink: CompletionSink| -> anyhow::Result<()> {
        let value = record.value().unwrap_or_default().to_string();
        seen.lock().unwrap().push(value.clone());
        if value == "hang" {
            stash.lock().unwrap().push(sink);
        } else {
            sink.succeed();
        }
        Ok(())
    };

    broker.send(TOPIC, "test-key", "hang");
    broker.send(TOPIC, "test-key", "ok-1");
    broker.send(TOPIC, "test-key", "ok-2");

    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler);
    runtime.start().unwrap();
    assert!(wait_for(Duration::from_secs(5), || received.lock().unwrap().len() == 3).await);

    // Well past the max poll interval, the member is still in the group
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(broker.member_count(&group), 1);
    assert_eq!(broker.committed_offset(&group, TOPIC, 0), None);
    runtime.stop().await.unwrap();

    let next = RecordingHandler::new(HandlerMode::Succeed);
    let mut after = ConsumerRuntime::new(config.clone(), broker.client(&config), next.clone());
    after.start().unwrap();
    let redelivered = wait_for(Duration::from_secs(5), || next.call_count() == 3).await;
    after.stop().await.unwrap();

    assert!(redelivered);
    assert_eq!(next.received_values(), vec!["hang", "ok-1", "ok-2"]);
    assert_eq!(held.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_message_record_dispatches_each_message() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    let payload = codec::encode(&[
        KeyValue::new("key-1", "value-1"),
        KeyValue::new("key-2", "value-2"),
        KeyValue::new("key-3", "value-3"),
    ]);
    broker.send_bytes(TOPIC, 0, None, payload);

    let handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler.clone());
    runtime.start().unwrap();
    let committed = wait_for(Duration::from_secs(5), || {
        broker.committed_offset(&group, TOPIC, 0) == Some(1)
    })
    .await;
    runtime.stop().await.unwrap();

    assert!(committed);
    let received = handler.received();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|r| r.offset() == 0));
    let keys: Vec<&str> = received.iter().filter_map(Record::key_str).collect();
    assert_eq!(keys, vec!["key-1", "key-2", "key-3"]);
    assert_eq!(handler.received_values(), vec!["value-1", "value-2", "value-3"]);
}

#[tokio::test]
async fn test_failed_sub_message_withholds_whole_record() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    let payload = codec::encode(&[
        KeyValue::new("key-1", "value-1"),
        KeyValue::new("key-2", "bad"),
    ]);
    broker.send_bytes(TOPIC, 0, None, payload);

    let handler = |record: Record, sink: CompletionSink| -> anyhow::Result<()> {
        if record.value() == Some("bad") {
            sink.fail("rejected");
        } else {
            sink.succeed();
        }
        Ok(())
    };
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler);
    runtime.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    runtime.stop().await.unwrap();

    assert_eq!(broker.committed_offset(&group, TOPIC, 0), None);
}

#[tokio::test]
async fn test_empty_multi_message_record_is_skipped() {
    let broker = setup_broker(1);
    let group = unique_group();
    let config = test_config(&group);
    broker.send_bytes(TOPIC, 0, None, codec::encode(&[]));
    broker.send(TOPIC, "test-key", "after");

    let handler = RecordingHandler::new(HandlerMode::Succeed);
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler.clone());
    runtime.start().unwrap();
    let committed = wait_for(Duration::from_secs(5), || {
        broker.committed_offset(&group, TOPIC, 0) == Some(2)
    })
    .await;
    runtime.stop().await.unwrap();

    assert!(committed);
    assert_eq!(handler.received_values(), vec!["after"]);
}

#[tokio::test]
async fn test_async_handler_commits_across_partitions() {
    let broker = setup_broker(3);
    let group = unique_group();
    let config = test_config(&group);
    for i in 0..30 {
        broker.send(TOPIC, &format!("key-{i}"), &format!("value-{i}"));
    }

    let handler = AsyncHandler::new(|record: Record| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match record.value() {
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!("record without payload")),
        }
    });
    let mut runtime = ConsumerRuntime::new(config.clone(), broker.client(&config), handler);
    runtime.start().unwrap();
    let all_committed = wait_for(Duration::from_secs(10), || {
        (0..3)
            .map(|p| broker.committed_offset(&group, TOPIC, p).unwrap_or(0))
            .sum::<i64>()
            == 30
    })
    .await;
    runtime.stop().await.unwrap();

    assert!(all_committed);
}
