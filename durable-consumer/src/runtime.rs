//! Consumer Runtime - owns the polling loop and the consumer lifecycle
//!
//! `start()` subscribes and spawns one Tokio task that polls, dispatches every
//! record to the handler right away, folds handler completions into the watermark
//! tracker and commits on a fixed cadence. `stop()` ends that task and then applies
//! the configured `StopPolicy` to the broker client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, Record};
use crate::codec;
use crate::commit::{CommitCoordinator, CommitHooks, NoopCommitHooks};
use crate::config::{ConsumerConfig, StopPolicy};
use crate::error::{BrokerError, ConsumerError};
use crate::handler::{CompletionReceiver, HandlerInvoker, HandlerOutcome, RecordHandler};
use crate::kafka::KafkaBrokerClient;
use crate::metrics_consts::{CONSUMER_FORMAT_ERRORS, CONSUMER_RECORDS_RECEIVED};
use crate::watermark::WatermarkTracker;

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Subscribing failed, the instance cannot be used
    Failed,
}

pub struct ConsumerRuntime<C: BrokerClient, H: RecordHandler> {
    config: ConsumerConfig,
    state: RuntimeState,
    started: bool,
    client: Option<C>,
    handler: Arc<H>,
    commit_hooks: Arc<dyn CommitHooks>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    loop_handle: Option<JoinHandle<C>>,
    // Kept open but never polled after a soft stop
    retained_client: Option<C>,
}

impl<H: RecordHandler> ConsumerRuntime<KafkaBrokerClient, H> {
    /// Runtime consuming from Kafka with a client built from `config`.
    pub fn for_kafka(config: ConsumerConfig, handler: H) -> Result<Self, BrokerError> {
        let client = KafkaBrokerClient::new(&config)?;
        Ok(Self::new(config, client, handler))
    }
}

impl<C: BrokerClient, H: RecordHandler> ConsumerRuntime<C, H> {
    pub fn new(config: ConsumerConfig, client: C, handler: H) -> Self {
        Self {
            config,
            state: RuntimeState::Stopped,
            started: false,
            client: Some(client),
            handler: Arc::new(handler),
            commit_hooks: Arc::new(NoopCommitHooks),
            shutdown_tx: None,
            loop_handle: None,
            retained_client: None,
        }
    }

    pub fn with_commit_hooks(mut self, hooks: Arc<dyn CommitHooks>) -> Self {
        self.commit_hooks = hooks;
        self
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Subscribe and spawn the polling loop. Must be called from within a Tokio
    /// runtime, and at most once per instance.
    pub fn start(&mut self) -> Result<(), ConsumerError> {
        if self.started {
            return Err(ConsumerError::AlreadyStarted);
        }
        let Some(client) = self.client.take() else {
            return Err(ConsumerError::AlreadyStarted);
        };
        self.started = true;
        self.state = RuntimeState::Starting;

        if let Err(e) = client.subscribe(self.config.topics()) {
            error!(
                group = %self.config.kafka_consumer_group,
                error = ?e,
                "Failed to subscribe consumer"
            );
            self.state = RuntimeState::Failed;
            return Err(ConsumerError::Subscribe(e));
        }

        let (invoker, completions) = HandlerInvoker::new(self.handler.clone());
        let consumer_loop = ConsumerLoop {
            client,
            invoker,
            completions,
            tracker: WatermarkTracker::new(),
            coordinator: CommitCoordinator::new(
                self.config.commit_timeout.0,
                self.commit_hooks.clone(),
            ),
            poll_timeout: self.config.poll_timeout.0,
            max_poll_records: self.config.max_poll_records.max(1),
            commit_interval: self.config.commit_interval.0,
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.loop_handle = Some(tokio::spawn(consumer_loop.run(shutdown_rx)));
        self.state = RuntimeState::Running;

        info!(
            group = %self.config.kafka_consumer_group,
            topics = ?self.config.topics(),
            "Consumer started"
        );
        Ok(())
    }

    /// Stop the polling loop and wait for it to finish, then close or retain the
    /// broker client according to the stop policy. A no-op unless running.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        if self.state != RuntimeState::Running {
            debug!(state = ?self.state, "Stop requested while not running, ignoring");
            return Ok(());
        }
        self.state = RuntimeState::Stopping;
        info!(group = %self.config.kafka_consumer_group, "Stopping consumer");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            // The loop only exits on this signal, so it is still listening
            if shutdown_tx.send(()).is_err() {
                warn!("Consumer loop already gone when stop was requested");
            }
        }

        let Some(loop_handle) = self.loop_handle.take() else {
            self.state = RuntimeState::Stopped;
            return Ok(());
        };

        let client = match loop_handle.await {
            Ok(client) => client,
            Err(e) => {
                error!(error = ?e, "Consumer loop terminated abnormally");
                self.state = RuntimeState::Stopped;
                return Err(ConsumerError::LoopPanicked);
            }
        };

        match self.config.stop_policy {
            StopPolicy::Hard => client.close(),
            StopPolicy::Soft => {
                info!(
                    max_poll_interval_ms = self.config.max_poll_interval.0.as_millis() as u64,
                    "Soft stop, keeping group membership until the broker evicts this member"
                );
                self.retained_client = Some(client);
            }
        }

        self.state = RuntimeState::Stopped;
        info!(group = %self.config.kafka_consumer_group, "Consumer stopped");
        Ok(())
    }
}

/// State owned by the polling task.
struct ConsumerLoop<C, H> {
    client: C,
    invoker: HandlerInvoker<H>,
    completions: CompletionReceiver,
    tracker: WatermarkTracker,
    coordinator: CommitCoordinator,
    poll_timeout: Duration,
    max_poll_records: usize,
    commit_interval: Duration,
}

impl<C: BrokerClient, H: RecordHandler> ConsumerLoop<C, H> {
    /// Runs until shutdown is signalled (or its sender is dropped) and hands the
    /// client back.
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> C {
        info!("Starting consumer loop");
        let mut last_commit = Instant::now();

        loop {
            let polled = tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }
                polled = self.client.poll(self.poll_timeout, self.max_poll_records) => polled,
            };

            match polled {
                Ok(records) => {
                    // Revocations surface while polling; forget those partitions
                    // before tracking anything from this batch
                    self.apply_revoked();
                    if !records.is_empty() {
                        metrics::counter!(CONSUMER_RECORDS_RECEIVED).increment(records.len() as u64);
                    }
                    for record in records {
                        self.dispatch(record);
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(error = ?e, "Poll failed with a non-retriable error, backing off");
                    } else {
                        warn!(error = ?e, "Poll failed, backing off");
                    }
                    self.apply_revoked();
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            info!("Shutdown signal received");
                            break;
                        }
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }

            self.drain_completions();

            if last_commit.elapsed() >= self.commit_interval {
                self.coordinator
                    .attempt_commit(&self.client, &self.tracker)
                    .await;
                last_commit = Instant::now();
            }
        }

        // Persist whatever completed up to now before handing the client back
        self.drain_completions();
        self.coordinator
            .attempt_commit(&self.client, &self.tracker)
            .await;

        if self.tracker.pending_count() > 0 {
            info!(
                pending = self.tracker.pending_count(),
                "Consumer loop exiting with unconfirmed records, they will be redelivered"
            );
        }
        info!("Consumer loop stopped");
        self.client
    }

    fn dispatch(&mut self, record: Record) {
        let partition = record.topic_partition();
        let offset = record.offset();

        let unpacked = record
            .payload()
            .filter(|payload| codec::is_multi_message(payload))
            .map(codec::decode);

        match unpacked {
            None => {
                let dispatch = self.tracker.record_dispatched(&partition, offset);
                self.invoker.invoke(record, dispatch);
            }
            Some(Ok(messages)) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    messages = messages.len(),
                    "Unpacked multi-message record"
                );
                let dispatch = self
                    .tracker
                    .record_dispatched_n(&partition, offset, messages.len());
                for message in messages {
                    let unpacked_record = Record::new(
                        record.topic(),
                        record.partition(),
                        offset,
                        Some(message.key.into_bytes()),
                        Some(message.value.into_bytes()),
                    );
                    self.invoker.invoke(unpacked_record, dispatch.clone());
                }
            }
            Some(Err(e)) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    error = ?e,
                    "Corrupt multi-message payload, offset will not be committed"
                );
                metrics::counter!(CONSUMER_FORMAT_ERRORS).increment(1);
                let dispatch = self.tracker.record_dispatched(&partition, offset);
                self.tracker.record_completed(&dispatch, false);
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            if let HandlerOutcome::Failed(cause) = &completion.outcome {
                warn!(
                    topic = completion.dispatch.partition.topic(),
                    partition = completion.dispatch.partition.partition_number(),
                    offset = completion.dispatch.offset,
                    elapsed_ms = completion.elapsed_ms,
                    cause = ?cause,
                    "Record handling failed"
                );
            }
            self.tracker
                .record_completed(&completion.dispatch, completion.outcome.is_success());
        }
    }

    fn apply_revoked(&mut self) {
        let revoked = self.client.take_revoked();
        if revoked.is_empty() {
            return;
        }

        info!("Dropping state for {} revoked partitions", revoked.len());
        for partition in &revoked {
            self.tracker.clear_partition(partition);
        }
        self.coordinator.forget_partitions(&revoked);
    }
}
