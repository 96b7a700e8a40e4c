//! Handler invocation and completion signalling
//!
//! A handler receives each record together with a `CompletionSink` and must
//! eventually report success or failure through it, from any thread or task.
//! Whatever happens during the call itself (a returned error, a panic, a dropped
//! sink) is folded into the same `HandlerOutcome`, so the consumer loop only ever
//! deals with one kind of completion.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::broker::{Partition, Record};
use crate::metrics_consts::{HANDLER_DISPATCHES, HANDLER_SINKS_DROPPED};
use crate::watermark::DispatchId;

/// Result of handling one record - simple success/failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Failed(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}

/// Completion signal travelling from a handler back to the consumer loop
#[derive(Debug, Clone)]
pub struct Completion {
    pub dispatch: DispatchId,
    pub outcome: HandlerOutcome,
    pub elapsed_ms: u64,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

const SINK_DROPPED: &str = "completion sink dropped without a signal";

/// Shared between a sink and the invoker's guard; whichever resolves first wins.
struct CompletionSlot {
    dispatch: DispatchId,
    resolved: AtomicBool,
    invocation: Mutex<InvocationState>,
    created_at: Instant,
    completion_tx: CompletionSender,
}

/// While the handler call is in progress the invoker owns the decision about a
/// sink dropped without a signal, so a returned error or panic is reported as such.
struct InvocationState {
    active: bool,
    sink_dropped: bool,
}

impl CompletionSlot {
    /// Called when a sink goes away unsignalled. Returns false if the invoker will
    /// resolve the dispatch once the handler call returns.
    fn sink_dropped(&self) -> bool {
        let mut invocation = self.invocation.lock().unwrap_or_else(PoisonError::into_inner);
        if invocation.active {
            invocation.sink_dropped = true;
            return false;
        }
        drop(invocation);
        self.resolve_dropped()
    }

    /// Ends the handler call. Returns whether the sink was dropped during it.
    fn finish_invocation(&self) -> bool {
        let mut invocation = self.invocation.lock().unwrap_or_else(PoisonError::into_inner);
        invocation.active = false;
        invocation.sink_dropped
    }

    fn resolve_dropped(&self) -> bool {
        let resolved = self.resolve(HandlerOutcome::Failed(SINK_DROPPED.to_string()));
        if resolved {
            error!(
                topic = self.dispatch.partition.topic(),
                partition = self.dispatch.partition.partition_number(),
                offset = self.dispatch.offset,
                "Completion sink dropped without a signal, treating as failed"
            );
            metrics::counter!(HANDLER_SINKS_DROPPED).increment(1);
        }
        resolved
    }

    fn resolve(&self, outcome: HandlerOutcome) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }

        let status = if outcome.is_success() {
            "success"
        } else {
            "failed"
        };
        metrics::counter!(HANDLER_DISPATCHES, "outcome" => status).increment(1);

        let completion = Completion {
            dispatch: self.dispatch.clone(),
            outcome,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
        };
        if self.completion_tx.send(completion).is_err() {
            // The runtime stopped; its watermarks are gone, nothing left to update
            debug!(
                topic = self.dispatch.partition.topic(),
                partition = self.dispatch.partition.partition_number(),
                offset = self.dispatch.offset,
                "Completion arrived after the consumer stopped"
            );
        }
        true
    }
}

/// Handed to the handler with each record. Consuming `self` on every signal makes
/// it impossible to complete the same dispatch twice.
pub struct CompletionSink {
    slot: Arc<CompletionSlot>,
    signalled: bool,
}

impl CompletionSink {
    fn new(slot: Arc<CompletionSlot>) -> Self {
        Self {
            slot,
            signalled: false,
        }
    }

    pub fn succeed(self) {
        self.complete(HandlerOutcome::Success);
    }

    pub fn fail(self, cause: impl std::fmt::Display) {
        self.complete(HandlerOutcome::Failed(cause.to_string()));
    }

    pub fn complete(mut self, outcome: HandlerOutcome) {
        self.signalled = true;
        if !self.slot.resolve(outcome) {
            warn!(
                topic = self.partition().topic(),
                partition = self.partition().partition_number(),
                offset = self.offset(),
                "Dispatch was already resolved, ignoring signal"
            );
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.slot.dispatch.partition
    }

    pub fn offset(&self) -> i64 {
        self.slot.dispatch.offset
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if !self.signalled {
            self.slot.sink_dropped();
        }
    }
}

/// Application callback for consumed records.
///
/// `handle` is called on the consumer loop and must not block: hand the work off
/// and signal through the sink once it is done. Returning an error (or panicking)
/// is treated as a failed outcome.
pub trait RecordHandler: Send + Sync + 'static {
    fn handle(&self, record: Record, sink: CompletionSink) -> anyhow::Result<()>;
}

impl<F> RecordHandler for F
where
    F: Fn(Record, CompletionSink) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, record: Record, sink: CompletionSink) -> anyhow::Result<()> {
        self(record, sink)
    }
}

/// Runs an async function per record on its own Tokio task and completes the sink
/// with its result.
pub struct AsyncHandler<F> {
    f: F,
}

impl<F> AsyncHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> RecordHandler for AsyncHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, record: Record, sink: CompletionSink) -> anyhow::Result<()> {
        let fut = (self.f)(record);
        tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => sink.succeed(),
                Ok(Err(e)) => sink.fail(format!("{e:#}")),
                Err(panic) => sink.fail(panic_message(panic.as_ref())),
            }
        });
        Ok(())
    }
}

/// Calls the handler for each dispatch and guarantees exactly one completion.
pub struct HandlerInvoker<H> {
    handler: Arc<H>,
    completion_tx: CompletionSender,
}

impl<H: RecordHandler> HandlerInvoker<H> {
    pub fn new(handler: Arc<H>) -> (Self, CompletionReceiver) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        (
            Self {
                handler,
                completion_tx,
            },
            completion_rx,
        )
    }

    pub fn invoke(&self, record: Record, dispatch: DispatchId) {
        let slot = Arc::new(CompletionSlot {
            dispatch,
            resolved: AtomicBool::new(false),
            invocation: Mutex::new(InvocationState {
                active: true,
                sink_dropped: false,
            }),
            created_at: Instant::now(),
            completion_tx: self.completion_tx.clone(),
        });
        let sink = CompletionSink::new(slot.clone());

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(record, sink)));
        let sink_dropped = slot.finish_invocation();
        let cause = match result {
            Ok(Ok(())) => {
                if sink_dropped {
                    slot.resolve_dropped();
                }
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        error!(
            topic = slot.dispatch.partition.topic(),
            partition = slot.dispatch.partition.partition_number(),
            offset = slot.dispatch.offset,
            error = %cause,
            "Handler failed during invocation"
        );
        slot.resolve(HandlerOutcome::Failed(cause));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
