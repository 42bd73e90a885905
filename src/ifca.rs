//! The in-flight chunk array engine.
//!
//! An [`Ifca`] accepts chunks through [`write`](Ifca::write), runs each one
//! through its transform chain on a spawned task, and hands results to
//! [`read`](Ifca::read) callers, in write order unless configured otherwise.
//! Up to `max_parallel` chunks are held at once before writers are asked to
//! wait on a drain signal.

use std::any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::{ready, FutureExt};
use tokio::runtime::Handle;

use crate::backpressure::Backpressure;
use crate::chain::{self, Chain, Flow};
use crate::config::IfcaConfig;
use crate::error::{Error, Result};
#[cfg(feature = "metrics")]
use crate::metrics::StageMetrics;
use crate::queue::{ProcessingQueue, QueueRead, Ticket};
use crate::signal::{Resolvable, Signal};
use crate::tracing_support;
use crate::transform::{Chunk, ErrorHandler, StageResult, Transform, TransformHandlers};

/// Receives chunk failures that no error handler recovered.
pub type FaultHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// A snapshot of an engine's progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfcaState {
    /// Chunks still running through the chain
    pub pending: usize,
    /// Chunks settled and waiting for a reader
    pub ready: usize,
    /// `pending + ready`, the count compared against `max_parallel`
    pub all: usize,
    /// Reads waiting for a chunk
    pub readers: usize,
    pub max_parallel: usize,
    pub strict: bool,
    pub ordered: bool,
    /// Whether `end` has been called
    pub ended: bool,
    /// Chunks that failed without recovery so far
    pub failed: usize,
}

struct EngineState {
    queue: ProcessingQueue<Chunk>,
    ended: bool,
    written: u64,
}

/// State shared between an engine, its processing tasks and its readers.
struct Shared {
    name: String,
    state: Mutex<EngineState>,
    backpressure: Arc<Backpressure>,
    on_fault: Mutex<FaultHandler>,
    failed: AtomicUsize,
    #[cfg(feature = "metrics")]
    metrics: StageMetrics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a failure and pass it to the fault handler, outside any lock
    fn fault(&self, error: Error) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        self.metrics.record_failed();

        let handler = Arc::clone(&self.on_fault.lock().unwrap_or_else(PoisonError::into_inner));
        if panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
            ifca_warn!(stage = %self.name, "fault handler panicked");
        }
    }

    fn read(&self) -> QueueRead<Chunk> {
        self.lock().queue.read()
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn log_fault(stage: &str, error: &Error) {
    ifca_warn!(stage = %stage, error = %error, "chunk failed without an error handler");
}

/// A bounded-parallelism, order-preserving transform engine.
///
/// `S` is the type written into the engine and `T` the type read out of it.
/// Adding transforms consumes the engine and returns it with the new output
/// type, so a chain is built fluently before any chunk is written:
///
/// ```rust
/// use ifca::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let ifca = Ifca::<u32>::new(IfcaConfig::new(4))?
///         .map(|x| x + 1)
///         .filter(|x| x % 2 == 0);
///
///     for x in 0..6 {
///         ifca.write(x)?;
///     }
///     ifca.end()?;
///
///     assert_eq!(ifca.read_to_end().await, vec![2, 4, 6]);
///     Ok(())
/// }
/// ```
pub struct Ifca<S, T = S> {
    config: IfcaConfig,
    handlers: TransformHandlers,
    shared: Arc<Shared>,
    _types: PhantomData<fn(S) -> T>,
}

impl<S> Ifca<S, S>
where
    S: Send + 'static,
{
    /// Create an engine with no transforms
    pub fn new(config: IfcaConfig) -> Result<Self> {
        config.validate()?;

        let backpressure = Arc::new(Backpressure::new(config.max_parallel));
        let release = Arc::clone(&backpressure);
        let queue = ProcessingQueue::new(Box::new(move |len| release.release(len)));

        let name = config.name.clone();
        let on_fault: FaultHandler = Arc::new(move |error: Error| log_fault(&name, &error));

        ifca_debug!(
            stage = %config.name,
            max_parallel = config.max_parallel,
            strict = config.strict,
            ordered = config.ordered,
            "engine created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                state: Mutex::new(EngineState {
                    queue,
                    ended: false,
                    written: 0,
                }),
                backpressure,
                on_fault: Mutex::new(on_fault),
                failed: AtomicUsize::new(0),
                #[cfg(feature = "metrics")]
                metrics: StageMetrics::new(config.name.clone()),
            }),
            config,
            handlers: TransformHandlers::default(),
            _types: PhantomData,
        })
    }
}

impl<S, T> Ifca<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    /// Write a chunk.
    ///
    /// Returns a drain signal once the engine holds `max_parallel` chunks or
    /// more; callers should await it before writing again. Fails with
    /// [`Error::WriteAfterEnd`] once the engine has ended. Transform failures
    /// never surface here.
    pub fn write(&self, chunk: S) -> Result<Option<Signal>> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        if self.shared.lock().ended {
            return Err(Error::WriteAfterEnd);
        }

        let plan = self.handlers.snapshot();
        let chunk: Chunk = Box::new(chunk);
        let chain = if self.config.strict {
            chain::strict(plan, chunk)
        } else {
            chain::lazy(plan, chunk)
        };

        let done = Resolvable::new();
        let (previous, drain, index) = {
            let mut state = self.shared.lock();
            if state.ended {
                return Err(Error::WriteAfterEnd);
            }
            let previous = state.queue.push(done.signal());
            let drain = self.shared.backpressure.admit(state.queue.len());
            state.written += 1;
            (previous, drain, state.written)
        };

        #[cfg(feature = "metrics")]
        self.shared.metrics.record_written();

        let task = process(
            Arc::clone(&self.shared),
            chain,
            self.config.ordered.then_some(previous),
            done,
        );
        runtime.spawn(tracing_support::instrument(task, &self.shared.name, index));

        if drain.is_some() {
            ifca_trace!(stage = %self.shared.name, index, "drain requested");
        }
        Ok(drain)
    }

    /// Write a chunk, with `None` ending the engine.
    ///
    /// Returns the end signal for `None`, otherwise the same as [`write`](Self::write).
    pub fn write_opt(&self, chunk: Option<S>) -> Result<Option<Signal>> {
        match chunk {
            Some(chunk) => self.write(chunk),
            None => self.end().map(Some),
        }
    }

    /// Write several chunks in order.
    ///
    /// A `None` ends the engine: chunks after it are discarded and the end
    /// signal is returned. Otherwise returns the result of the last write.
    pub fn writev<I>(&self, chunks: I) -> Result<Option<Signal>>
    where
        I: IntoIterator<Item = Option<S>>,
    {
        if self.is_ended() {
            return Err(Error::WriteAfterEnd);
        }

        let mut drain = None;
        for chunk in chunks {
            match chunk {
                Some(chunk) => drain = self.write(chunk)?,
                None => return self.end().map(Some),
            }
        }
        Ok(drain)
    }

    /// End the engine.
    ///
    /// No more writes are accepted. The returned signal resolves once every
    /// written chunk has settled; readers then receive `None`.
    pub fn end(&self) -> Result<Signal> {
        let mut state = self.shared.lock();
        if state.ended {
            return Err(Error::EndCalledTwice);
        }
        state.ended = true;
        state.queue.close();

        ifca_debug!(
            stage = %self.shared.name,
            written = state.written,
            pending = state.queue.pending_len(),
            "engine ended"
        );
        Ok(state.queue.drained())
    }

    /// Resolves once the engine has ended and every chunk has settled
    pub fn when_ended(&self) -> Signal {
        self.shared.lock().queue.drained()
    }

    pub fn is_ended(&self) -> bool {
        self.shared.lock().ended
    }

    /// Read the next chunk.
    ///
    /// The read is queued for wake-ups when this method is called, not when
    /// the returned future is first polled. Whichever read completes first
    /// gets the oldest ready chunk. Resolves to `None` once the engine has
    /// ended and drained.
    pub fn read(&self) -> Read<T> {
        Read {
            ticket: self.shared.lock().queue.request(),
            done: false,
            shared: Arc::clone(&self.shared),
            _type: PhantomData,
        }
    }

    /// Read every remaining chunk. Only completes once the engine is ended.
    pub async fn read_to_end(&self) -> Vec<T> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read().await {
            chunks.push(chunk);
        }
        chunks
    }

    /// Append a transform, changing the output type
    pub fn add_transform<U>(mut self, transform: Transform<T, U>) -> Ifca<S, U>
    where
        U: Send + 'static,
    {
        self.handlers.push(transform.into_handler());
        self.retype()
    }

    /// Append a catch-only error handler for failures of earlier transforms
    pub fn add_error_handler(mut self, handler: ErrorHandler<T>) -> Self {
        self.handlers.push(handler.into_handler());
        self
    }

    /// Remove the oldest transform.
    ///
    /// The input type must be restated, since the removed stage determined
    /// it. Chunks that do not match the next stage's input fail with
    /// [`Error::ChunkType`].
    pub fn remove_transform<S2>(mut self) -> Ifca<S2, T>
    where
        S2: Send + 'static,
    {
        self.handlers.shift();
        self.retype()
    }

    /// Append an infallible synchronous mapping
    pub fn map<U, F>(self, f: F) -> Ifca<S, U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.add_transform(Transform::map(f))
    }

    /// Append an infallible asynchronous mapping
    pub fn then<U, F, Fut>(self, f: F) -> Ifca<S, U>
    where
        U: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        self.add_transform(Transform::then(f))
    }

    /// Append a fallible synchronous transform
    pub fn try_map<U, F>(self, f: F) -> Ifca<S, U>
    where
        U: Send + 'static,
        F: Fn(T) -> StageResult<U> + Send + Sync + 'static,
    {
        self.add_transform(Transform::sync(f))
    }

    /// Keep only chunks matching the predicate
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.add_transform(Transform::filter(predicate))
    }

    /// Keep only chunks for which the asynchronous predicate holds
    pub fn filter_async<P, Fut>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.add_transform(Transform::filter_async(predicate))
    }

    /// Replace the handler for chunks failing without recovery.
    ///
    /// The default handler logs a warning. Failures are counted in
    /// [`IfcaState::failed`] either way.
    pub fn on_fault<F>(&self, handler: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Current progress counters
    pub fn state(&self) -> IfcaState {
        let state = self.shared.lock();
        IfcaState {
            pending: state.queue.pending_len(),
            ready: state.queue.ready_len(),
            all: state.queue.len(),
            readers: state.queue.readers(),
            max_parallel: self.config.max_parallel,
            strict: self.config.strict,
            ordered: self.config.ordered,
            ended: state.ended,
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &IfcaConfig {
        &self.config
    }

    /// Number of entries in the handler list
    pub fn transform_count(&self) -> usize {
        self.handlers.len()
    }

    /// Chunk counters for this engine
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> &StageMetrics {
        &self.shared.metrics
    }

    fn retype<S2, U>(self) -> Ifca<S2, U> {
        Ifca {
            config: self.config,
            handlers: self.handlers,
            shared: self.shared,
            _types: PhantomData,
        }
    }
}

impl<S, T> fmt::Debug for Ifca<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ifca")
            .field("name", &self.config.name)
            .field("input", &any::type_name::<S>())
            .field("output", &any::type_name::<T>())
            .field("handlers", &self.handlers)
            .field("queue", &self.shared.lock().queue)
            .finish()
    }
}

/// Drive one chunk: finish its chain, wait for its predecessor when ordered,
/// then settle the result into the queue.
async fn process(shared: Arc<Shared>, chain: Chain, previous: Option<Signal>, done: Resolvable) {
    let flow = chain.resolve().await;

    if let Some(previous) = previous {
        previous.await;
    }

    let chunk = match flow {
        Flow::Value(chunk) => {
            #[cfg(feature = "metrics")]
            shared.metrics.record_emitted();
            Some(chunk)
        }
        Flow::Dropped => {
            #[cfg(feature = "metrics")]
            shared.metrics.record_dropped();
            None
        }
        Flow::Aborted => {
            ifca_trace!(stage = %shared.name, "chunk aborted");
            #[cfg(feature = "metrics")]
            shared.metrics.record_dropped();
            None
        }
        Flow::Failed(error) => {
            shared.fault(error);
            None
        }
    };

    shared.lock().queue.settle(chunk);
    done.resolve();
}

/// A pending read returned by [`Ifca::read`].
///
/// A read takes its chunk from the engine only when it completes, so reads
/// always complete in write order. Waiting reads are woken in the order they
/// were issued. Dropping a read gives up its place in line without taking a
/// chunk with it.
#[must_use = "a read does nothing unless awaited"]
pub struct Read<T> {
    ticket: Option<Ticket>,
    done: bool,
    shared: Arc<Shared>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Read<T> {
    /// Whether a chunk (or the end of the stream) was available when the
    /// read was issued
    pub fn is_ready(&self) -> bool {
        self.ticket.is_none()
    }

    /// Take the result without waiting.
    ///
    /// Returns `None` if nothing is available yet, which also cancels the read.
    pub fn now(self) -> Option<Option<T>> {
        self.now_or_never()
    }
}

impl<T: Send + 'static> Future for Read<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            if let Some(ticket) = self.ticket.as_mut() {
                // woken, or the ticket was dropped: look at the queue again
                let _ = ready!(Pin::new(ticket).poll(cx));
                self.ticket = None;
            }

            let chunk = match self.shared.read() {
                QueueRead::Ready(Some(chunk)) => chunk,
                QueueRead::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                QueueRead::Waiting(ticket) => {
                    self.ticket = Some(ticket);
                    continue;
                }
            };

            match chunk.downcast::<T>() {
                Ok(value) => {
                    self.done = true;
                    return Poll::Ready(Some(*value));
                }
                Err(_) => self.shared.fault(Error::ChunkType {
                    expected: any::type_name::<T>(),
                }),
            }
        }
    }
}

impl<T> Drop for Read<T> {
    fn drop(&mut self) {
        let Some(mut ticket) = self.ticket.take() else {
            return;
        };

        ticket.close();
        if ticket.try_recv().is_ok() {
            // woken but never read: the chunk is still up for grabs
            self.shared.lock().queue.wake_next();
        }
    }
}

impl<T> fmt::Debug for Read<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (&self.ticket, self.done) {
            (_, true) => "done",
            (Some(_), false) => "waiting",
            (None, false) => "ready",
        };
        f.debug_struct("Read").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn engine(max_parallel: usize) -> Ifca<u32> {
        Ifca::new(IfcaConfig::new(max_parallel)).unwrap()
    }

    #[test]
    fn test_write_needs_runtime() {
        let ifca = engine(2);
        assert!(matches!(ifca.write(1), Err(Error::NoRuntime)));
    }

    #[test]
    fn test_invalid_config() {
        let result = Ifca::<u32>::new(IfcaConfig::new(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_strict_write_runs_sync_chain_eagerly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ifca = engine(4).map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * 2
        });

        ifca.write(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // settling still happens on the processing task
        assert_eq!(ifca.state().pending, 1);

        assert_eq!(ifca.read().await, Some(2));
    }

    #[tokio::test]
    async fn test_reads_complete_in_write_order() {
        let ifca = engine(4);
        let first = ifca.read();
        let second = ifca.read();
        assert_eq!(ifca.state().readers, 2);

        ifca.write(1).unwrap();
        ifca.write(2).unwrap();

        // whichever read completes first takes the oldest chunk
        assert_eq!(second.await, Some(1));
        assert_eq!(first.await, Some(2));
    }

    #[tokio::test]
    async fn test_abandoned_woken_read_keeps_order() {
        let ifca = engine(4);
        let abandoned = ifca.read();
        let kept = ifca.read();

        ifca.write(1).unwrap();
        ifca.write(2).unwrap();

        assert_eq!(kept.await, Some(1));
        drop(abandoned);
        ifca.end().unwrap();

        assert_eq!(ifca.read_to_end().await, vec![2]);
    }

    #[tokio::test]
    async fn test_woken_read_dropped_passes_wake_on() {
        let ifca = engine(4);
        let abandoned = ifca.read();
        let kept = ifca.read();

        ifca.write(1).unwrap();
        while ifca.state().ready == 0 {
            tokio::task::yield_now().await;
        }

        // the first read was woken for the chunk but never polled
        drop(abandoned);
        assert_eq!(kept.await, Some(1));
    }

    #[tokio::test]
    async fn test_dropped_read_takes_no_chunk() {
        let ifca = engine(4);
        ifca.write(7).unwrap();
        ifca.end().unwrap().await;

        let read = ifca.read();
        assert!(read.is_ready());
        drop(read);

        assert_eq!(ifca.state().ready, 1);
        assert_eq!(ifca.read().await, Some(7));
        assert_eq!(ifca.read().await, None);
    }

    #[tokio::test]
    async fn test_cancelled_reads_do_not_accumulate() {
        let ifca = engine(4);

        for _ in 0..10_000 {
            assert_eq!(ifca.read().now(), None);
        }

        assert_eq!(ifca.state().readers, 0);
        assert!(ifca.shared.lock().queue.requested_len() <= 1);

        ifca.write(5).unwrap();
        ifca.end().unwrap();
        assert_eq!(ifca.read_to_end().await, vec![5]);
    }

    #[tokio::test]
    async fn test_read_now() {
        let ifca = engine(4);
        assert_eq!(ifca.read().now(), None);

        ifca.write(3).unwrap();
        ifca.end().unwrap().await;

        assert_eq!(ifca.read().now(), Some(Some(3)));
        assert_eq!(ifca.read().now(), Some(None));
    }

    #[tokio::test]
    async fn test_drain_resolves_below_limit() {
        let ifca = engine(2);

        assert!(ifca.write(1).unwrap().is_none());
        let drain = ifca.write(2).unwrap().expect("limit reached");
        let again = ifca.write(3).unwrap().expect("still above limit");

        let mut drain = task::spawn(drain);
        assert_pending!(drain.poll());

        assert_eq!(ifca.read().await, Some(1));
        assert_pending!(drain.poll());
        assert_eq!(ifca.read().await, Some(2));

        assert_ready!(drain.poll());
        assert!(again.is_resolved());
    }

    #[tokio::test]
    async fn test_mismatched_chunk_is_reported() {
        let ifca = Ifca::<u32>::new(IfcaConfig::new(4))
            .unwrap()
            .map(|x| x.to_string())
            .remove_transform::<String>();
        let faults = Arc::new(AtomicUsize::new(0));
        let counter = faults.clone();
        ifca.on_fault(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ifca.write("kept".to_string()).unwrap();
        ifca.end().unwrap();

        // the chain is empty, so a String comes out where a u32 is expected
        let mistyped: Ifca<String, u32> = ifca.retype();
        assert_eq!(mistyped.read().await, None);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(mistyped.state().failed, 1);
    }
}
