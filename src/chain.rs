//! Transform chain construction.
//!
//! A [`ChainPlan`] is built once per handler-list mutation and shared by every
//! chunk written afterwards. It keeps the handler list both as written and
//! partitioned into runs of consecutive handlers of the same nature, which is
//! what the strict builder executes.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::error::Error;
use crate::transform::{Callable, Chunk, Fault, Outcome, StageResult, SyncFn, TransformHandler};

/// The state of one chunk as it flows through the handler list.
pub(crate) enum Flow {
    Value(Chunk),
    Dropped,
    Failed(Error),
    Aborted,
}

impl Flow {
    fn from_result(result: StageResult<Chunk>) -> Self {
        match result {
            Ok(Outcome::Value(chunk)) => Flow::Value(chunk),
            Ok(Outcome::Dropped) => Flow::Dropped,
            Err(Error::Aborted) => Flow::Aborted,
            Err(error) => Flow::Failed(error),
        }
    }

    /// Dropped and aborted chunks never run another handler
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Flow::Dropped | Flow::Aborted)
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Value(_) => write!(f, "Value(..)"),
            Flow::Dropped => write!(f, "Dropped"),
            Flow::Failed(error) => write!(f, "Failed({})", error),
            Flow::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A handler whose parts are all synchronous, unpacked for the tight loop.
struct SyncHandler {
    transform: Option<SyncFn<Chunk>>,
    on_error: Option<SyncFn<Fault>>,
    handler: TransformHandler,
}

impl SyncHandler {
    fn unpack(handler: &TransformHandler) -> Option<Self> {
        let transform = match &handler.transform {
            None => None,
            Some(Callable::Sync(f)) => Some(Arc::clone(f)),
            Some(Callable::Async(_)) => return None,
        };
        let on_error = match &handler.on_error {
            None => None,
            Some(Callable::Sync(f)) => Some(Arc::clone(f)),
            Some(Callable::Async(_)) => return None,
        };

        Some(Self {
            transform,
            on_error,
            handler: handler.clone(),
        })
    }

    fn apply(&self, flow: Flow) -> Flow {
        match flow {
            Flow::Value(chunk) => match &self.transform {
                None => Flow::Value(chunk),
                Some(transform) => {
                    let input = self.handler.retained(&chunk);
                    match transform(chunk) {
                        Err(error) if !error.is_abort() => match &self.on_error {
                            Some(on_error) => Flow::from_result(on_error(Fault { error, input })),
                            None => Flow::Failed(error),
                        },
                        result => Flow::from_result(result),
                    }
                }
            },
            Flow::Failed(error) => match (&self.transform, &self.on_error) {
                (None, Some(on_error)) => Flow::from_result(on_error(Fault { error, input: None })),
                _ => Flow::Failed(error),
            },
            terminal => terminal,
        }
    }
}

/// A maximal run of consecutive handlers of the same nature.
enum Run {
    Sync(Vec<SyncHandler>),
    Async(Vec<TransformHandler>),
}

/// An immutable snapshot of the handler list, ready to build chains from.
#[derive(Default)]
pub(crate) struct ChainPlan {
    handlers: Vec<TransformHandler>,
    runs: Vec<Run>,
}

impl ChainPlan {
    pub(crate) fn new(handlers: Vec<TransformHandler>) -> Self {
        let mut runs: Vec<Run> = Vec::new();

        for handler in &handlers {
            match SyncHandler::unpack(handler) {
                Some(sync) => match runs.last_mut() {
                    Some(Run::Sync(run)) => run.push(sync),
                    _ => runs.push(Run::Sync(vec![sync])),
                },
                None => match runs.last_mut() {
                    Some(Run::Async(run)) => run.push(handler.clone()),
                    _ => runs.push(Run::Async(vec![handler.clone()])),
                },
            }
        }

        Self { handlers, runs }
    }

    pub(crate) fn handlers(&self) -> &[TransformHandler] {
        &self.handlers
    }

    /// Number of alternating sync/async runs
    #[cfg(test)]
    pub(crate) fn run_count(&self) -> usize {
        self.runs.len()
    }
}

impl fmt::Debug for ChainPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runs: Vec<&str> = self
            .runs
            .iter()
            .map(|run| match run {
                Run::Sync(_) => "sync",
                Run::Async(_) => "async",
            })
            .collect();

        f.debug_struct("ChainPlan")
            .field("handlers", &self.handlers.len())
            .field("runs", &runs)
            .finish()
    }
}

/// A chunk's transform chain: either already settled during `write`, or a
/// future to be driven by the processing task.
pub(crate) enum Chain {
    Settled(Flow),
    Pending(BoxFuture<'static, Flow>),
}

impl Chain {
    pub(crate) async fn resolve(self) -> Flow {
        match self {
            Chain::Settled(flow) => flow,
            Chain::Pending(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(flow) => flow,
                Err(payload) => Flow::Failed(Error::Panicked(panic_message(payload.as_ref()))),
            },
        }
    }
}

/// Build a strict chain.
///
/// Leading synchronous runs execute right away, on the caller's stack. The
/// first asynchronous run starts a continuation in which later synchronous
/// runs execute back to back, without awaiting between stages.
pub(crate) fn strict(plan: Arc<ChainPlan>, chunk: Chunk) -> Chain {
    let mut flow = Flow::Value(chunk);
    let mut next = 0;

    while let Some(Run::Sync(handlers)) = plan.runs.get(next) {
        flow = match panic::catch_unwind(AssertUnwindSafe(|| run_sync(handlers, flow))) {
            Ok(flow) => flow,
            Err(payload) => Flow::Failed(Error::Panicked(panic_message(payload.as_ref()))),
        };
        next += 1;

        if flow.is_terminal() {
            return Chain::Settled(flow);
        }
    }

    if next >= plan.runs.len() {
        return Chain::Settled(flow);
    }

    Chain::Pending(
        async move {
            let mut flow = flow;
            for run in &plan.runs[next..] {
                if flow.is_terminal() {
                    break;
                }
                flow = match run {
                    Run::Sync(handlers) => run_sync(handlers, flow),
                    Run::Async(handlers) => run_async(handlers, flow).await,
                };
            }
            flow
        }
        .boxed(),
    )
}

/// Build a non-strict chain: one continuation awaiting every stage in turn.
/// Nothing runs until the continuation is first polled.
pub(crate) fn lazy(plan: Arc<ChainPlan>, chunk: Chunk) -> Chain {
    Chain::Pending(async move { run_async(&plan.handlers, Flow::Value(chunk)).await }.boxed())
}

fn run_sync(handlers: &[SyncHandler], mut flow: Flow) -> Flow {
    for handler in handlers {
        if flow.is_terminal() {
            break;
        }
        flow = handler.apply(flow);
    }
    flow
}

async fn run_async(handlers: &[TransformHandler], mut flow: Flow) -> Flow {
    for handler in handlers {
        if flow.is_terminal() {
            break;
        }
        flow = apply(handler, flow).await;
    }
    flow
}

async fn apply(handler: &TransformHandler, flow: Flow) -> Flow {
    match flow {
        Flow::Value(chunk) => match &handler.transform {
            None => Flow::Value(chunk),
            Some(transform) => {
                let input = handler.retained(&chunk);
                match invoke(transform, chunk).await {
                    Err(error) if !error.is_abort() => match &handler.on_error {
                        Some(on_error) => {
                            Flow::from_result(invoke(on_error, Fault { error, input }).await)
                        }
                        None => Flow::Failed(error),
                    },
                    result => Flow::from_result(result),
                }
            }
        },
        Flow::Failed(error) => match (&handler.transform, &handler.on_error) {
            (None, Some(on_error)) => {
                Flow::from_result(invoke(on_error, Fault { error, input: None }).await)
            }
            _ => Flow::Failed(error),
        },
        terminal => terminal,
    }
}

async fn invoke<A>(callable: &Callable<A>, arg: A) -> StageResult<Chunk> {
    match callable {
        Callable::Sync(f) => f(arg),
        Callable::Async(f) => f(arg).await,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{ErrorHandler, Transform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn explode(_: i32) -> i32 {
        panic!("transform exploded")
    }

    fn plan(handlers: Vec<TransformHandler>) -> Arc<ChainPlan> {
        Arc::new(ChainPlan::new(handlers))
    }

    fn value_of<T: 'static>(flow: Flow) -> Option<T> {
        match flow {
            Flow::Value(chunk) => chunk.downcast::<T>().ok().map(|boxed| *boxed),
            _ => None,
        }
    }

    #[test]
    fn test_runs_are_partitioned() {
        let plan = plan(vec![
            Transform::map(|x: i32| x + 1).into_handler(),
            Transform::map(|x: i32| x * 2).into_handler(),
            Transform::then(|x: i32| async move { x - 1 }).into_handler(),
            Transform::map(|x: i32| x).into_handler(),
        ]);

        assert_eq!(plan.run_count(), 3);
        assert_eq!(plan.handlers().len(), 4);
    }

    #[test]
    fn test_strict_sync_chain_settles_eagerly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let plan = plan(vec![Transform::map(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            x + 1
        })
        .into_handler()]);

        let chain = strict(plan, Box::new(1_i32));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match chain {
            Chain::Settled(flow) => assert_eq!(value_of::<i32>(flow), Some(2)),
            Chain::Pending(_) => panic!("sync-only chain should settle during build"),
        }
    }

    #[tokio::test]
    async fn test_lazy_chain_runs_on_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let plan = plan(vec![Transform::map(move |x: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
            x + 1
        })
        .into_handler()]);

        let chain = lazy(plan, Box::new(1_i32));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let flow = chain.resolve().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(value_of::<i32>(flow), Some(2));
    }

    #[tokio::test]
    async fn test_strict_matches_lazy_for_mixed_chain() {
        let handlers = vec![
            Transform::map(|x: i32| x + 1).into_handler(),
            Transform::then(|x: i32| async move { x * 10 }).into_handler(),
            Transform::map(|x: i32| x - 3).into_handler(),
            Transform::filter(|x: &i32| x % 2 == 1).into_handler(),
        ];
        let plan = plan(handlers);

        for input in 0..10_i32 {
            let eager = strict(plan.clone(), Box::new(input)).resolve().await;
            let deferred = lazy(plan.clone(), Box::new(input)).resolve().await;

            assert_eq!(value_of::<i32>(eager), value_of::<i32>(deferred));
        }
    }

    #[tokio::test]
    async fn test_dropped_skips_remaining_runs() {
        let later = Arc::new(AtomicUsize::new(0));
        let counter = later.clone();
        let plan = plan(vec![
            Transform::filter(|_: &i32| false).into_handler(),
            Transform::then(move |x: i32| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { x }
            })
            .into_handler(),
        ]);

        let flow = strict(plan.clone(), Box::new(5_i32)).resolve().await;
        assert!(matches!(flow, Flow::Dropped));

        let flow = lazy(plan, Box::new(5_i32)).resolve().await;
        assert!(matches!(flow, Flow::Dropped));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paired_handler_recovers() {
        let plan = plan(vec![Transform::sync(|x: i32| {
            if x % 7 == 0 {
                Err(Error::custom("divisible by seven"))
            } else {
                Ok(Outcome::Value(x))
            }
        })
        .or_else(|_, x| Ok(Outcome::Value(-x)))
        .into_handler()]);

        let flow = strict(plan, Box::new(14_i32)).resolve().await;
        assert_eq!(value_of::<i32>(flow), Some(-14));
    }

    #[tokio::test]
    async fn test_catch_only_handler_recovers_earlier_failure() {
        let plan = plan(vec![
            Transform::then(|_: i32| async { 0 }).into_handler(),
            Transform::sync(|_: i32| Err::<Outcome<i32>, _>(Error::custom("boom"))).into_handler(),
            Transform::map(|x: i32| x + 1000).into_handler(),
            ErrorHandler::sync(|error: Error| {
                assert_eq!(error.to_string(), "boom");
                Ok(Outcome::Value(-1_i32))
            })
            .into_handler(),
        ]);

        for chain in [
            strict(plan.clone(), Box::new(1_i32)),
            lazy(plan.clone(), Box::new(1_i32)),
        ] {
            assert_eq!(value_of::<i32>(chain.resolve().await), Some(-1));
        }
    }

    #[tokio::test]
    async fn test_abort_bypasses_handlers() {
        let handled = Arc::new(AtomicUsize::new(0));
        let paired = handled.clone();
        let caught = handled.clone();
        let plan = plan(vec![
            Transform::asynchronous(|_: i32| async { Err::<Outcome<i32>, _>(Error::abort()) })
                .or_else(move |_, x| {
                    paired.fetch_add(1, Ordering::SeqCst);
                    Ok(Outcome::Value(x))
                })
                .into_handler(),
            ErrorHandler::sync(move |_| {
                caught.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Value(0_i32))
            })
            .into_handler(),
        ]);

        let flow = strict(plan, Box::new(3_i32)).resolve().await;

        assert!(matches!(flow, Flow::Aborted));
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unhandled_failure_and_panic() {
        let failing = plan(vec![Transform::sync(|_: i32| {
            Err::<Outcome<i32>, _>(Error::custom("no handler"))
        })
        .into_handler()]);
        let flow = lazy(failing, Box::new(1_i32)).resolve().await;
        assert!(matches!(flow, Flow::Failed(Error::Custom(_))));

        let panicking = plan(vec![Transform::then(|x: i32| async move { explode(x) }).into_handler()]);
        let flow = strict(panicking, Box::new(1_i32)).resolve().await;
        match flow {
            Flow::Failed(Error::Panicked(message)) => assert_eq!(message, "transform exploded"),
            other => panic!("unexpected flow {:?}", other),
        }
    }
}
