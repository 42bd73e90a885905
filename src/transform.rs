//! Transforms, error handlers and the per-engine handler list.
//!
//! Every transform is registered with an explicit synchronous or asynchronous
//! capability, so the chain builder can batch synchronous stages without
//! inspecting functions at runtime. Internally the list is type-erased: each
//! chunk travels between stages as a boxed [`Any`], and the typed wrappers
//! created here restore the concrete types at every stage boundary.

use std::any::{self, Any};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::chain::ChainPlan;
use crate::error::{Error, Result};

/// A type-erased chunk travelling between stages.
pub(crate) type Chunk = Box<dyn Any + Send>;

/// The result of running one stage on one chunk.
pub type StageResult<T> = Result<Outcome<T>>;

/// What a stage produced for a chunk.
///
/// `Dropped` removes the chunk from the stream: no later stage sees it and no
/// reader slot is taken. It is distinct from every payload value, including
/// `None` or `()` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome<T> {
    /// The chunk continues downstream with this value
    Value(T),
    /// The chunk was filtered out
    Dropped,
}

impl<T> Outcome<T> {
    /// Map the carried value, keeping `Dropped` as is
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Value(value) => Outcome::Value(f(value)),
            Outcome::Dropped => Outcome::Dropped,
        }
    }

    /// Whether the chunk was dropped
    pub fn is_dropped(&self) -> bool {
        matches!(self, Outcome::Dropped)
    }

    /// Convert into an `Option`, mapping `Dropped` to `None`
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Dropped => None,
        }
    }
}

impl<T> From<T> for Outcome<T> {
    fn from(value: T) -> Self {
        Outcome::Value(value)
    }
}

/// An erased stage input handed to error handlers.
pub(crate) struct Fault {
    pub(crate) error: Error,
    /// The input of the failed transform; `None` for catch-only handlers.
    pub(crate) input: Option<Chunk>,
}

pub(crate) type SyncFn<A> = Arc<dyn Fn(A) -> StageResult<Chunk> + Send + Sync>;
pub(crate) type AsyncFn<A> = Arc<dyn Fn(A) -> BoxFuture<'static, StageResult<Chunk>> + Send + Sync>;
type RetainFn = Arc<dyn Fn(&Chunk) -> Option<Chunk> + Send + Sync>;

/// A type-erased function with a statically known calling convention.
pub(crate) enum Callable<A> {
    Sync(SyncFn<A>),
    Async(AsyncFn<A>),
}

impl<A> Callable<A> {
    pub(crate) fn is_async(&self) -> bool {
        matches!(self, Callable::Async(_))
    }
}

impl<A> Clone for Callable<A> {
    fn clone(&self) -> Self {
        match self {
            Callable::Sync(f) => Callable::Sync(Arc::clone(f)),
            Callable::Async(f) => Callable::Async(Arc::clone(f)),
        }
    }
}

/// One entry of the handler list: a transform, its paired error handler, or
/// both. An entry with only an error handler catches failures of earlier
/// stages at its position.
#[derive(Clone)]
pub(crate) struct TransformHandler {
    pub(crate) transform: Option<Callable<Chunk>>,
    pub(crate) on_error: Option<Callable<Fault>>,
    /// Copies the transform input so a paired handler can receive it.
    retain: Option<RetainFn>,
}

impl TransformHandler {
    /// Whether any part of this entry has to be awaited
    pub(crate) fn is_async(&self) -> bool {
        self.transform.as_ref().is_some_and(Callable::is_async)
            || self.on_error.as_ref().is_some_and(Callable::is_async)
    }

    #[cfg(test)]
    pub(crate) fn is_catch(&self) -> bool {
        self.transform.is_none()
    }

    pub(crate) fn retained(&self, chunk: &Chunk) -> Option<Chunk> {
        self.retain.as_ref().and_then(|retain| retain(chunk))
    }
}

impl fmt::Debug for TransformHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformHandler")
            .field("transform", &self.transform.as_ref().map(Callable::is_async))
            .field("on_error", &self.on_error.as_ref().map(Callable::is_async))
            .finish()
    }
}

fn downcast<T: 'static>(chunk: Chunk) -> Result<T> {
    chunk
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| Error::ChunkType {
            expected: any::type_name::<T>(),
        })
}

fn erase<U: Send + 'static>(result: StageResult<U>) -> StageResult<Chunk> {
    result.map(|outcome| outcome.map(|value| Box::new(value) as Chunk))
}

fn erase_sync<A, T, U, F>(unpack: fn(A) -> Result<T>, f: F) -> SyncFn<A>
where
    A: 'static,
    T: 'static,
    U: Send + 'static,
    F: Fn(T) -> StageResult<U> + Send + Sync + 'static,
{
    Arc::new(move |input: A| erase(f(unpack(input)?)))
}

fn erase_async<A, T, U, F, Fut>(unpack: fn(A) -> Result<T>, f: F) -> AsyncFn<A>
where
    A: 'static,
    T: 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult<U>> + Send + 'static,
{
    Arc::new(move |input: A| match unpack(input) {
        Ok(input) => f(input).map(erase::<U>).boxed(),
        Err(error) => future::ready(Err(error)).boxed(),
    })
}

/// A typed transform from `T` to `U`, optionally paired with an error handler.
///
/// ```rust
/// use ifca::prelude::*;
///
/// let parse = Transform::sync(|line: String| {
///     line.trim().parse::<u32>().map(Outcome::Value).map_err(Error::transform)
/// })
/// .or_else(|_err, _line| Ok(Outcome::Dropped));
///
/// assert!(!parse.is_async());
/// ```
pub struct Transform<T, U> {
    handler: TransformHandler,
    _types: PhantomData<fn(T) -> U>,
}

impl<T, U> Transform<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// A synchronous transform that may drop its chunk or fail
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(T) -> StageResult<U> + Send + Sync + 'static,
    {
        Self::from_callable(Callable::Sync(erase_sync(downcast::<T>, f)))
    }

    /// An asynchronous transform that may drop its chunk or fail
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult<U>> + Send + 'static,
    {
        Self::from_callable(Callable::Async(erase_async(downcast::<T>, f)))
    }

    /// An infallible synchronous mapping
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Self::sync(move |value| Ok(Outcome::Value(f(value))))
    }

    /// An infallible asynchronous mapping
    pub fn then<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        Self::asynchronous(move |value| f(value).map(|value| Ok::<_, Error>(Outcome::Value(value))))
    }

    fn from_callable(transform: Callable<Chunk>) -> Self {
        Self {
            handler: TransformHandler {
                transform: Some(transform),
                on_error: None,
                retain: None,
            },
            _types: PhantomData,
        }
    }

    /// Whether this transform (or its error handler) has to be awaited
    pub fn is_async(&self) -> bool {
        self.handler.is_async()
    }

    pub(crate) fn into_handler(self) -> TransformHandler {
        self.handler
    }
}

impl<T, U> Transform<T, U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
{
    /// Pair a synchronous error handler with this transform.
    ///
    /// The handler receives the error and the chunk the transform was given.
    /// Its result replaces the transform's result: a value continues down the
    /// chain, `Dropped` filters the chunk out, and an error propagates to the
    /// next catch-only handler (if any).
    pub fn or_else<H>(mut self, handler: H) -> Self
    where
        H: Fn(Error, T) -> StageResult<U> + Send + Sync + 'static,
    {
        self.handler.on_error = Some(Callable::Sync(erase_sync(
            unpack_fault::<T>,
            move |(error, input)| handler(error, input),
        )));
        self.handler.retain = Some(retain::<T>());
        self
    }

    /// Pair an asynchronous error handler with this transform
    pub fn or_else_async<H, Fut>(mut self, handler: H) -> Self
    where
        H: Fn(Error, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult<U>> + Send + 'static,
    {
        self.handler.on_error = Some(Callable::Async(erase_async(
            unpack_fault::<T>,
            move |(error, input)| handler(error, input),
        )));
        self.handler.retain = Some(retain::<T>());
        self
    }
}

impl<T> Transform<T, T>
where
    T: Send + 'static,
{
    /// Keep only chunks matching the predicate
    pub fn filter<P>(predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::sync(move |value| {
            Ok(if predicate(&value) {
                Outcome::Value(value)
            } else {
                Outcome::Dropped
            })
        })
    }

    /// Keep only chunks for which the asynchronous predicate resolves to `true`
    pub fn filter_async<P, Fut>(predicate: P) -> Self
    where
        P: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::asynchronous(move |value| {
            let keep = predicate(&value);
            async move {
                Ok::<_, Error>(if keep.await {
                    Outcome::Value(value)
                } else {
                    Outcome::Dropped
                })
            }
        })
    }
}

impl<T, U> fmt::Debug for Transform<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("input", &any::type_name::<T>())
            .field("output", &any::type_name::<U>())
            .field("handler", &self.handler)
            .finish()
    }
}

fn unpack_fault<T: 'static>(fault: Fault) -> Result<(Error, T)> {
    match fault.input {
        Some(input) => Ok((fault.error, downcast::<T>(input)?)),
        None => Err(fault.error),
    }
}

fn unpack_error(fault: Fault) -> Result<Error> {
    Ok(fault.error)
}

fn retain<T: Clone + Send + 'static>() -> RetainFn {
    Arc::new(|chunk: &Chunk| {
        chunk
            .downcast_ref::<T>()
            .map(|value| Box::new(value.clone()) as Chunk)
    })
}

/// A catch-only stage recovering failures of earlier stages.
///
/// Failures propagate down the chain, skipping transforms, until they reach
/// an error handler. The handler turns the error into a value of the chain's
/// current type, drops the chunk, or fails again.
pub struct ErrorHandler<T> {
    handler: Callable<Fault>,
    _types: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> ErrorHandler<T> {
    /// A synchronous catch-only handler
    pub fn sync<H>(handler: H) -> Self
    where
        H: Fn(Error) -> StageResult<T> + Send + Sync + 'static,
    {
        Self {
            handler: Callable::Sync(erase_sync(unpack_error, handler)),
            _types: PhantomData,
        }
    }

    /// An asynchronous catch-only handler
    pub fn asynchronous<H, Fut>(handler: H) -> Self
    where
        H: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult<T>> + Send + 'static,
    {
        Self {
            handler: Callable::Async(erase_async(unpack_error, handler)),
            _types: PhantomData,
        }
    }

    pub(crate) fn into_handler(self) -> TransformHandler {
        TransformHandler {
            transform: None,
            on_error: Some(self.handler),
            retain: None,
        }
    }
}

impl<T> fmt::Debug for ErrorHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("output", &any::type_name::<T>())
            .field("async", &self.handler.is_async())
            .finish()
    }
}

/// The ordered handler list owned by an engine.
///
/// The list is copy-on-write: every mutation builds a fresh [`ChainPlan`], and
/// each write takes a cheap snapshot of the current one.
#[derive(Clone, Debug, Default)]
pub(crate) struct TransformHandlers {
    plan: Arc<ChainPlan>,
}

impl TransformHandlers {
    /// Append an entry at the end of the chain
    pub(crate) fn push(&mut self, handler: TransformHandler) {
        let mut handlers = self.plan.handlers().to_vec();
        handlers.push(handler);
        self.plan = Arc::new(ChainPlan::new(handlers));
    }

    /// Remove the oldest entry
    pub(crate) fn shift(&mut self) -> Option<TransformHandler> {
        if self.plan.handlers().is_empty() {
            return None;
        }
        let mut handlers = self.plan.handlers().to_vec();
        let removed = handlers.remove(0);
        self.plan = Arc::new(ChainPlan::new(handlers));
        Some(removed)
    }

    pub(crate) fn len(&self) -> usize {
        self.plan.handlers().len()
    }

    pub(crate) fn snapshot(&self) -> Arc<ChainPlan> {
        Arc::clone(&self.plan)
    }
}
