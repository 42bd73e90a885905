//! Multi-stage pipelines built from several engines.
//!
//! Each stage after the first is fed by a pump task that reads from the
//! previous stage and writes into the next one, honouring its drain signal.
//! Stages never share state; they only meet through their public
//! write/read/end operations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::chain::panic_message;
use crate::config::IfcaConfig;
use crate::error::{Error, Result};
use crate::ifca::{Ifca, Read};
use crate::signal::Signal;

/// The writable side of a pipeline stage
#[async_trait]
pub trait StageSink<S: Send + 'static>: Send + Sync {
    /// Write one chunk, returning a drain signal when the stage is saturated
    fn write(&self, chunk: S) -> Result<Option<Signal>>;

    /// Write several chunks, `None` ending the stage
    fn writev(&self, chunks: Vec<Option<S>>) -> Result<Option<Signal>>;

    /// End the stage
    fn end(&self) -> Result<Signal>;

    /// Write one chunk, `None` ending the stage
    fn write_opt(&self, chunk: Option<S>) -> Result<Option<Signal>> {
        match chunk {
            Some(chunk) => self.write(chunk),
            None => self.end().map(Some),
        }
    }

    /// Write one chunk and wait for capacity before returning
    async fn feed(&self, chunk: S) -> Result<()> {
        if let Some(drain) = self.write(chunk)? {
            drain.await;
        }
        Ok(())
    }
}

/// The readable side of a pipeline stage
pub trait StageSource<T: Send + 'static>: Send + Sync {
    fn read(&self) -> Read<T>;

    fn when_ended(&self) -> Signal;
}

impl<S, T> StageSink<S> for Ifca<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn write(&self, chunk: S) -> Result<Option<Signal>> {
        Ifca::write(self, chunk)
    }

    fn writev(&self, chunks: Vec<Option<S>>) -> Result<Option<Signal>> {
        Ifca::writev(self, chunks)
    }

    fn end(&self) -> Result<Signal> {
        Ifca::end(self)
    }
}

impl<S, T> StageSource<T> for Ifca<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn read(&self) -> Read<T> {
        Ifca::read(self)
    }

    fn when_ended(&self) -> Signal {
        Ifca::when_ended(self)
    }
}

/// A sequence of engines where each stage's output feeds the next stage.
///
/// Writes go to the first stage and reads come from the last one.
pub struct IfcaChain<S, T> {
    first: Arc<dyn StageSink<S>>,
    last: Arc<dyn StageSource<T>>,
    /// Identity of the last stage, for [`add_shared`](IfcaChain::add_shared)
    last_id: usize,
    stages: usize,
    pumps: Vec<JoinHandle<Result<()>>>,
}

impl<S, T> IfcaChain<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    /// Start a chain with a single stage
    pub fn new(first: Ifca<S, T>) -> Self {
        Self::from_shared(Arc::new(first))
    }

    /// Start a chain with a stage that is also used elsewhere
    pub fn from_shared(first: Arc<Ifca<S, T>>) -> Self {
        Self {
            last_id: stage_id(&first),
            first: first.clone(),
            last: first,
            stages: 1,
            pumps: Vec::new(),
        }
    }

    /// Append a stage fed from the current last stage
    pub fn add<U>(self, next: Ifca<T, U>) -> Result<IfcaChain<S, U>>
    where
        U: Send + 'static,
    {
        self.attach(Arc::new(next))
    }

    /// Append a new stage with no transforms
    pub fn create(self, config: IfcaConfig) -> Result<IfcaChain<S, T>> {
        self.add(Ifca::new(config)?)
    }

    /// Append a shared stage.
    ///
    /// Adding the stage that is already last is a no-op.
    pub fn add_shared(self, next: Arc<Ifca<T, T>>) -> Result<IfcaChain<S, T>> {
        if stage_id(&next) == self.last_id {
            return Ok(self);
        }
        self.attach(next)
    }

    fn attach<U>(mut self, next: Arc<Ifca<T, U>>) -> Result<IfcaChain<S, U>>
    where
        U: Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        ifca_debug!(
            stage = %next.config().name,
            position = self.stages,
            "stage added to chain"
        );
        self.pumps
            .push(runtime.spawn(pump(Arc::clone(&self.last), Arc::clone(&next))));

        Ok(IfcaChain {
            first: self.first,
            last_id: stage_id(&next),
            last: next,
            stages: self.stages + 1,
            pumps: self.pumps,
        })
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages == 0
    }

    /// Write to the first stage
    pub fn write(&self, chunk: S) -> Result<Option<Signal>> {
        self.first.write(chunk)
    }

    /// Write to the first stage, `None` ending the chain
    pub fn write_opt(&self, chunk: Option<S>) -> Result<Option<Signal>> {
        self.first.write_opt(chunk)
    }

    /// Write several chunks to the first stage
    pub fn writev<I>(&self, chunks: I) -> Result<Option<Signal>>
    where
        I: IntoIterator<Item = Option<S>>,
    {
        self.first.writev(chunks.into_iter().collect())
    }

    /// Write to the first stage and wait for capacity
    pub async fn feed(&self, chunk: S) -> Result<()> {
        self.first.feed(chunk).await
    }

    /// End the first stage; the end propagates down the chain
    pub fn end(&self) -> Result<Signal> {
        self.first.end()
    }

    /// Read from the last stage
    pub fn read(&self) -> Read<T> {
        self.last.read()
    }

    /// Read every remaining chunk from the last stage
    pub async fn read_to_end(&self) -> Vec<T> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read().await {
            chunks.push(chunk);
        }
        chunks
    }

    /// Resolves once the last stage has ended and drained
    pub fn when_ended(&self) -> Signal {
        self.last.when_ended()
    }

    /// Wait for every pump task, returning the first error
    pub async fn join(&mut self) -> Result<()> {
        let mut first_error = None;

        for pump in self.pumps.drain(..) {
            let result = match pump.await {
                Ok(result) => result,
                Err(error) if error.is_panic() => {
                    Err(Error::Panicked(panic_message(error.into_panic().as_ref())))
                }
                Err(_) => Err(Error::ChannelClosed),
            };

            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<S, T> fmt::Debug for IfcaChain<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfcaChain")
            .field("stages", &self.stages)
            .field("pumps", &self.pumps.len())
            .finish()
    }
}

fn stage_id<S, T>(stage: &Arc<Ifca<S, T>>) -> usize {
    Arc::as_ptr(stage) as *const () as usize
}

/// Move chunks from one stage into the next until the first one ends.
///
/// If the next stage stops accepting chunks, the rest of the upstream is
/// read and discarded so its writers are not left waiting on a drain.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables, unused_assignments))]
async fn pump<T, U>(from: Arc<dyn StageSource<T>>, into: Arc<Ifca<T, U>>) -> Result<()>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let mut moved = 0_u64;

    while let Some(chunk) = from.read().await {
        if let Err(error) = into.feed(chunk).await {
            ifca_warn!(
                stage = %into.config().name,
                error = %error,
                "stage refused a chunk, discarding the rest of the upstream"
            );
            let mut discarded = 1_u64;
            while from.read().await.is_some() {
                discarded += 1;
            }
            ifca_debug!(stage = %into.config().name, discarded, "upstream ended");
            return Err(error);
        }
        moved += 1;
    }

    ifca_trace!(stage = %into.config().name, moved, "upstream ended");
    into.end()?;
    Ok(())
}
