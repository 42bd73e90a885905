//! The processing queue: pending/ready bookkeeping and reader wake-ups.
//!
//! The queue itself does not enforce ordering. Chunks are settled into it in
//! write order because each processing item waits for its predecessor's
//! completion signal (see [`ProcessingQueue::push`]) before settling.
//!
//! Readers never hold a chunk before they consume it. A waiting reader holds
//! a ticket that is woken when a chunk settles, and takes whatever is at the
//! front of the ready list on its next poll. An abandoned reader therefore
//! cannot strand a chunk behind ones read after it.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot;

use crate::signal::{Resolvable, Signal};

/// Called with the number of chunks in the queue (pending + ready) every time
/// that number may have dropped.
pub type WhenEmitted = Box<dyn Fn(usize) + Send + Sync>;

/// Resolves when a waiting reader should look at the queue again
pub type Ticket = oneshot::Receiver<()>;

/// The result of a queue read.
pub enum QueueRead<C> {
    /// A chunk, or `None` once the queue is closed and drained
    Ready(Option<C>),
    /// Nothing to take yet: poll the ticket and read again once it resolves
    Waiting(Ticket),
}

impl<C> fmt::Debug for QueueRead<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRead::Ready(Some(_)) => write!(f, "Ready(Some(..))"),
            QueueRead::Ready(None) => write!(f, "Ready(None)"),
            QueueRead::Waiting(_) => write!(f, "Waiting"),
        }
    }
}

/// Ready chunks, waiting readers and the count of chunks still processing.
pub struct ProcessingQueue<C> {
    /// Settled chunks waiting to be read
    ready: VecDeque<C>,
    /// Tickets of readers waiting for a chunk, oldest first
    requested: VecDeque<oneshot::Sender<()>>,
    /// Number of chunks still being processed
    pending: usize,
    closed: bool,
    /// Completion signal of the most recently pushed chunk
    last: Signal,
    /// Resolved once the queue is closed and nothing is pending
    drained: Option<Resolvable>,
    drained_signal: Signal,
    when_emitted: WhenEmitted,
}

impl<C> ProcessingQueue<C> {
    /// Create a queue reporting length changes to `when_emitted`
    pub fn new(when_emitted: WhenEmitted) -> Self {
        let drained = Resolvable::new();
        let drained_signal = drained.signal();

        Self {
            ready: VecDeque::new(),
            requested: VecDeque::new(),
            pending: 0,
            closed: false,
            last: Signal::resolved(),
            drained: Some(drained),
            drained_signal,
            when_emitted,
        }
    }

    /// Number of chunks both processing and ready
    pub fn len(&self) -> usize {
        self.pending + self.ready.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of reads waiting for a chunk
    pub fn readers(&self) -> usize {
        self.requested.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Number of registered tickets, including ones whose reader went away
    #[cfg(test)]
    pub fn requested_len(&self) -> usize {
        self.requested.len()
    }

    /// Resolves once the queue is closed and every pushed chunk has settled
    pub fn drained(&self) -> Signal {
        self.drained_signal.clone()
    }

    /// Register a chunk that started processing.
    ///
    /// `done` must resolve once the chunk has settled. Returns the completion
    /// signal of the chunk pushed before this one.
    pub fn push(&mut self, done: Signal) -> Signal {
        self.pending += 1;
        std::mem::replace(&mut self.last, done)
    }

    /// Settle a processing chunk, with `None` for chunks producing no output.
    pub fn settle(&mut self, chunk: Option<C>) {
        self.pending = self.pending.saturating_sub(1);

        if let Some(chunk) = chunk {
            self.ready.push_back(chunk);
            self.wake_next();
        }

        (self.when_emitted)(self.len());

        if self.closed {
            self.resolve_awaiting();
        }
    }

    /// Take the next chunk.
    ///
    /// Ready chunks are returned right away. Otherwise, while more chunks may
    /// still arrive, a ticket is registered. Once the queue is closed and
    /// drained every read gets `None`.
    pub fn read(&mut self) -> QueueRead<C> {
        if let Some(chunk) = self.ready.pop_front() {
            (self.when_emitted)(self.len());
            return QueueRead::Ready(Some(chunk));
        }

        match self.request() {
            Some(ticket) => QueueRead::Waiting(ticket),
            None => QueueRead::Ready(None),
        }
    }

    /// Queue up a reader without taking anything.
    ///
    /// Returns `None` when a chunk or the end of the stream is already
    /// available, so the reader can go straight to [`read`](Self::read).
    pub fn request(&mut self) -> Option<Ticket> {
        if !self.ready.is_empty() || self.is_finished() {
            return None;
        }

        // Tickets of dropped readers would otherwise pile up on an idle queue
        self.requested.retain(|tx| !tx.is_closed());

        let (tx, rx) = oneshot::channel();
        self.requested.push_back(tx);
        Some(rx)
    }

    /// Pass a wake-up on to the next reader.
    ///
    /// Called when a woken reader goes away without reading, so a ready
    /// chunk is not left waiting for a reader that will never come.
    pub fn wake_next(&mut self) {
        if self.ready.is_empty() {
            return;
        }

        while let Some(tx) = self.requested.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }

    /// Close the queue; no more chunks will be pushed.
    pub fn close(&mut self) {
        self.closed = true;
        self.resolve_awaiting();
    }

    fn is_finished(&self) -> bool {
        self.closed && self.pending == 0
    }

    fn resolve_awaiting(&mut self) {
        if !self.is_finished() {
            return;
        }

        for tx in self.requested.drain(..) {
            let _ = tx.send(());
        }

        if let Some(drained) = self.drained.take() {
            drained.resolve();
        }
    }
}

impl<C> fmt::Debug for ProcessingQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingQueue")
            .field("pending", &self.pending)
            .field("ready", &self.ready.len())
            .field("requested", &self.requested.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn queue() -> (ProcessingQueue<u32>, Arc<AtomicUsize>) {
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        let queue = ProcessingQueue::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (queue, emitted)
    }

    fn waiting(read: QueueRead<u32>) -> Ticket {
        match read {
            QueueRead::Waiting(ticket) => ticket,
            other => panic!("expected a waiting read, got {:?}", other),
        }
    }

    fn ready(read: QueueRead<u32>) -> Option<u32> {
        match read {
            QueueRead::Ready(chunk) => chunk,
            other => panic!("expected a ready read, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_chunk_is_returned_immediately() {
        let (mut queue, emitted) = queue();
        queue.push(Signal::resolved());
        queue.settle(Some(1));

        assert_eq!(queue.len(), 1);
        assert!(queue.request().is_none());
        assert_eq!(ready(queue.read()), Some(1));
        assert_eq!(queue.len(), 0);
        assert_eq!(emitted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_settled_chunk_wakes_oldest_reader() {
        let (mut queue, _) = queue();
        queue.push(Signal::resolved());
        queue.push(Signal::resolved());
        let first = waiting(queue.read());
        let mut second = waiting(queue.read());

        queue.settle(Some(7));

        first.await.unwrap();
        assert!(second.try_recv().is_err());
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(ready(queue.read()), Some(7));
    }

    #[tokio::test]
    async fn test_dropped_chunk_keeps_reader_waiting() {
        let (mut queue, emitted) = queue();
        queue.push(Signal::resolved());
        queue.push(Signal::resolved());
        let mut ticket = waiting(queue.read());

        queue.settle(None);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        assert!(ticket.try_recv().is_err());

        queue.settle(Some(3));
        ticket.await.unwrap();
        assert_eq!(ready(queue.read()), Some(3));
    }

    #[tokio::test]
    async fn test_close_resolves_readers_after_drain() {
        let (mut queue, _) = queue();
        queue.push(Signal::resolved());
        let first = waiting(queue.read());
        let second = waiting(queue.read());

        queue.close();
        assert!(!queue.drained().is_resolved());

        queue.settle(Some(5));

        first.await.unwrap();
        second.await.unwrap();
        assert!(queue.drained().is_resolved());
        assert_eq!(ready(queue.read()), Some(5));
        // every later read gets its own terminal value
        assert_eq!(ready(queue.read()), None);
        assert_eq!(ready(queue.read()), None);
    }

    #[tokio::test]
    async fn test_abandoned_ticket_is_skipped() {
        let (mut queue, _) = queue();
        queue.push(Signal::resolved());
        drop(waiting(queue.read()));
        let kept = waiting(queue.read());

        queue.settle(Some(9));

        kept.await.unwrap();
        assert_eq!(ready(queue.read()), Some(9));
    }

    #[tokio::test]
    async fn test_wake_passes_to_next_reader() {
        let (mut queue, _) = queue();
        queue.push(Signal::resolved());
        let mut first = waiting(queue.read());
        let second = waiting(queue.read());

        queue.settle(Some(4));
        // the woken reader leaves without reading
        first.close();
        assert!(first.try_recv().is_ok());
        queue.wake_next();

        second.await.unwrap();
        assert_eq!(ready(queue.read()), Some(4));
    }

    #[test]
    fn test_abandoned_tickets_are_pruned() {
        let (mut queue, _) = queue();

        for _ in 0..1000 {
            drop(waiting(queue.read()));
        }

        assert!(queue.requested_len() <= 1);
        assert_eq!(queue.readers(), 0);
    }

    #[test]
    fn test_push_returns_previous_completion() {
        let (mut queue, _) = queue();
        let first = Resolvable::new();
        let first_signal = first.signal();

        let before_first = queue.push(first.signal());
        assert!(before_first.is_resolved());

        let before_second = queue.push(Resolvable::new().signal());
        assert!(!first_signal.is_resolved());
        first.resolve();
        assert!(before_second.is_resolved());
        assert_eq!(queue.pending_len(), 2);
    }
}
