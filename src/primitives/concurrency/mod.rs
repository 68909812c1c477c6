#![forbid(unsafe_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::types::{HandlerId, Result, StrataError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (pool id, handler id) of the handler thread executing the caller.
    static CURRENT_HANDLER: Cell<Option<(u64, HandlerId)>> = const { Cell::new(None) };
}

/// Outcome of one execution attempt of a page operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageOperationResult {
    /// The operation completed on the executing thread.
    Succeeded,
    /// The operation was handed to another handler or a remote node.
    Shifted,
    /// The operation completed and triggered a page split.
    Splitting,
}

/// Unit of work pinned to the handler that owns its target page.
pub trait PageOperation: Send + 'static {
    /// Runs the operation; `current` is the handler executing it.
    fn run(self: Box<Self>, current: Option<HandlerId>) -> PageOperationResult;
}

/// Result callback of an asynchronous operation.
pub type AsyncHandler<R> = Box<dyn FnOnce(Result<R>) + Send + 'static>;

struct CompletionSlot<R> {
    result: Mutex<Option<Result<R>>>,
    cv: Condvar,
}

impl<R> CompletionSlot<R> {
    fn finish(&self, outcome: Result<R>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }
}

struct Finisher<R> {
    slot: Option<Arc<CompletionSlot<R>>>,
}

impl<R> Finisher<R> {
    fn complete(mut self, outcome: Result<R>) {
        if let Some(slot) = self.slot.take() {
            slot.finish(outcome);
        }
    }
}

impl<R> Drop for Finisher<R> {
    fn drop(&mut self) {
        // An operation dropped without answering (pool shut down) must not
        // leave a waiter blocked forever.
        if let Some(slot) = self.slot.take() {
            slot.finish(Err(StrataError::Shutdown));
        }
    }
}

/// Blocking handle over the result of an asynchronous operation.
///
/// Synchronous map APIs submit their operation with [`Completion::handler`]
/// as the callback and then block in [`Completion::wait`].
pub struct Completion<R> {
    slot: Arc<CompletionSlot<R>>,
}

impl<R: Send + 'static> Completion<R> {
    /// Creates an empty completion.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(CompletionSlot {
                result: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// Callback that fills this completion.
    pub fn handler(&self) -> AsyncHandler<R> {
        let finisher = Finisher {
            slot: Some(self.slot.clone()),
        };
        Box::new(move |outcome| finisher.complete(outcome))
    }

    /// Returns true once the callback has fired.
    pub fn is_done(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Blocks until the callback fires.
    pub fn wait(self) -> Result<R> {
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.slot.cv.wait(&mut guard);
        }
    }

    /// Blocks up to `timeout`; `None` if the callback has not fired yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.result.lock();
        while guard.is_none() {
            if self.slot.cv.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.take()
    }
}

impl<R: Send + 'static> Default for Completion<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arbitrary task that must run on a specific handler thread.
pub struct RunnableOperation {
    pool: Arc<HandlerPool>,
    target: HandlerId,
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl RunnableOperation {
    /// Wraps `task` for execution on `target`.
    pub fn new(
        pool: Arc<HandlerPool>,
        target: HandlerId,
        task: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            pool,
            target,
            task: Box::new(task),
        }
    }
}

impl PageOperation for RunnableOperation {
    fn run(self: Box<Self>, current: Option<HandlerId>) -> PageOperationResult {
        if current != Some(self.target) {
            let pool = self.pool.clone();
            let target = self.target;
            pool.dispatch(target, self);
            return PageOperationResult::Shifted;
        }
        (self.task)();
        PageOperationResult::Succeeded
    }
}

#[derive(Default)]
struct HandlerQueue {
    pending: VecDeque<Box<dyn PageOperation>>,
    running: bool,
    shutdown: bool,
}

struct HandlerShared {
    pool: u64,
    id: HandlerId,
    state: Mutex<HandlerQueue>,
    wakeup: Condvar,
    executed: AtomicU64,
}

/// Single-threaded executor owning a dynamic subset of pages.
///
/// Operations queued on one handler run strictly in submission order.
pub struct PageOperationHandler {
    shared: Arc<HandlerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PageOperationHandler {
    fn spawn(pool: u64, id: HandlerId, name: String) -> Result<Self> {
        let shared = Arc::new(HandlerShared {
            pool,
            id,
            state: Mutex::new(HandlerQueue::default()),
            wakeup: Condvar::new(),
            executed: AtomicU64::new(0),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || Self::worker_loop(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Identifier of this handler.
    pub fn id(&self) -> HandlerId {
        self.shared.id
    }

    /// Operations waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Operations executed so far.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && !state.running
    }

    fn enqueue(&self, op: Box<dyn PageOperation>) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            warn!(handler = %self.shared.id, "poh.enqueue_after_shutdown");
            return;
        }
        state.pending.push_back(op);
        trace!(
            handler = %self.shared.id,
            pending = state.pending.len(),
            "poh.enqueue"
        );
        self.shared.wakeup.notify_one();
    }

    fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.wakeup.notify_all();
    }

    fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(handler = %self.shared.id, "poh.worker_panicked");
        }
    }

    fn worker_loop(shared: Arc<HandlerShared>) {
        CURRENT_HANDLER.with(|current| current.set(Some((shared.pool, shared.id))));
        debug!(handler = %shared.id, "poh.worker_start");
        loop {
            let op = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(op) = state.pending.pop_front() {
                        state.running = true;
                        break op;
                    }
                    if state.shutdown {
                        debug!(handler = %shared.id, "poh.worker_exit");
                        return;
                    }
                    shared.wakeup.wait(&mut state);
                }
            };
            let outcome = op.run(Some(shared.id));
            shared.executed.fetch_add(1, Ordering::Relaxed);
            trace!(handler = %shared.id, ?outcome, "poh.op_done");
            shared.state.lock().running = false;
        }
    }
}

/// Fixed pool of leaf handlers plus one dedicated node-page handler.
pub struct HandlerPool {
    id: u64,
    handlers: Vec<PageOperationHandler>,
    leaf_handlers: usize,
    next: AtomicUsize,
}

impl HandlerPool {
    /// Spawns `leaf_handlers` leaf threads and the node-page thread.
    pub fn new(leaf_handlers: usize) -> Result<Arc<Self>> {
        if leaf_handlers == 0 {
            return Err(StrataError::Invalid("handler pool needs at least one handler"));
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut handlers = Vec::with_capacity(leaf_handlers + 1);
        for i in 0..leaf_handlers {
            handlers.push(PageOperationHandler::spawn(
                id,
                HandlerId(i as u32),
                format!("strata-poh-{i}"),
            )?);
        }
        handlers.push(PageOperationHandler::spawn(
            id,
            HandlerId(leaf_handlers as u32),
            "strata-node-poh".to_string(),
        )?);
        debug!(leaf_handlers, "poh.pool_started");
        Ok(Arc::new(Self {
            id,
            handlers,
            leaf_handlers,
            next: AtomicUsize::new(0),
        }))
    }

    /// Handler of this pool whose thread is executing the caller, or `None`
    /// for threads outside the pool.
    pub fn current(&self) -> Option<HandlerId> {
        CURRENT_HANDLER
            .with(Cell::get)
            .and_then(|(pool, handler)| (pool == self.id).then_some(handler))
    }

    /// Round-robin assignment for newly created leaf pages.
    pub fn next_handler(&self) -> HandlerId {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.leaf_handlers;
        HandlerId(slot as u32)
    }

    /// Handler that serializes all node-page mutations.
    pub fn node_handler(&self) -> HandlerId {
        HandlerId(self.leaf_handlers as u32)
    }

    /// Number of leaf handlers.
    pub fn leaf_handler_count(&self) -> usize {
        self.leaf_handlers
    }

    /// Looks up a handler by id.
    pub fn handler(&self, id: HandlerId) -> Option<&PageOperationHandler> {
        self.handlers.get(id.0 as usize)
    }

    /// Appends `op` to the queue of handler `id`.
    pub fn dispatch(&self, id: HandlerId, op: Box<dyn PageOperation>) {
        match self.handler(id) {
            Some(handler) => handler.enqueue(op),
            None => warn!(handler = %id, "poh.dispatch_unknown_handler"),
        }
    }

    /// Waits until every queue is empty and no handler is running.
    ///
    /// Returns false if the pool did not settle within `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiet_passes = 0;
        while Instant::now() < deadline {
            if self.handlers.iter().all(PageOperationHandler::is_idle) {
                quiet_passes += 1;
                // Operations enqueue follow-ups; require two clean passes.
                if quiet_passes >= 2 {
                    return true;
                }
            } else {
                quiet_passes = 0;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Stops all handler threads after they drain their queues.
    pub fn shutdown(&self) {
        for handler in &self.handlers {
            handler.stop();
        }
        for handler in &self.handlers {
            handler.join();
        }
    }
}

impl Drop for HandlerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
