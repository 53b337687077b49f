//! Live Views - Per-Subscriber Filtered Streams
//!
//! A view reads one merged broadcast stream, keeps the items its filter
//! accepts and parks them in a single-slot `watch` channel. A newer
//! accepted item overwrites an unconsumed older one, so a slow consumer
//! always reads the freshest state and never holds the producer back.
//!
//! Every call builds a new view with its own pump task; nothing is
//! shared between views except the upstream broadcast channel.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ports::market_feed::FeedItem;

/// Filtered, latest-wins view over a merged stream.
///
/// The pump task runs on the runtime passed in, so views can be built
/// from any thread. Dropping the view stops its pump task.
pub struct LiveView<T> {
  /// Single pending item, overwritten by newer ones.
  slot: watch::Receiver<Option<FeedItem<T>>>,
  /// Task moving accepted items from upstream into `slot`.
  pump: JoinHandle<()>,
  /// Runtime the pump runs on; callback tasks go there too.
  runtime: Handle,
}

impl<T> LiveView<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Spawn a view that maps/filters each upstream item through `select`.
  ///
  /// `select` returning `None` drops the item.
  pub fn spawn<U, F>(
    runtime: &Handle,
    mut upstream: broadcast::Receiver<FeedItem<U>>,
    mut select: F,
  ) -> Self
  where
    U: Clone + Send + 'static,
    F: FnMut(FeedItem<U>) -> Option<FeedItem<T>> + Send + 'static,
  {
    let (tx, slot) = watch::channel(None);

    let pump = runtime.spawn(async move {
      loop {
        tokio::select! {
          biased;
          () = tx.closed() => {
            trace!("View consumer dropped");
            break;
          }
          item = upstream.recv() => {
            match item {
              Ok(item) => {
                if let Some(out) = select(item) {
                  tx.send_replace(Some(out));
                }
              }
              Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "View lagged behind merged stream");
              }
              Err(broadcast::error::RecvError::Closed) => {
                debug!("Merged stream closed, ending view");
                break;
              }
            }
          }
        }
      }
    });

    Self {
      slot,
      pump,
      runtime: runtime.clone(),
    }
  }

  /// Spawn a view that passes through items `accept` returns true for.
  pub fn filtered<F>(runtime: &Handle, upstream: broadcast::Receiver<FeedItem<T>>, accept: F) -> Self
  where
    F: Fn(&FeedItem<T>) -> bool + Send + 'static,
  {
    Self::spawn(runtime, upstream, move |item| accept(&item).then_some(item))
  }

  /// Wait for the next item.
  ///
  /// Returns the newest item produced since the previous call; older
  /// unconsumed ones are gone. `None` once the upstream has closed and
  /// the last item was read.
  pub async fn next(&mut self) -> Option<FeedItem<T>> {
    self.slot.changed().await.ok()?;
    self.slot.borrow_and_update().clone()
  }

  /// Adapt into a `Stream`.
  pub fn into_stream(self) -> impl Stream<Item = FeedItem<T>> + Send {
    futures_util::stream::unfold(self, |mut view| async move {
      view.next().await.map(|item| (item, view))
    })
  }

  /// Invoke `callback` for every item until the handle is released.
  pub fn attach<F>(self, callback: F) -> ViewHandle
  where
    F: Fn(FeedItem<T>) + Send + Sync + 'static,
  {
    ViewHandle::attach(self, callback)
  }
}

impl<T> Drop for LiveView<T> {
  fn drop(&mut self) {
    self.pump.abort();
  }
}

/// Callback subscription over a `LiveView`.
///
/// `release` is idempotent and waits for an in-flight callback to finish,
/// so no callback runs once it returns. A callback may release its own
/// handle.
#[derive(Debug)]
pub struct ViewHandle {
  gate: Arc<Gate>,
  task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Gate {
  released: AtomicBool,
  /// Held for the duration of each callback.
  running: Mutex<()>,
}

thread_local! {
  /// Gate whose callback is executing on this thread, if any.
  static CURRENT_GATE: Cell<usize> = const { Cell::new(0) };
}

/// Clears `CURRENT_GATE` even if the callback panics.
struct CurrentGate;

impl CurrentGate {
  fn enter(gate: &Arc<Gate>) -> Self {
    CURRENT_GATE.with(|c| c.set(Arc::as_ptr(gate) as usize));
    Self
  }
}

impl Drop for CurrentGate {
  fn drop(&mut self) {
    CURRENT_GATE.with(|c| c.set(0));
  }
}

impl ViewHandle {
  fn attach<T, F>(mut view: LiveView<T>, callback: F) -> Self
  where
    T: Clone + Send + Sync + 'static,
    F: Fn(FeedItem<T>) + Send + Sync + 'static,
  {
    let gate = Arc::new(Gate::default());
    let task_gate = Arc::clone(&gate);

    let runtime = view.runtime.clone();
    let task = runtime.spawn(async move {
      while let Some(item) = view.next().await {
        let _running = task_gate.running.lock().unwrap_or_else(PoisonError::into_inner);
        if task_gate.released.load(Ordering::Acquire) {
          break;
        }
        let _current = CurrentGate::enter(&task_gate);
        callback(item);
      }
    });

    Self { gate, task }
  }

  /// Stop delivering to the callback.
  pub fn release(&self) {
    self.gate.released.store(true, Ordering::Release);
    let own = CURRENT_GATE.with(Cell::get) == Arc::as_ptr(&self.gate) as usize;
    if !own {
      drop(self.gate.running.lock().unwrap_or_else(PoisonError::into_inner));
    }
    self.task.abort();
  }

  /// Whether the handle was released or its view ended.
  pub fn is_released(&self) -> bool {
    self.gate.released.load(Ordering::Acquire) || self.task.is_finished()
  }
}

impl Drop for ViewHandle {
  fn drop(&mut self) {
    self.release();
  }
}
