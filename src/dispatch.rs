use log::error;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Queue of work handed over from other threads and run on the thread that
/// owns the node, at the start of its next tick.
pub struct Dispatcher<C> {
    queue: Arc<Mutex<Vec<Task<C>>>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, task: impl FnOnce(&mut C) + Send + 'static) {
        self.queue.lock().push(Box::new(task));
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs every queued task in submission order. A panicking task is
    /// logged and the remaining ones still run. Tasks queued while draining
    /// wait for the next call.
    pub fn drain(&self, context: &mut C) -> usize {
        let tasks = std::mem::take(&mut *self.queue.lock());
        let count = tasks.len();

        for task in tasks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(context))) {
                error!("Dispatched task panicked: {}", panic_message(&*panic));
            }
        }
        count
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
