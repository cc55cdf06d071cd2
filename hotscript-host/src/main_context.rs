//! Designated main execution context
//!
//! Registry mutation, state transitions and event dispatch all happen on one
//! thread: the one that built the host. Background threads never touch that
//! state directly. They submit closures through a [`MainContextHandle`] and the
//! host runs them from [`MainContext::pump`], in submission order.

use crate::error::HostError;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable submission side of the main context
#[derive(Clone)]
pub struct MainContextHandle {
    tx: mpsc::UnboundedSender<Task>,
    thread: ThreadId,
}

/// Receiving side, owned by the host on the main thread
pub struct MainContext {
    handle: MainContextHandle,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
}

impl MainContext {
    /// Bind the main context to the calling thread
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: MainContextHandle {
                tx,
                thread: thread::current().id(),
            },
            rx: Mutex::new(rx),
        }
    }

    pub fn handle(&self) -> MainContextHandle {
        self.handle.clone()
    }

    /// Run every task submitted so far. Returns the number of tasks run.
    ///
    /// Must be called from the main thread; calls from elsewhere are logged
    /// and ignored.
    pub fn pump(&self) -> usize {
        if !self.handle.assert_current("pump") {
            return 0;
        }

        let mut ran = 0;
        loop {
            // Release the receiver before running: tasks may submit more work.
            let task = {
                let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
                match rx.try_recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!(
                    reason = %panic_message(payload.as_ref()),
                    "Main context task panicked"
                );
            }
            ran += 1;
        }
        ran
    }

    /// Refuse further submissions. Already queued tasks stay pumpable.
    pub fn close(&self) {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContextHandle {
    /// Whether the caller is running on the main thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Log an ordering violation with a backtrace when called off the main
    /// thread. Never panics; returns whether the check passed.
    pub fn assert_current(&self, operation: &str) -> bool {
        if self.is_current() {
            return true;
        }
        let backtrace = Backtrace::force_capture();
        tracing::error!(
            operation,
            thread = ?thread::current().name(),
            "Operation must run on the main context\n{backtrace}"
        );
        false
    }

    /// Run `f` on the main context and wait for its result
    ///
    /// Runs inline when already on the main thread. Handoffs are applied one
    /// at a time in submission order.
    pub async fn run<F, R>(&self, f: F) -> Result<R, HostError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move || {
            let _ = reply_tx.send(f());
        })?;
        reply_rx.await.map_err(|_| HostError::MainContextClosed)
    }

    /// Submit `f` without waiting for it
    pub fn post<F>(&self, f: F) -> Result<(), HostError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .map_err(|_| HostError::MainContextClosed)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
