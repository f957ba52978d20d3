//! Per-connection delivery queue.
//!
//! Received payloads are pushed into a FIFO. A single consumer task pops them
//! and hands them to the installed handler. All state (queue, handler, mode,
//! closed flag) sits behind one mutex, so installing or clearing a handler
//! and switching modes are atomic with respect to the consumer.

use crate::transport::connection::{Connection, WeakConnection};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// How queued messages are handed to the installed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The handler returns before the next message is dispatched
    #[default]
    Ordered,
    /// Each message is dispatched on its own task as soon as it is dequeued
    Unordered,
}

/// Consumer of a connection's incoming messages.
///
/// Handlers run on the connection's consumer task. In ordered mode a slow
/// handler holds back every later message on that connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Bytes, connection: &Connection);

    /// Called once if this handler is installed when the connection stops,
    /// after every message received before the stop has been handled.
    fn on_closed(&self, connection: &Connection) {
        let _ = connection;
    }
}

impl<F> MessageHandler for F
where
    F: Fn(Bytes, &Connection) + Send + Sync + 'static,
{
    fn handle(&self, message: Bytes, connection: &Connection) {
        self(message, connection)
    }
}

struct DeliveryState {
    queue: VecDeque<Bytes>,
    handler: Option<Arc<dyn MessageHandler>>,
    mode: DeliveryMode,
    closed: bool,
    stopped: bool,
}

pub(crate) struct DeliveryQueue {
    state: Mutex<DeliveryState>,
    notify: Notify,
}

enum Next {
    Deliver(Arc<dyn MessageHandler>, Bytes, DeliveryMode),
    Wait,
    Closed(Arc<dyn MessageHandler>),
    Stop,
}

impl DeliveryQueue {
    pub(crate) fn new(mode: DeliveryMode) -> Self {
        Self {
            state: Mutex::new(DeliveryState {
                queue: VecDeque::new(),
                handler: None,
                mode,
                closed: false,
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    // A poisoned lock only means a handler panicked elsewhere; the queue
    // itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, message: Bytes) {
        self.lock().queue.push_back(message);
        self.notify.notify_one();
    }

    pub(crate) fn set_handler(
        &self,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let mut state = self.lock();
        if state.stopped {
            // Nothing will ever run it
            return None;
        }
        let previous = std::mem::replace(&mut state.handler, handler);
        drop(state);
        self.notify.notify_one();
        previous
    }

    /// Install `handler` unless the consumer has already stopped, in which
    /// case it would never be called.
    pub(crate) fn install(&self, handler: Arc<dyn MessageHandler>) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }
        state.handler = Some(handler);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub(crate) fn set_mode(&self, mode: DeliveryMode) {
        self.lock().mode = mode;
    }

    pub(crate) fn mode(&self) -> DeliveryMode {
        self.lock().mode
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn next(&self) -> Next {
        let mut state = self.lock();
        if let Some(handler) = state.handler.clone() {
            if let Some(message) = state.queue.pop_front() {
                return Next::Deliver(handler, message, state.mode);
            }
        }
        if state.closed {
            state.stopped = true;
            // Taking the handler also releases closures that capture the
            // connection.
            match state.handler.take() {
                Some(handler) => Next::Closed(handler),
                None => Next::Stop,
            }
        } else {
            Next::Wait
        }
    }
}

/// Drives a connection's delivery queue until it is closed and drained.
///
/// Messages still queued when the connection closes are delivered if a
/// handler is installed; otherwise they stay queued and are dropped with
/// the connection. The task holds only a weak handle between messages, so
/// it never keeps an abandoned connection alive.
pub(crate) async fn run_consumer(connection: WeakConnection, queue: Arc<DeliveryQueue>) {
    loop {
        match queue.next() {
            Next::Deliver(handler, message, mode) => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                match mode {
                    DeliveryMode::Ordered => handler.handle(message, &connection),
                    DeliveryMode::Unordered => {
                        tokio::spawn(async move {
                            handler.handle(message, &connection);
                        });
                    }
                }
            }
            Next::Wait => queue.notify.notified().await,
            Next::Closed(handler) => {
                if let Some(connection) = connection.upgrade() {
                    handler.on_closed(&connection);
                }
                break;
            }
            Next::Stop => break,
        }
    }
    trace!("Delivery consumer stopped");
}
