// channel.rs
//! Rendezvous channel: a zero-capacity handoff between producers and consumers.
//!
//! A value passed to [`Sender::send`] is never buffered. It either goes straight
//! to the oldest waiting [`Receiver::recv`], or the sender parks until a
//! receiver arrives. Both sides are FIFO, so the Nth send is matched with the
//! Nth receive. Senders and receivers can be cloned freely.
//!
//! Dropping a suspended `send` or `recv` future removes its pending entry, so
//! abandoned callers never absorb a value meant for someone else.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Returned by [`Sender::send`] when every receiver has been dropped.
///
/// Carries the undelivered value back to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed: no receivers remain")]
pub struct SendError<T>(pub T);

/// Creates a bound sender/receiver pair over one shared rendezvous slot.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        slots: Mutex::new(Slots {
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            next_id: 0,
            senders: 1,
            receivers: 1,
        }),
    });

    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

struct Shared<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // Slot bookkeeping never panics mid-update, so a poisoned lock is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingReader<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

struct PendingWriter<T> {
    id: u64,
    value: T,
    done: Option<oneshot::Sender<Result<(), T>>>,
}

struct Slots<T> {
    readers: VecDeque<PendingReader<T>>,
    writers: VecDeque<PendingWriter<T>>,
    next_id: u64,
    senders: usize,
    receivers: usize,
}

impl<T> Slots<T> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Hands `value` to the oldest live reader, skipping readers that already went away.
    fn offer(&mut self, mut value: T) -> Result<(), T> {
        while let Some(reader) = self.readers.pop_front() {
            match reader.tx.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        Err(value)
    }

    fn take_writer(&mut self) -> Option<T> {
        let mut writer = self.writers.pop_front()?;
        if let Some(done) = writer.done.take() {
            let _ = done.send(Ok(()));
        }
        Some(writer.value)
    }
}

/// Producer half of a rendezvous channel.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Hands `value` to a receiver, waiting until one takes it.
    ///
    /// Resolves once the handoff is recorded. Fails only if every [`Receiver`]
    /// is gone, either before the call or while this send was parked.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        let (id, done_rx) = {
            let mut slots = self.shared.lock();
            if slots.receivers == 0 {
                return Err(SendError(value));
            }

            let value = match slots.offer(value) {
                Ok(()) => return Ok(()),
                Err(value) => value,
            };

            let id = slots.next_id();
            let (done_tx, done_rx) = oneshot::channel();
            slots.writers.push_back(PendingWriter {
                id,
                value,
                done: Some(done_tx),
            });
            (id, done_rx)
        };

        let mut guard = PendingWriterGuard {
            shared: &self.shared,
            id,
            armed: true,
        };
        let outcome = done_rx.await;
        guard.armed = false;

        match outcome {
            Ok(result) => result.map_err(SendError),
            // A parked writer leaves the queue only through a match or a close, and both report back.
            Err(_) => Ok(()),
        }
    }

    /// Number of receivers currently parked waiting for a value.
    pub fn pending_receivers(&self) -> usize {
        self.shared.lock().readers.len()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut slots = self.shared.lock();
        slots.senders -= 1;
        if slots.senders == 0 {
            // Wakes every parked receiver with a closed channel.
            slots.readers.clear();
        }
    }
}

/// Consumer half of a rendezvous channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Takes the next value, waiting for a sender if none is parked.
    ///
    /// Returns `None` once every [`Sender`] is dropped and no parked sender remains.
    pub async fn recv(&self) -> Option<T> {
        let (id, rx) = {
            let mut slots = self.shared.lock();
            if let Some(value) = slots.take_writer() {
                return Some(value);
            }
            if slots.senders == 0 {
                return None;
            }

            let id = slots.next_id();
            let (tx, rx) = oneshot::channel();
            slots.readers.push_back(PendingReader { id, tx });
            (id, rx)
        };

        let mut guard = PendingReaderGuard {
            shared: &self.shared,
            id,
            rx: Some(rx),
        };
        let rx = guard.rx.as_mut()?;
        let value = rx.await.ok();
        guard.rx = None;
        value
    }

    /// Number of senders currently parked waiting for a receiver.
    pub fn pending_senders(&self) -> usize {
        self.shared.lock().writers.len()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.lock().receivers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut slots = self.shared.lock();
        slots.receivers -= 1;
        if slots.receivers == 0 {
            for mut writer in slots.writers.drain(..) {
                if let Some(done) = writer.done.take() {
                    let _ = done.send(Err(writer.value));
                }
            }
        }
    }
}

/// Removes a parked writer when its `send` future is dropped before a match.
struct PendingWriterGuard<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    armed: bool,
}

impl<T> Drop for PendingWriterGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let id = self.id;
            self.shared.lock().writers.retain(|writer| writer.id != id);
        }
    }
}

/// Removes a parked reader when its `recv` future is dropped before a match.
struct PendingReaderGuard<'a, T> {
    shared: &'a Shared<T>,
    id: u64,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Drop for PendingReaderGuard<'_, T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        let mut slots = self.shared.lock();
        let id = self.id;
        let before = slots.readers.len();
        slots.readers.retain(|reader| reader.id != id);
        if slots.readers.len() != before {
            return;
        }

        // Already matched: a value may be sitting in the abandoned slot.
        rx.close();
        if let Ok(value) = rx.try_recv() {
            if let Err(value) = slots.offer(value) {
                let id = slots.next_id();
                slots.writers.push_front(PendingWriter {
                    id,
                    value,
                    done: None,
                });
            }
        }
    }
}
