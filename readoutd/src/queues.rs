//! Bounded queues wiring the core to its collaborators.
//!
//! Each queue is a single-producer/single-consumer pair by protocol; the
//! channel type itself does not enforce that, the thread layout does.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

pub type Sink<T> = Sender<T>;
pub type Source<T> = Receiver<T>;

pub fn pair<T>(capacity: usize) -> (Sink<T>, Source<T>) {
    bounded(capacity)
}

/// Pop with a bounded wait. `Ok(None)` is an expired timeout, which is
/// never an error for the readout loops.
pub fn pop_timeout<T>(source: &Source<T>, timeout: Duration) -> Result<Option<T>, Disconnected> {
    match source.recv_timeout(timeout) {
        Ok(item) => Ok(Some(item)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(Disconnected),
    }
}

/// Push with a bounded wait. Returns the rejected item on timeout so the
/// caller can count the drop.
pub fn push_timeout<T>(sink: &Sink<T>, item: T, timeout: Duration) -> Result<(), PushError<T>> {
    match sink.send_timeout(item, timeout) {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(item)) => Err(PushError::Full(item)),
        Err(SendTimeoutError::Disconnected(item)) => Err(PushError::Disconnected(item)),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Disconnected;

#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    Disconnected(T),
}
