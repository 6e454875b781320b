//! The listener's control protocol and the handle used to drive it.
//!
//! In the reference source, control messages are nodes borrowed from a
//! freelist and a single id byte is written to a `commit_pipe` to wake the
//! listener's `poll`; the body of the message sits in shared memory the
//! listener then reads back out of the freelist slot by id. That two-step
//! handoff exists only because the message body (a tagged union with a raw
//! pointer payload) cannot safely cross threads by value in C. Rust can
//! send the body by value instead: `crossbeam_channel` carries the full
//! owned `ListenerMsg`, and the pipe is kept purely as a doorbell to wake
//! `mio::Poll` -- the freelist-by-id indirection is no longer needed.

use std::{
    io::{self, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use bus_types::{AnyUdata, BoxedMessage, SocketType};
use crossbeam_channel::{Receiver, Sender, bounded};
use mio::unix::pipe;

/// One-shot reply channel for `ADD_SOCKET`.
pub type AddAck = Sender<bool>;
/// One-shot reply channel for `REMOVE_SOCKET`, carrying back the socket's udata.
pub type RemoveAck = Sender<Option<AnyUdata>>;

pub enum ListenerMsg<R> {
    AddSocket { fd: i32, ty: SocketType, udata: AnyUdata, ack: AddAck },
    RemoveSocket { fd: i32, ack: RemoveAck },
    ExpectResponse { fd: i32, seq_id: i64, deadline: Instant, msg: Box<BoxedMessage<R>> },
    Shutdown,
}

/// A cloneable reference to a running listener, held by the façade and by
/// every sender thread whose sockets this listener owns.
pub struct ListenerHandle<R> {
    tx: Sender<ListenerMsg<R>>,
    doorbell: Arc<Mutex<pipe::Sender>>,
    in_use: Arc<AtomicUsize>,
}

impl<R> Clone for ListenerHandle<R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), doorbell: Arc::clone(&self.doorbell), in_use: Arc::clone(&self.in_use) }
    }
}

impl<R> ListenerHandle<R> {
    pub(crate) fn new(tx: Sender<ListenerMsg<R>>, doorbell: pipe::Sender, in_use: Arc<AtomicUsize>) -> Self {
        Self { tx, doorbell: Arc::new(Mutex::new(doorbell)), in_use }
    }

    /// Current `rx_info` occupancy, published by the listener thread once
    /// per tick. Senders read this to compute the counter-pressure
    /// milliseconds they report back on a request's completion pipe -- the
    /// one piece of cross-thread shared state in this pipeline that is
    /// genuinely contended, per the "atomic ops only where contention is
    /// real" design note.
    pub fn rx_info_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Posts a control message and rings the doorbell so the listener's
    /// `poll` wakes promptly instead of waiting out the next tick.
    pub fn post(&self, msg: ListenerMsg<R>) -> Result<(), crossbeam_channel::SendError<ListenerMsg<R>>> {
        self.tx.send(msg)?;
        self.ring();
        Ok(())
    }

    fn ring(&self) {
        let Ok(mut doorbell) = self.doorbell.lock() else { return };
        match doorbell.write(&[0u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // A wake byte is already pending; the listener will drain it
                // and re-check the queue regardless.
            }
            Err(e) => tracing::warn!(error = %e, "listener doorbell write failed"),
        }
    }

    pub fn add_socket(&self, fd: i32, ty: SocketType, udata: AnyUdata) -> Receiver<bool> {
        let (ack, rx) = bounded(1);
        let _ = self.post(ListenerMsg::AddSocket { fd, ty, udata, ack });
        rx
    }

    pub fn remove_socket(&self, fd: i32) -> Receiver<Option<AnyUdata>> {
        let (ack, rx) = bounded(1);
        let _ = self.post(ListenerMsg::RemoveSocket { fd, ack });
        rx
    }

    pub fn expect_response(&self, fd: i32, seq_id: i64, deadline: Instant, msg: Box<BoxedMessage<R>>) {
        let _ = self.post(ListenerMsg::ExpectResponse { fd, seq_id, deadline, msg });
    }

    pub fn shutdown(&self) {
        let _ = self.post(ListenerMsg::Shutdown);
    }
}

/// Listener-side half of the control channel, paired with a doorbell
/// receiver `mio::Poll` registers directly.
pub struct ControlChannel<R> {
    pub rx: Receiver<ListenerMsg<R>>,
    pub doorbell: pipe::Receiver,
}

pub fn control_channel<R>(capacity: usize) -> io::Result<(ListenerHandle<R>, ControlChannel<R>, Arc<AtomicUsize>)> {
    let (tx, rx) = bounded(capacity);
    let (doorbell_tx, doorbell_rx) = pipe::new()?;
    let in_use = Arc::new(AtomicUsize::new(0));
    Ok((ListenerHandle::new(tx, doorbell_tx, Arc::clone(&in_use)), ControlChannel { rx, doorbell: doorbell_rx }, in_use))
}
