//! The sender's inbound submission queue and the handle used to post to it.
//!
//! The reference source claims a slot in a fixed `TxInfo` array with an
//! atomic CAS and signals the sender thread over a notifier pipe. A
//! `crossbeam_channel::bounded` channel already gives us both halves of that
//! for free: `try_send` is the CAS (full queue rejects exactly like a failed
//! claim), and the channel itself wakes the sender's `poll` once its
//! receiver is registered as a doorbell. The per-fd ordering the array
//! indexing gave incidentally is instead enforced explicitly by the
//! sender's per-socket write queues (see `lib.rs`).

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use bus_types::{BoxedMessage, CompletionWriter};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use mio::unix::pipe;

pub enum SenderMsg<R> {
    Enqueue { msg: Box<BoxedMessage<R>>, completion: CompletionWriter },
    Shutdown,
}

/// A cloneable reference to a running sender, held by the façade.
pub struct SenderHandle<R> {
    tx: Sender<SenderMsg<R>>,
    doorbell: Arc<Mutex<pipe::Sender>>,
}

impl<R> Clone for SenderHandle<R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), doorbell: Arc::clone(&self.doorbell) }
    }
}

impl<R> SenderHandle<R> {
    pub(crate) fn new(tx: Sender<SenderMsg<R>>, doorbell: pipe::Sender) -> Self {
        Self { tx, doorbell: Arc::new(Mutex::new(doorbell)) }
    }

    fn ring(&self) {
        let Ok(mut doorbell) = self.doorbell.lock() else { return };
        match doorbell.write(&[0u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "sender doorbell write failed"),
        }
    }

    /// Submits a boxed request for transmission, handing back the
    /// completion pipe the caller should block on. Returns the box back to
    /// the caller, unenqueued, if the inbound queue is momentarily full --
    /// back-pressure by rejection, same shape as `ThreadPool::schedule`.
    pub fn enqueue(&self, msg: Box<BoxedMessage<R>>) -> Result<bus_types::CompletionReader, Box<BoxedMessage<R>>> {
        let (completion, reader) = match bus_types::completion_pipe() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create completion pipe, rejecting submission");
                return Err(msg);
            }
        };
        match self.tx.try_send(SenderMsg::Enqueue { msg, completion }) {
            Ok(()) => {
                self.ring();
                Ok(reader)
            }
            Err(TrySendError::Full(SenderMsg::Enqueue { msg, .. })) => Err(msg),
            Err(TrySendError::Full(SenderMsg::Shutdown)) => unreachable!("never enqueue Shutdown"),
            Err(TrySendError::Disconnected(SenderMsg::Enqueue { msg, .. })) => Err(msg),
            Err(TrySendError::Disconnected(SenderMsg::Shutdown)) => unreachable!("never enqueue Shutdown"),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SenderMsg::Shutdown);
        self.ring();
    }
}

pub struct InboundQueue<R> {
    pub rx: Receiver<SenderMsg<R>>,
    pub doorbell: pipe::Receiver,
}

pub fn inbound_queue<R>(capacity: usize) -> io::Result<(SenderHandle<R>, InboundQueue<R>)> {
    let (tx, rx) = bounded(capacity);
    let (doorbell_tx, doorbell_rx) = pipe::new()?;
    Ok((SenderHandle::new(tx, doorbell_tx), InboundQueue { rx, doorbell: doorbell_rx }))
}
