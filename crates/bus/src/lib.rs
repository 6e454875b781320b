//! The top-level façade: coordinates the sender pool, the listener pool,
//! and the threadpool, and routes registration/submission calls to the
//! subsystem that owns a given socket.
//!
//! Mirrors the original `bus_init`/`bus_send_request`/`bus_shutdown`
//! contract (`bus.h`/`bus.c`) for the lifecycle and routing this crate
//! implements.

mod config;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bus_listener::{Listener, ListenerConfig, ListenerHandle};
use bus_sender::{Sender, SenderConfig, SenderHandle};
use bus_threadpool::ThreadPool;
use bus_types::{
    AnyUdata, BoxedMessage, BusCallbacks, InitError, LogEvent, RegisterError, SendError, SocketType, UserMessage,
};
use tracing::{debug, info, warn};

pub use bus_threadpool::{Task, ThreadpoolConfig};
pub use config::BusConfig;

/// A running message bus: `N_s` sender threads, `N_l` listener threads, and
/// a threadpool, wired together per a [`BusConfig`].
pub struct Bus<R> {
    senders: Vec<Sender<R>>,
    listeners: Vec<Listener<R>>,
    sender_handles: Vec<SenderHandle<R>>,
    listener_handles: Arc<Vec<ListenerHandle<R>>>,
    threadpool: Option<Arc<ThreadPool>>,
    request_timeout: Duration,
    log_mutex: Mutex<()>,
    shut_down: bool,
}

impl<R: Send + 'static> Bus<R> {
    /// Brings up the sender pool, the listener pool, and the threadpool,
    /// in that order (listeners first, since senders need their handles to
    /// route completed writes to the right `EXPECT_RESPONSE` owner).
    pub fn init(mut config: BusConfig<R>) -> Result<Self, InitError> {
        config.validate();

        let callbacks = Arc::new(BusCallbacks::new(
            Arc::clone(&config.sink),
            Arc::clone(&config.unpack),
            Arc::clone(&config.unexpected_msg),
            config.error.clone(),
            config.log.clone(),
        ));

        let threadpool = Arc::new(ThreadPool::init(config.threadpool).map_err(InitError::ThreadpoolInitFail)?);

        let listener_config = ListenerConfig { tick_max: config.tick_max, hold_deadline: config.hold_deadline };
        let mut listeners = Vec::with_capacity(config.listener_count as usize);
        for id in 0..config.listener_count as usize {
            let listener = Listener::spawn(id, listener_config, Arc::clone(&callbacks), Arc::clone(&threadpool))
                .map_err(InitError::ListenerInitFail)?;
            listeners.push(listener);
        }
        let listener_handles: Arc<Vec<ListenerHandle<R>>> = Arc::new(listeners.iter().map(Listener::handle).collect());

        let sender_config = SenderConfig { tick_max: config.tick_max, ..SenderConfig::default() };
        let mut senders = Vec::with_capacity(config.sender_count as usize);
        for id in 0..config.sender_count as usize {
            let sender = Sender::spawn(id, sender_config, Arc::clone(&threadpool), Arc::clone(&listener_handles))
                .map_err(InitError::SenderInitFail)?;
            senders.push(sender);
        }
        let sender_handles = senders.iter().map(Sender::handle).collect();

        info!(
            event = %LogEvent::Initialization,
            senders = config.sender_count,
            listeners = config.listener_count,
            "bus initialized"
        );

        Ok(Self {
            senders,
            listeners,
            sender_handles,
            listener_handles,
            threadpool: Some(threadpool),
            request_timeout: config.request_timeout,
            log_mutex: Mutex::new(()),
            shut_down: false,
        })
    }

    fn listener_for(&self, fd: i32) -> &ListenerHandle<R> {
        &self.listener_handles[(fd as usize) % self.listener_handles.len()]
    }

    fn sender_for(&self, fd: i32) -> &SenderHandle<R> {
        &self.sender_handles[(fd as usize) % self.sender_handles.len()]
    }

    /// Registers an already-connected socket with the listener owning
    /// `fd mod listener_count`, blocking until the listener acknowledges.
    pub fn register_socket(&self, fd: i32, ty: SocketType, udata: AnyUdata) -> Result<(), RegisterError> {
        let ack = self.listener_for(fd).add_socket(fd, ty, udata);
        match ack.recv_timeout(self.request_timeout) {
            Ok(true) => {
                debug!(event = %LogEvent::SocketRegistered, fd, "socket registered");
                Ok(())
            }
            Ok(false) => Err(RegisterError::Rejected),
            Err(_) => Err(RegisterError::AckTimeout),
        }
    }

    /// Deregisters `fd`, returning its `udata` back to the caller.
    pub fn release_socket(&self, fd: i32) -> Result<Option<AnyUdata>, RegisterError> {
        let ack = self.listener_for(fd).remove_socket(fd);
        ack.recv_timeout(self.request_timeout).map_err(|_| RegisterError::AckTimeout)
    }

    /// Submits a request for transmission, blocking on the per-submission
    /// completion pipe and honoring whatever counter-pressure sleep the
    /// owning listener recommended.
    pub fn send_request(&self, msg: UserMessage<R>) -> Result<(), SendError> {
        if msg.fd == 0 {
            return Err(SendError::InvalidFd);
        }
        let fd = msg.fd;
        let seq_id = msg.seq_id;
        debug!(event = %LogEvent::SendingRequest, fd, seq_id, "request submitted");
        let boxed = Box::new(BoxedMessage::new(msg, Instant::now()));
        let mut completion = self.sender_for(fd).enqueue(boxed).map_err(|_| SendError::SenderQueueFull)?;
        let backpressure_ms =
            completion.recv_backpressure(self.request_timeout).map_err(|_| SendError::CompletionTimeout)?;
        if backpressure_ms > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(backpressure_ms)));
        }
        Ok(())
    }

    /// Forwards a unit of work to the threadpool. Returns `false` if there
    /// is no threadpool or it rejected the task; either way the task still
    /// runs on the caller's thread, never silently dropped.
    pub fn schedule_task(&self, task: Task, backpressure: &mut u64) -> bool {
        let Some(pool) = self.threadpool.as_ref() else {
            task.invoke();
            return false;
        };
        match pool.schedule(task, backpressure) {
            Ok(()) => true,
            Err(task) => {
                task.invoke();
                false
            }
        }
    }

    /// Bounds the critical section in which a multi-field log record is
    /// assembled and emitted, the only lock shared across sender/listener/
    /// worker threads during normal operation. The transport itself is
    /// `tracing`'s; this mutex only serializes multi-line emission.
    #[must_use]
    pub fn lock_log(&self) -> LogGuard<'_> {
        LogGuard(self.log_mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Stops accepting new work, joins every sender then every listener
    /// (in that order, since senders still reference the listener pool
    /// until they exit), then frees the threadpool. Idempotent: a second
    /// call is a no-op returning `true`.
    pub fn shutdown(&mut self) -> bool {
        if self.shut_down {
            return true;
        }
        for sender in self.senders.drain(..) {
            sender.join();
        }
        for listener in self.listeners.drain(..) {
            listener.join();
        }
        if let Some(threadpool) = self.threadpool.take() {
            match Arc::try_unwrap(threadpool) {
                Ok(pool) => pool.free(),
                Err(_) => warn!("threadpool still referenced at shutdown, dropping without a graceful join"),
            }
        }
        self.shut_down = true;
        info!(event = %LogEvent::Shutdown, "bus shutdown complete");
        true
    }
}

impl<R> Drop for Bus<R> {
    fn drop(&mut self) {
        if !self.shut_down && !self.senders.is_empty() {
            warn!("Bus dropped without an explicit shutdown() call; in-flight requests may be abandoned");
        }
    }
}

/// RAII handle returned by [`Bus::lock_log`]; dropping it (or calling
/// [`LogGuard::unlock`] explicitly) releases the log gate.
pub struct LogGuard<'a>(MutexGuard<'a, ()>);

impl LogGuard<'_> {
    pub fn unlock(self) {}
}
