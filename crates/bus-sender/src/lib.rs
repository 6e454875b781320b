//! Owns socket writability for a shard of registered sockets.
//!
//! Single-threaded `mio` poll/write loop, matching the original
//! `sender_task`/`bus.c` contract for the queue model and the handoff to
//! the owning listener once a write completes.

mod inbound;

use std::{
    collections::{HashMap, VecDeque},
    io,
    os::fd::RawFd,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bus_listener::ListenerHandle;
use bus_threadpool::{Task, ThreadPool};
use bus_types::{BoxedMessage, CompletionWriter, Status};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::{debug, trace, warn};

pub use inbound::{InboundQueue, SenderHandle, SenderMsg, inbound_queue};

const DOORBELL_TOKEN: Token = Token(0);
const INBOUND_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// Upper bound on a single `poll` wait, so the pending-write timeout
    /// sweep runs regularly even with no writable sockets.
    pub tick_max: Duration,
    /// How long `shutdown` waits for in-flight writes to drain before
    /// failing whatever remains.
    pub shutdown_grace: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { tick_max: Duration::from_millis(100), shutdown_grace: Duration::from_secs(2) }
    }
}

/// One request queued for transmission on a socket, strictly ordered behind
/// every earlier request for the same `fd`.
struct PendingWrite<R> {
    msg: Box<BoxedMessage<R>>,
    completion: CompletionWriter,
    offset: usize,
}

/// A running sender thread plus the handle used to talk to it.
pub struct Sender<R> {
    id: usize,
    handle: SenderHandle<R>,
    join: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> Sender<R> {
    /// `listeners` is the full listener pool; `fd mod listeners.len()`
    /// picks the listener this sender hands completed writes off to, same
    /// routing rule the façade uses to pick the owning sender itself.
    pub fn spawn(
        id: usize,
        config: SenderConfig,
        threadpool: Arc<ThreadPool>,
        listeners: Arc<Vec<ListenerHandle<R>>>,
    ) -> io::Result<Self> {
        let (handle, inbound) = inbound_queue(INBOUND_QUEUE_CAPACITY)?;
        let join = std::thread::Builder::new()
            .name(format!("bus-sender-{id}"))
            .spawn(move || run(id, config, &threadpool, &listeners, inbound))?;
        Ok(Self { id, handle, join: Some(join) })
    }

    pub fn handle(&self) -> SenderHandle<R> {
        self.handle.clone()
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    /// Requests shutdown and blocks until the thread has drained (or given
    /// up on, past its grace deadline) every in-flight write.
    pub fn join(mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.join() {
                warn!(sender = self.id, ?e, "sender thread panicked");
            }
        }
    }
}

const fn fd_token(fd: i32) -> Token {
    Token(fd as usize + 1)
}

const fn token_fd(token: Token) -> i32 {
    (token.0 - 1) as i32
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n >= 0 { Ok(n as usize) } else { Err(io::Error::last_os_error()) }
}

fn run<R: Send + 'static>(
    id: usize,
    config: SenderConfig,
    threadpool: &Arc<ThreadPool>,
    listeners: &Arc<Vec<ListenerHandle<R>>>,
    mut inbound: InboundQueue<R>,
) {
    let poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            warn!(sender = id, error = %e, "failed to create poll instance, sender exiting");
            return;
        }
    };
    if let Err(e) = poll.registry().register(&mut inbound.doorbell, DOORBELL_TOKEN, Interest::READABLE) {
        warn!(sender = id, error = %e, "failed to register doorbell, sender exiting");
        return;
    }

    let mut writers: HashMap<i32, VecDeque<PendingWrite<R>>> = HashMap::new();
    let mut events = Events::with_capacity(256);
    let mut shutdown_deadline: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let timeout = match shutdown_deadline {
            Some(d) => d.saturating_duration_since(now).min(config.tick_max),
            None => config.tick_max,
        };

        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(sender = id, error = %e, "poll failed, sender exiting");
                break;
            }
        }

        drain_doorbell(&mut inbound.doorbell);

        if shutdown_deadline.is_none() {
            while let Ok(msg) = inbound.rx.try_recv() {
                match msg {
                    SenderMsg::Enqueue { msg, completion } => {
                        handle_enqueue(&poll, &mut writers, listeners, threadpool, msg, completion);
                    }
                    SenderMsg::Shutdown => {
                        shutdown_deadline = Some(Instant::now() + config.shutdown_grace);
                    }
                }
            }
        }

        for event in events.iter() {
            if event.token() == DOORBELL_TOKEN {
                continue;
            }
            let fd = token_fd(event.token());
            if event.is_writable() {
                service_writable(&poll, &mut writers, listeners, threadpool, fd);
            }
        }

        let now = Instant::now();
        sweep_pending_timeouts(&poll, &mut writers, threadpool, now);

        if let Some(deadline) = shutdown_deadline {
            let drained = writers.is_empty();
            if drained || now >= deadline {
                if !drained {
                    warn!(sender = id, sockets = writers.len(), "shutdown grace elapsed, failing remaining writes");
                    fail_all_remaining(&poll, &mut writers, threadpool);
                }
                break;
            }
        }
    }

    debug!(sender = id, "sender thread exiting");
}

fn drain_doorbell(doorbell: &mut mio::unix::pipe::Receiver) {
    use std::io::Read;
    let mut buf = [0u8; 64];
    loop {
        match doorbell.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn handle_enqueue<R: Send + 'static>(
    poll: &Poll,
    writers: &mut HashMap<i32, VecDeque<PendingWrite<R>>>,
    listeners: &[ListenerHandle<R>],
    threadpool: &ThreadPool,
    msg: Box<BoxedMessage<R>>,
    completion: CompletionWriter,
) {
    let fd = msg.fd;
    let first = !writers.contains_key(&fd) || writers[&fd].is_empty();
    writers.entry(fd).or_default().push_back(PendingWrite { msg, completion, offset: 0 });

    if first {
        if let Err(e) = poll.registry().register(&mut SourceFd(&fd), fd_token(fd), Interest::WRITABLE) {
            warn!(fd, error = %e, "failed to register socket for write readiness");
            if let Some(entry) = writers.get_mut(&fd).and_then(VecDeque::pop_front) {
                fail_entry(entry, Status::TxFailure, threadpool);
            }
            writers.remove(&fd);
            return;
        }
    }

    // Try an immediate write in case the socket is already writable --
    // avoids waiting out a full poll cycle for the common case.
    service_writable(poll, writers, listeners, threadpool, fd);
}

fn service_writable<R: Send + 'static>(
    poll: &Poll,
    writers: &mut HashMap<i32, VecDeque<PendingWrite<R>>>,
    listeners: &[ListenerHandle<R>],
    threadpool: &ThreadPool,
    fd: i32,
) {
    loop {
        let Some(queue) = writers.get_mut(&fd) else { return };
        let Some(front) = queue.front_mut() else { break };

        match raw_write(fd, &front.msg.out_payload[front.offset..]) {
            Ok(0) => {
                let entry = queue.pop_front().expect("front just matched");
                fail_entry(entry, Status::TxFailure, threadpool);
            }
            Ok(n) => {
                front.offset += n;
                if front.offset >= front.msg.out_payload.len() {
                    let entry = queue.pop_front().expect("front just matched");
                    complete_entry(entry, fd, listeners, threadpool);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(fd, error = %e, "socket write failed");
                let entry = queue.pop_front().expect("front just matched");
                fail_entry(entry, Status::TxFailure, threadpool);
            }
        }
    }

    if writers.get(&fd).is_some_and(VecDeque::is_empty) {
        writers.remove(&fd);
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }
}

/// Fails every queued write (started or not) whose deadline has already
/// elapsed, since it either never got a chance to write or stalled mid-write
/// past the caller's timeout. Deadlines reached after handoff are instead
/// caught by the listener's own sweep over `rx_info`.
fn sweep_pending_timeouts<R: Send + 'static>(
    poll: &Poll,
    writers: &mut HashMap<i32, VecDeque<PendingWrite<R>>>,
    threadpool: &ThreadPool,
    now: Instant,
) {
    writers.retain(|&fd, queue| {
        let mut i = 0;
        while i < queue.len() {
            if queue[i].msg.deadline <= now {
                let entry = queue.remove(i).expect("index just checked");
                fail_entry(entry, Status::TimedOut, threadpool);
            } else {
                i += 1;
            }
        }
        if queue.is_empty() {
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
            false
        } else {
            true
        }
    });
}

fn fail_all_remaining<R: Send + 'static>(
    poll: &Poll,
    writers: &mut HashMap<i32, VecDeque<PendingWrite<R>>>,
    threadpool: &ThreadPool,
) {
    for (fd, mut queue) in writers.drain() {
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
        while let Some(entry) = queue.pop_front() {
            fail_entry(entry, Status::Shutdown, threadpool);
        }
    }
}

fn complete_entry<R: Send + 'static>(
    entry: PendingWrite<R>,
    fd: i32,
    listeners: &[ListenerHandle<R>],
    threadpool: &ThreadPool,
) {
    let PendingWrite { msg, mut completion, .. } = entry;
    let deadline = msg.deadline;
    let seq_id = msg.out_seq_id;
    let listener = &listeners[(fd as usize) % listeners.len()];
    listener.expect_response(fd, seq_id, deadline, msg);
    let backpressure = bus_listener::counter_pressure_ms(listener.rx_info_in_use());
    if let Err(e) = completion.send_backpressure(backpressure) {
        trace!(fd, error = %e, "completion pipe write failed, caller likely gave up");
    }
}

fn fail_entry<R: Send + 'static>(entry: PendingWrite<R>, status: Status, threadpool: &ThreadPool) {
    let PendingWrite { mut msg, mut completion, .. } = entry;
    msg.fail(status);
    dispatch(threadpool, msg);
    if let Err(e) = completion.send_backpressure(0) {
        trace!(error = %e, "completion pipe write failed, caller likely gave up");
    }
}

fn dispatch<R: Send + 'static>(threadpool: &ThreadPool, msg: Box<BoxedMessage<R>>) {
    let mut backpressure = 0u64;
    let task = Task::Run(Box::new(move || msg.finish()));
    if let Err(task) = threadpool.schedule(task, &mut backpressure) {
        warn!("threadpool saturated, running result callback inline");
        task.invoke();
    }
}

#[cfg(test)]
mod test {
    use bus_threadpool::ThreadpoolConfig;

    use super::*;

    #[test]
    fn fd_token_round_trips() {
        for fd in [0, 1, 3, 17, 4095] {
            assert_eq!(token_fd(fd_token(fd)), fd);
        }
    }

    #[test]
    fn default_config_has_a_sane_tick_and_grace() {
        let cfg = SenderConfig::default();
        assert!(cfg.tick_max < cfg.shutdown_grace);
    }

    #[test]
    fn sweep_pending_timeouts_drops_expired_and_keeps_live_entries() {
        let threadpool = Arc::new(ThreadPool::init(ThreadpoolConfig::default()).unwrap());
        let poll = Poll::new().unwrap();
        let mut writers: HashMap<i32, VecDeque<PendingWrite<Vec<u8>>>> = HashMap::new();

        let (done_tx, done_rx) = crossbeam_channel::bounded::<bus_types::Status>(2);

        let make_entry = |seq_id: i64, deadline: Instant, done_tx: crossbeam_channel::Sender<bus_types::Status>| {
            let (completion, _reader) = bus_types::completion_pipe().unwrap();
            let user_msg = bus_types::UserMessage::<Vec<u8>> {
                fd: 9,
                seq_id,
                payload: Vec::new(),
                cb: Box::new(move |result: &bus_types::MsgResult<Vec<u8>>, _udata| {
                    let _ = done_tx.send(result.status);
                }),
                udata: None,
                timeout: Duration::from_secs(5),
            };
            let mut msg = Box::new(bus_types::BoxedMessage::new(user_msg, Instant::now()));
            msg.deadline = deadline;
            PendingWrite { msg, completion, offset: 0 }
        };

        let now = Instant::now();
        let mut queue = VecDeque::new();
        queue.push_back(make_entry(1, now - Duration::from_millis(1), done_tx.clone()));
        queue.push_back(make_entry(2, now + Duration::from_secs(60), done_tx.clone()));
        writers.insert(9, queue);

        sweep_pending_timeouts(&poll, &mut writers, &threadpool, now);

        assert_eq!(writers[&9].len(), 1, "only the expired entry should have been evicted");
        assert_eq!(writers[&9].front().unwrap().msg.out_seq_id, 2);

        std::thread::sleep(Duration::from_millis(50));
        let status = done_rx.recv_timeout(Duration::from_secs(1)).expect("expired entry never dispatched");
        assert_eq!(status, bus_types::Status::TimedOut);

        free_pool(threadpool);
    }

    fn free_pool(pool: Arc<ThreadPool>) {
        match Arc::try_unwrap(pool) {
            Ok(pool) => pool.free(),
            Err(_) => panic!("threadpool still has live references"),
        }
    }
}
