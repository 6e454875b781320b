//! The in-flight expectation table.
//!
//! One per listener thread, never touched from any other thread, which is
//! why this holds a plain `Vec` rather than the C original's CAS-linked
//! freelist (`listener_helper_get_free_rx_info`/`listener_helper_get_hold_rx_info`
//! in the reference source): contention here is single-threaded by
//! construction, so an index scan replaces the atomic freelist without
//! losing any of its bounded-memory guarantee.

use std::time::Instant;

use bus_types::{BoxedMessage, Status};

/// Fixed capacity of the reservation table, mirroring `MAX_PENDING_MESSAGES`
/// in the reference source.
pub const MAX_PENDING_MESSAGES: usize = 1024;

enum Slot<R> {
    Inactive,
    /// A response arrived before its expectation was posted.
    Hold { fd: i32, seq_id: i64, response: R, deadline: Instant },
    /// A sender posted an expectation; awaiting a matching frame.
    ExpectResponse { fd: i32, seq_id: i64, deadline: Instant, msg: Box<BoxedMessage<R>> },
}

/// What to do with a `BoxedMessage` pulled out of the table.
pub enum Resolved<R> {
    Completed(Box<BoxedMessage<R>>),
}

pub struct RxTable<R> {
    slots: Vec<Slot<R>>,
    max_used: usize,
    in_use: usize,
}

impl<R> RxTable<R> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PENDING_MESSAGES);
        slots.resize_with(MAX_PENDING_MESSAGES, || Slot::Inactive);
        Self { slots, max_used: 0, in_use: 0 }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn first_inactive(&self) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Slot::Inactive))
    }

    /// Registers a new expectation for `(fd, seq_id)`. If a `Hold` already
    /// carries a response for that key, merges and completes immediately
    /// instead of reserving a slot -- mirrors the `EXPECT_RESPONSE` handler
    /// in the reference source's listener task, which checks
    /// `listener_helper_get_hold_rx_info` before reserving.
    pub fn expect_response(
        &mut self,
        fd: i32,
        seq_id: i64,
        deadline: Instant,
        msg: Box<BoxedMessage<R>>,
    ) -> Result<Option<Resolved<R>>, Box<BoxedMessage<R>>> {
        bus_types::safe_assert!(
            self.find_expect(fd, seq_id).is_none(),
            "duplicate EXPECT_RESPONSE for (fd={fd}, seq_id={seq_id})"
        );

        if let Some(idx) = self.find_hold(fd, seq_id) {
            let Slot::Hold { response, .. } = std::mem::replace(&mut self.slots[idx], Slot::Inactive) else {
                unreachable!("find_hold only returns Hold indices")
            };
            self.in_use -= 1;
            let mut msg = msg;
            msg.result = bus_types::MsgResult::success(msg.out_seq_id, response);
            return Ok(Some(Resolved::Completed(msg)));
        }

        let Some(idx) = self.first_inactive() else {
            return Err(msg);
        };
        self.slots[idx] = Slot::ExpectResponse { fd, seq_id, deadline, msg };
        self.max_used = self.max_used.max(idx);
        self.in_use += 1;
        Ok(None)
    }

    fn find_hold(&self, fd: i32, seq_id: i64) -> Option<usize> {
        self.slots[..=self.max_used.min(self.slots.len().saturating_sub(1))]
            .iter()
            .position(|slot| matches!(slot, Slot::Hold { fd: f, seq_id: s, .. } if *f == fd && *s == seq_id))
    }

    fn find_expect(&self, fd: i32, seq_id: i64) -> Option<usize> {
        self.slots[..=self.max_used.min(self.slots.len().saturating_sub(1))]
            .iter()
            .position(|slot| matches!(slot, Slot::ExpectResponse { fd: f, seq_id: s, .. } if *f == fd && *s == seq_id))
    }

    /// A framed response arrived. If a matching expectation exists, fills it
    /// and returns the completed box. Otherwise reserves a `Hold` slot with
    /// `hold_deadline` and returns `None`; if the table is full, returns
    /// `Err(response)` so the caller can fall back to `unexpected_msg_cb`.
    pub fn deliver_response(
        &mut self,
        fd: i32,
        seq_id: i64,
        response: R,
        hold_deadline: Instant,
    ) -> Result<Option<Resolved<R>>, R> {
        if let Some(idx) = self.find_expect(fd, seq_id) {
            let Slot::ExpectResponse { msg, .. } = std::mem::replace(&mut self.slots[idx], Slot::Inactive) else {
                unreachable!("find_expect only returns ExpectResponse indices")
            };
            self.in_use -= 1;
            let mut msg = msg;
            msg.result = bus_types::MsgResult::success(msg.out_seq_id, response);
            return Ok(Some(Resolved::Completed(msg)));
        }

        let Some(idx) = self.first_inactive() else {
            return Err(response);
        };
        self.slots[idx] = Slot::Hold { fd, seq_id, response, deadline: hold_deadline };
        self.max_used = self.max_used.max(idx);
        self.in_use += 1;
        Ok(None)
    }

    /// Earliest deadline among live slots, used to cap the listener's next
    /// `poll` timeout so the sweep runs promptly after it elapses.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.slots[..=self.max_used.min(self.slots.len().saturating_sub(1))]
            .iter()
            .filter_map(|s| match s {
                Slot::ExpectResponse { deadline, .. } | Slot::Hold { deadline, .. } => Some(*deadline),
                Slot::Inactive => None,
            })
            .min()
    }

    /// Sweeps every live slot, evicting `ExpectResponse` entries past
    /// `deadline` (completed `TimedOut`) and `Hold` entries past their own
    /// short hold deadline (silently dropped: nobody is waiting on them).
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<Box<BoxedMessage<R>>> {
        let mut timed_out = Vec::new();
        for idx in 0..=self.max_used.min(self.slots.len().saturating_sub(1)) {
            let expired_expect = matches!(&self.slots[idx], Slot::ExpectResponse { deadline, .. } if *deadline <= now);
            let expired_hold = matches!(&self.slots[idx], Slot::Hold { deadline, .. } if *deadline <= now);

            if expired_expect {
                let Slot::ExpectResponse { msg, .. } = std::mem::replace(&mut self.slots[idx], Slot::Inactive) else {
                    unreachable!("expired_expect only set for ExpectResponse slots")
                };
                self.in_use -= 1;
                let mut msg = msg;
                msg.result = bus_types::MsgResult::terminal(Status::TimedOut, msg.out_seq_id);
                timed_out.push(msg);
            } else if expired_hold {
                self.slots[idx] = Slot::Inactive;
                self.in_use -= 1;
            }
        }
        timed_out
    }

    /// Fails every live `ExpectResponse` slot belonging to `fd` (socket torn
    /// down or read-fatal), clearing any `Hold` entries for it too since
    /// nothing will ever merge with them now.
    pub fn fail_socket(&mut self, fd: i32, status: Status) -> Vec<Box<BoxedMessage<R>>> {
        let mut failed = Vec::new();
        for idx in 0..=self.max_used.min(self.slots.len().saturating_sub(1)) {
            let matches_fd = matches!(&self.slots[idx], Slot::ExpectResponse { fd: f, .. } if *f == fd)
                || matches!(&self.slots[idx], Slot::Hold { fd: f, .. } if *f == fd);
            if !matches_fd {
                continue;
            }
            match std::mem::replace(&mut self.slots[idx], Slot::Inactive) {
                Slot::ExpectResponse { msg, .. } => {
                    self.in_use -= 1;
                    let mut msg = msg;
                    msg.result = bus_types::MsgResult::terminal(status, msg.out_seq_id);
                    failed.push(msg);
                }
                Slot::Hold { .. } => {
                    self.in_use -= 1;
                }
                Slot::Inactive => {}
            }
        }
        failed
    }

    /// Drains every live `ExpectResponse` slot as `Shutdown`, for the
    /// listener's shutdown path. `Hold` slots carry no caller to notify and
    /// are simply cleared.
    pub fn drain_for_shutdown(&mut self) -> Vec<Box<BoxedMessage<R>>> {
        let mut drained = Vec::new();
        for slot in &mut self.slots {
            match std::mem::replace(slot, Slot::Inactive) {
                Slot::ExpectResponse { msg, .. } => {
                    let mut msg = msg;
                    msg.result = bus_types::MsgResult::terminal(Status::Shutdown, msg.out_seq_id);
                    drained.push(msg);
                }
                Slot::Hold { .. } | Slot::Inactive => {}
            }
        }
        self.in_use = 0;
        drained
    }
}

impl<R> Default for RxTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// `10 * (in_use / 2)^2` microseconds, matching
/// `listener_helper_get_free_msg`'s counterpressure delay in the reference
/// source exactly (`10 * (miu >> 1) * (miu >> 1)`).
pub fn counter_pressure_micros(in_use: usize) -> u64 {
    let half = (in_use / 2) as u64;
    10 * half * half
}

/// Counter-pressure delay converted to whole milliseconds for the
/// completion-pipe wire protocol (`u16 backpressure_ms`).
pub fn counter_pressure_ms(in_use: usize) -> u16 {
    (counter_pressure_micros(in_use) / 1000).min(u64::from(u16::MAX)) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_pressure_is_zero_below_threshold() {
        assert_eq!(counter_pressure_micros(0), 0);
        assert_eq!(counter_pressure_micros(1), 0);
        assert_eq!(counter_pressure_micros(2), 10);
        assert_eq!(counter_pressure_micros(3), 10);
    }

    #[test]
    fn counter_pressure_grows_quadratically() {
        assert_eq!(counter_pressure_micros(40), 10 * 20 * 20);
        assert!(counter_pressure_ms(40) > 0);
    }
}
