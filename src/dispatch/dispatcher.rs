//! Single-request-in-flight arbitration.
//!
//! ```text
//!  Reader ─┐                    ┌─────────────┐
//!  Writer ─┼─▶ register() ─▶   │ BinaryHeap  │ ─▶ send ─▶ Link
//!  Control─┘   (priority)       │ prio, seq   │            │
//!                               └─────────────┘            ▼
//!        Completion ◀── process() ◀── FrameDecoder ◀── recv
//! ```
//!
//! The link is half-duplex without pipelining: a request is only sent
//! once the previous one has been answered, has timed out, or has failed
//! to send.  Completions are handed back tagged with the submitter's
//! [`Origin`]; the caller routes them.  Nothing is retried here.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use log::{debug, trace, warn};

use crate::app::ports::Link;
use crate::error::DispatchError;
use crate::protocol::frame::{FrameDecoder, FrameKind, Request, Response};

/// Heartbeats and other connection-control traffic.
pub const PRIORITY_CONTROL: u8 = 10;
/// Memory and RPV writes.
pub const PRIORITY_WRITE: u8 = 5;
/// Memory and RPV reads.
pub const PRIORITY_READ: u8 = 1;

/// Who submitted a request; completions are routed back by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Reader,
    Writer,
    /// Control-plane request, identified by the ticket returned when it
    /// was submitted.
    Control(u32),
}

/// The outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub origin: Origin,
    pub request: Request,
    pub outcome: Result<Response, DispatchError>,
}

/// Running counters, reset with the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub bad_frames: u64,
}

struct Queued {
    priority: u8,
    seq: u64,
    origin: Origin,
    request: Request,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// Higher priority first; among equals, lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    origin: Origin,
    request: Request,
    sent_at_us: u64,
}

pub struct Dispatcher {
    queue: BinaryHeap<Queued>,
    in_flight: Option<InFlight>,
    ready: VecDeque<Completion>,
    decoder: FrameDecoder,
    next_seq: u64,
    timeout_us: u64,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(timeout_us: u64, max_response_payload: usize) -> Self {
        Self {
            queue: BinaryHeap::new(),
            in_flight: None,
            ready: VecDeque::new(),
            decoder: FrameDecoder::new(FrameKind::Response, max_response_payload),
            next_seq: 0,
            timeout_us,
            stats: DispatchStats::default(),
        }
    }

    pub fn set_timeout_us(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    pub fn set_max_response_payload(&mut self, max: usize) {
        self.decoder.set_max_payload(max);
    }

    /// Enqueue `request`.  A submitter must not register again while its
    /// previous request is still outstanding.
    pub fn register(&mut self, request: Request, origin: Origin, priority: u8) {
        trace!(
            "Dispatch: queue {:?} cmd={} subfn={} prio={}",
            origin, request.command, request.subfn, priority
        );
        self.queue.push(Queued {
            priority,
            seq: self.next_seq,
            origin,
            request,
        });
        self.next_seq += 1;
    }

    /// Advance by one step and return at most one completion.
    pub fn process(&mut self, link: &mut impl Link, now_us: u64) -> Option<Completion> {
        if link.is_up() {
            self.poll_in_flight(link, now_us);
            if self.in_flight.is_none() {
                self.send_next(link, now_us);
            }
        } else {
            self.fail_all(DispatchError::LinkDown);
        }
        self.ready.pop_front()
    }

    fn poll_in_flight(&mut self, link: &mut impl Link, now_us: u64) {
        while let Some(bytes) = link.recv() {
            self.decoder.feed(&bytes);
        }

        while let Some(frame) = self.decoder.next_frame() {
            let Some(flight) = self.in_flight.take() else {
                debug!("Dispatch: discarding unsolicited frame");
                continue;
            };
            let outcome = match frame.and_then(|f| Response::from_bytes(&f)) {
                Ok(resp) if resp.answers(&flight.request) => Ok(resp),
                Ok(resp) => {
                    warn!(
                        "Dispatch: response cmd={} subfn={} does not answer cmd={} subfn={}",
                        resp.command, resp.subfn, flight.request.command, flight.request.subfn
                    );
                    Err(DispatchError::Mismatch)
                }
                Err(e) => {
                    warn!("Dispatch: bad response frame: {}", e);
                    self.stats.bad_frames += 1;
                    Err(DispatchError::BadFrame(e))
                }
            };
            self.complete(flight, outcome);
        }

        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| now_us.saturating_sub(f.sent_at_us) >= self.timeout_us);
        if expired {
            if let Some(flight) = self.in_flight.take() {
                warn!(
                    "Dispatch: timeout on cmd={} subfn={}",
                    flight.request.command, flight.request.subfn
                );
                self.stats.timeouts += 1;
                self.decoder.reset();
                self.complete(flight, Err(DispatchError::Timeout));
            }
        }
    }

    fn send_next(&mut self, link: &mut impl Link, now_us: u64) {
        let Some(next) = self.queue.pop() else {
            return;
        };
        let flight = InFlight {
            origin: next.origin,
            request: next.request,
            sent_at_us: now_us,
        };

        let bytes = match flight.request.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!("Dispatch: cannot encode request: {}", e);
                self.complete(flight, Err(DispatchError::BadFrame(e)));
                return;
            }
        };

        self.decoder.reset();
        match link.send(&bytes) {
            Ok(()) => {
                trace!("Dispatch: sent {} bytes for {:?}", bytes.len(), flight.origin);
                self.stats.sent += 1;
                self.in_flight = Some(flight);
            }
            Err(e) => {
                warn!("Dispatch: send failed: {}", e);
                self.complete(flight, Err(DispatchError::SendFailed));
            }
        }
    }

    fn complete(&mut self, flight: InFlight, outcome: Result<Response, DispatchError>) {
        if outcome.is_ok() {
            self.stats.completed += 1;
        } else {
            self.stats.failed += 1;
        }
        self.ready.push_back(Completion {
            origin: flight.origin,
            request: flight.request,
            outcome,
        });
    }

    fn fail_all(&mut self, error: DispatchError) {
        if let Some(flight) = self.in_flight.take() {
            self.complete(flight, Err(error));
        }
        let mut drained: Vec<Queued> = self.queue.drain().collect();
        drained.sort_by(|a, b| b.cmp(a));
        for q in drained {
            self.complete(
                InFlight {
                    origin: q.origin,
                    request: q.request,
                    sent_at_us: 0,
                },
                Err(error),
            );
        }
        self.decoder.reset();
    }

    /// Cancel everything and return the completions that were owed.
    pub fn reset(&mut self) -> Vec<Completion> {
        self.fail_all(DispatchError::Cancelled);
        self.ready.drain(..).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty() && self.ready.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Requests waiting to be sent.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }
}
