//! Single-consumer queue of "this member needs a connection" requests.
//!
//! Producers call [`MemberConnectionQueue::add`] whenever a member shows up
//! without a connection. One consumer obtains the exclusive
//! [`ConnectionRequests`] enumerator and connects members one at a time:
//! at most one request is checked out, and it must be completed before the
//! next one is handed out.
//!
//! Failed requests go back to the end of the queue and become eligible again
//! after a fixed delay. The queue can be suspended while the client
//! (re)connects to a cluster; suspension waits for the checked-out request
//! but never interrupts it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};
use datagrid_proto::member::MemberInfo;

use crate::clock::SharedClock;

/// Decides whether a member still needs a connection.
pub type InclusionPredicate = Box<dyn Fn(&MemberInfo) -> bool + Send + Sync>;

struct QueuedRequest {
    member: MemberInfo,
    /// Not offered before this instant (set for retried requests).
    not_before: Option<Instant>,
}

struct QueueState {
    items: VecDeque<QueuedRequest>,
    suspended: bool,
    disposed: bool,
    enumerated: bool,
    /// Member of the checked-out request.
    in_flight: Option<Uuid>,
    /// The checked-out member was removed while in flight.
    in_flight_removed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled on add, completion, resume, and dispose.
    changed: Notify,
    retry_delay: Duration,
    include: InclusionPredicate,
    clock: SharedClock,
}

/// Queue of member connection requests.
#[derive(Clone)]
pub struct MemberConnectionQueue {
    shared: Arc<Shared>,
}

impl MemberConnectionQueue {
    /// Create a suspended queue.
    pub fn new(retry_delay: Duration, clock: SharedClock, include: InclusionPredicate) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    suspended: true,
                    disposed: false,
                    enumerated: false,
                    in_flight: None,
                    in_flight_removed: false,
                }),
                changed: Notify::new(),
                retry_delay,
                include,
                clock,
            }),
        }
    }

    /// Queue a connection request for `member`.
    ///
    /// Silently ignored when the queue is disposed, the predicate rejects
    /// the member, or a request for it is already queued.
    pub fn add(&self, member: MemberInfo) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed || !(self.shared.include)(&member) {
                return;
            }
            if state.items.iter().any(|r| r.member.id == member.id) {
                return;
            }
            debug!("connection queue: add {}", member);
            state.items.push_back(QueuedRequest {
                member,
                not_before: None,
            });
        }
        self.shared.changed.notify_waiters();
    }

    /// Drop pending requests for a member that left the cluster.
    pub fn remove(&self, member_id: &Uuid) {
        let mut state = self.shared.state.lock();
        state.items.retain(|r| &r.member.id != member_id);
        if state.in_flight.as_ref() == Some(member_id) {
            state.in_flight_removed = true;
        }
    }

    /// Number of queued requests, excluding the checked-out one.
    pub fn count(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Take the exclusive enumerator.
    ///
    /// `shutdown` ends the enumeration cleanly once it flips to `true` (or
    /// its sender is dropped).
    pub fn requests(&self, shutdown: watch::Receiver<bool>) -> ClientResult<ConnectionRequests> {
        let mut state = self.shared.state.lock();
        if state.enumerated {
            return Err(ClientError::QueueAlreadyEnumerated);
        }
        state.enumerated = true;
        Ok(ConnectionRequests {
            shared: self.shared.clone(),
            shutdown,
        })
    }

    /// Stop handing out requests. Resolves once no request is checked out.
    pub async fn suspend(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                state.suspended = true;
                if state.in_flight.is_none() || state.disposed {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Resume handing out requests. With `drain`, every queued request is
    /// failed first, without ever being offered to the consumer.
    pub fn resume(&self, drain: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            if drain {
                for request in state.items.drain(..) {
                    debug!("connection queue: drained {}", request.member);
                }
            }
            state.suspended = false;
        }
        self.shared.changed.notify_waiters();
    }

    /// Close the queue for good and release any waiting consumer.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.items.clear();
        }
        debug!("connection queue: disposed");
        self.shared.changed.notify_waiters();
    }
}

/// The exclusive consumer side of a [`MemberConnectionQueue`].
pub struct ConnectionRequests {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionRequests {
    /// Wait for the next request.
    ///
    /// Returns `Ok(None)` when the queue is disposed or shutdown is
    /// requested, and fails if the previous request was not completed yet.
    pub async fn next(&mut self) -> ClientResult<Option<MemberConnectionRequest>> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.shared.state.lock();
                if state.disposed || *self.shutdown.borrow() {
                    return Ok(None);
                }
                if state.in_flight.is_some() {
                    return Err(ClientError::RequestNotCompleted);
                }

                if state.suspended {
                    None
                } else {
                    let now = self.shared.clock.now();
                    let ready = state
                        .items
                        .iter()
                        .position(|r| r.not_before.map_or(true, |t| t <= now));
                    if let Some(request) = ready.and_then(|pos| state.items.remove(pos)) {
                        state.in_flight = Some(request.member.id);
                        state.in_flight_removed = false;
                        return Ok(Some(MemberConnectionRequest {
                            member: request.member,
                            shared: self.shared.clone(),
                            completed: false,
                        }));
                    }
                    state.items.iter().filter_map(|r| r.not_before).min()
                }
            };

            let delay = wake_at.map(|t| t.saturating_duration_since(self.shared.clock.now()));
            tokio::select! {
                _ = &mut notified => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                _ = self.shared.clock.sleep(delay.unwrap_or_default()), if delay.is_some() => {}
            }
        }
    }
}

impl Drop for ConnectionRequests {
    fn drop(&mut self) {
        self.shared.state.lock().enumerated = false;
    }
}

/// A checked-out connection request.
///
/// Dropping it without calling [`complete`](Self::complete) counts as a
/// failed attempt.
pub struct MemberConnectionRequest {
    member: MemberInfo,
    shared: Arc<Shared>,
    completed: bool,
}

impl MemberConnectionRequest {
    pub fn member(&self) -> &MemberInfo {
        &self.member
    }

    /// Complete the request. A failed request is offered again after the
    /// queue's fixed retry delay, if the member still needs a connection.
    pub fn complete(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;

        {
            let mut state = self.shared.state.lock();
            let removed = state.in_flight_removed;
            state.in_flight = None;
            state.in_flight_removed = false;

            if !success && !removed && !state.disposed && (self.shared.include)(&self.member) {
                let not_before = self.shared.clock.now() + self.shared.retry_delay;
                debug!(
                    "connection queue: retry {} in {:?}",
                    self.member, self.shared.retry_delay
                );
                state.items.push_back(QueuedRequest {
                    member: self.member.clone(),
                    not_before: Some(not_before),
                });
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl Drop for MemberConnectionRequest {
    fn drop(&mut self) {
        self.finish(false);
    }
}
