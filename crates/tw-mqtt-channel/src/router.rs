//! Routing of inbound MQTT traffic to subscriptions.
//!
//! One `Router` serves every exchange and listener sharing a connection.
//! Each subscribe call gets its own route, so scopes that subscribe the same
//! filter never tear each other down; the broker-side subscription is only
//! dropped when the last route for a filter is removed. A route whose
//! receiver was dropped stops receiving but stays registered until it is
//! removed, so the removal still decides the broker UNSUBSCRIBE.
//!
//! The router also matches SUBACKs to pending subscribe calls. rumqttc does
//! not expose the packet id of a SUBSCRIBE to the caller, so pending
//! confirmations are queued in request order and bound to a packet id when
//! the event loop reports the outgoing SUBSCRIBE.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rumqttc::{Event, Outgoing, Packet, SubAck, SubscribeReasonCode};
use tokio::sync::{mpsc, oneshot};
use tw_protocol::topics::topic_matches;

use crate::channel::{Message, Subscription, SubscriptionHandle};
use crate::error::{MqttError, MqttResult};

type Confirmation = oneshot::Sender<MqttResult<()>>;

struct Route {
    handle: SubscriptionHandle,
    sender: mpsc::UnboundedSender<Message>,
}

struct PendingSubAck {
    ticket: u64,
    filter: String,
    tx: Confirmation,
}

#[derive(Default)]
struct SubAckTracker {
    queued: VecDeque<PendingSubAck>,
    in_flight: HashMap<u16, PendingSubAck>,
}

/// A queued SUBACK confirmation whose SUBSCRIBE may not have reached the
/// client's request queue yet.
///
/// Dropping the ticket before [`SubAckTicket::sent`] withdraws the queued
/// confirmation, so later SUBSCRIBEs keep binding to their own waiters.
#[must_use = "dropping the ticket withdraws the confirmation"]
pub struct SubAckTicket<'a> {
    router: &'a Router,
    ticket: u64,
    sent: bool,
}

impl SubAckTicket<'_> {
    /// The SUBSCRIBE was handed to the client; keep the confirmation queued.
    pub fn sent(mut self) {
        self.sent = true;
    }
}

impl Drop for SubAckTicket<'_> {
    fn drop(&mut self) {
        if !self.sent {
            lock(&self.router.acks)
                .queued
                .retain(|pending| pending.ticket != self.ticket);
        }
    }
}

/// Fan-out of inbound publishes and SUBACK bookkeeping for one connection.
pub struct Router {
    next_id: AtomicU64,
    next_ticket: AtomicU64,
    routes: Mutex<Vec<Route>>,
    acks: Mutex<SubAckTracker>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Router {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            routes: Mutex::new(Vec::new()),
            acks: Mutex::new(SubAckTracker::default()),
        }
    }

    /// Register a new route for `filter` and return its subscription.
    pub fn add(&self, filter: &str) -> Subscription {
        let handle = SubscriptionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            filter: filter.to_string(),
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.routes).push(Route {
            handle: handle.clone(),
            sender,
        });
        Subscription::new(handle, receiver)
    }

    /// Remove a route. Returns `true` when it was the last route for its
    /// filter, i.e. the broker-side subscription should be dropped.
    pub fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let mut routes = lock(&self.routes);
        let Some(index) = routes.iter().position(|r| r.handle.id == handle.id) else {
            return false;
        };
        routes.swap_remove(index);
        !routes.iter().any(|r| r.handle.filter == handle.filter)
    }

    /// Deliver a publish to every open route whose filter matches the topic.
    /// Returns the number of routes it was delivered to.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let routes = lock(&self.routes);
        let mut delivered = 0;

        for route in routes.iter().filter(|r| topic_matches(&r.handle.filter, topic)) {
            let message = Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if route.sender.send(message).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(filter = %route.handle.filter, id = route.handle.id, "skipping closed route");
            }
        }

        if delivered == 0 {
            tracing::debug!(topic, "no subscriber for inbound publish");
        }
        delivered
    }

    /// Filters with at least one registered route, in registration order.
    pub fn active_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for route in lock(&self.routes).iter() {
            if !filters.contains(&route.handle.filter) {
                filters.push(route.handle.filter.clone());
            }
        }
        filters
    }

    // ── SUBACK tracking ───────────────────────────────────────

    /// Queue a confirmation for the next SUBSCRIBE the client sends.
    pub fn expect_suback(&self, filter: &str) -> (SubAckTicket<'_>, oneshot::Receiver<MqttResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock(&self.acks).queued.push_back(PendingSubAck {
            ticket,
            filter: filter.to_string(),
            tx,
        });
        let ticket = SubAckTicket {
            router: self,
            ticket,
            sent: false,
        };
        (ticket, rx)
    }

    /// Feed one event-loop event into the router.
    pub fn handle_event(&self, event: &Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.dispatch(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::SubAck(ack)) => self.confirm(ack),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut acks = lock(&self.acks);
                if let Some(pending) = acks.queued.pop_front() {
                    acks.in_flight.insert(*pkid, pending);
                }
            }
            _ => {}
        }
    }

    /// Fail every subscribe call still waiting for a SUBACK.
    pub fn fail_pending(&self, reason: &str) {
        let pending: Vec<PendingSubAck> = {
            let mut acks = lock(&self.acks);
            let mut pending: Vec<_> = acks.queued.drain(..).collect();
            pending.extend(acks.in_flight.drain().map(|(_, p)| p));
            pending
        };
        for PendingSubAck { filter, tx, .. } in pending {
            let _ = tx.send(Err(MqttError::Connection(format!(
                "subscription to '{filter}' not confirmed: {reason}"
            ))));
        }
    }

    fn confirm(&self, ack: &SubAck) {
        let Some(PendingSubAck { filter, tx, .. }) = lock(&self.acks).in_flight.remove(&ack.pkid) else {
            tracing::debug!(pkid = ack.pkid, "SUBACK without a pending subscribe");
            return;
        };

        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if refused {
            Err(MqttError::Subscribe(format!(
                "broker refused subscription to '{filter}'"
            )))
        } else {
            Ok(())
        };
        // The subscriber may have been cancelled meanwhile.
        let _ = tx.send(result);
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
