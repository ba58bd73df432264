use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tokio::sync::watch;

use crate::protocol::DecodedMessage;
use crate::session::{ConnectionStatus, SessionArena, SessionTicket};

pub(crate) type MessageHandler = Arc<dyn Fn(&DecodedMessage) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, MessageHandler)>,
}

/// Shared between a subscription handle and its driver task.
///
/// Delivery, status publication and close all take the same re-entrant lock,
/// so once [`Dispatcher::close`] returns nothing is mid-delivery and every
/// later call sees the closed arena. Re-entrancy lets a handler close its own
/// subscription.
pub(crate) struct Dispatcher {
    arena: SessionArena,
    registry: ReentrantMutex<RefCell<Registry>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            arena: SessionArena::new(),
            registry: ReentrantMutex::new(RefCell::new(Registry::default())),
            status,
        }
    }

    pub(crate) fn arena(&self) -> &SessionArena {
        &self.arena
    }

    pub(crate) fn register(&self, handler: MessageHandler) -> Option<u64> {
        let guard = self.registry.lock();
        if self.arena.is_closed() {
            return None;
        }
        let mut registry = guard.borrow_mut();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, handler));
        Some(id)
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        let before = registry.handlers.len();
        registry.handlers.retain(|(existing, _)| *existing != id);
        registry.handlers.len() != before
    }

    pub(crate) fn is_registered(&self, id: u64) -> bool {
        let guard = self.registry.lock();
        if self.arena.is_closed() {
            return false;
        }
        let registered = guard.borrow().handlers.iter().any(|(existing, _)| *existing == id);
        registered
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.registry.lock().borrow().handlers.len()
    }

    /// Invokes every handler for `message` unless `ticket` went stale.
    /// Returns the number of handlers called.
    pub(crate) fn deliver(&self, ticket: SessionTicket, message: &DecodedMessage) -> usize {
        let guard = self.registry.lock();
        if !self.arena.is_current(ticket) {
            return 0;
        }
        let snapshot: Vec<MessageHandler> = guard
            .borrow()
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        let mut invoked = 0;
        for handler in snapshot {
            if !self.arena.is_current(ticket) {
                break;
            }
            handler(message);
            invoked += 1;
        }
        invoked
    }

    /// Publishes `status` on behalf of `ticket`; stale tickets are ignored.
    pub(crate) fn publish(&self, ticket: SessionTicket, status: ConnectionStatus) -> bool {
        let _guard = self.registry.lock();
        if !self.arena.is_current(ticket) {
            return false;
        }
        self.set_status(status);
        true
    }

    pub(crate) fn close(&self) -> bool {
        let guard = self.registry.lock();
        let first = self.arena.close();
        guard.borrow_mut().handlers.clear();
        self.set_status(ConnectionStatus::Closed);
        first
    }

    pub(crate) fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageAuthor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn message(id: &str) -> DecodedMessage {
        DecodedMessage {
            id: id.into(),
            text: format!("text {id}"),
            user: MessageAuthor {
                id: "u".into(),
                first_name: "F".into(),
                last_name: "L".into(),
            },
            thread_id: "g".into(),
        }
    }

    #[test]
    fn delivers_in_order_to_every_handler() {
        let dispatcher = Dispatcher::new();
        let ticket = dispatcher.arena().begin().unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b"] {
            let seen = Arc::clone(&seen);
            dispatcher.register(Arc::new(move |msg: &DecodedMessage| {
                seen.lock().unwrap().push(format!("{label}:{}", msg.id));
            }));
        }

        assert_eq!(dispatcher.deliver(ticket, &message("1")), 2);
        assert_eq!(dispatcher.deliver(ticket, &message("2")), 2);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["a:1", "b:1", "a:2", "b:2"]
        );
    }

    #[test]
    fn identical_message_is_delivered_each_time() {
        let dispatcher = Dispatcher::new();
        let ticket = dispatcher.arena().begin().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        dispatcher.register(Arc::new(move |_: &DecodedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let msg = message("same");
        dispatcher.deliver(ticket, &msg);
        dispatcher.deliver(ticket, &msg);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_ticket_delivers_nothing() {
        let dispatcher = Dispatcher::new();
        let old = dispatcher.arena().begin().unwrap();
        let _new = dispatcher.arena().begin().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        dispatcher.register(Arc::new(move |_: &DecodedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(dispatcher.deliver(old, &message("1")), 0);
        assert!(!dispatcher.publish(old, ConnectionStatus::Subscribed));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_closing_mid_delivery_stops_the_rest() {
        let dispatcher = Arc::new(Dispatcher::new());
        let ticket = dispatcher.arena().begin().unwrap();
        let later = Arc::new(AtomicUsize::new(0));

        let closer = Arc::clone(&dispatcher);
        dispatcher.register(Arc::new(move |_: &DecodedMessage| {
            closer.close();
        }));
        let counter = Arc::clone(&later);
        dispatcher.register(Arc::new(move |_: &DecodedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(dispatcher.deliver(ticket, &message("1")), 1);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.current_status(), ConnectionStatus::Closed);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn close_is_terminal_for_status_and_registration() {
        let dispatcher = Dispatcher::new();
        let ticket = dispatcher.arena().begin().unwrap();
        assert!(dispatcher.publish(ticket, ConnectionStatus::Subscribed));
        let id = dispatcher
            .register(Arc::new(|_: &DecodedMessage| {}))
            .unwrap();
        assert!(dispatcher.close());
        assert!(!dispatcher.close());
        assert!(!dispatcher.is_registered(id));
        assert!(!dispatcher.publish(ticket, ConnectionStatus::Reconnecting));
        assert_eq!(dispatcher.current_status(), ConnectionStatus::Closed);
        assert!(dispatcher
            .register(Arc::new(|_: &DecodedMessage| {}))
            .is_none());
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let dispatcher = Dispatcher::new();
        let ticket = dispatcher.arena().begin().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let first = {
            let count = Arc::clone(&count);
            dispatcher
                .register(Arc::new(move |_: &DecodedMessage| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap()
        };
        let count_b = Arc::clone(&count);
        dispatcher.register(Arc::new(move |_: &DecodedMessage| {
            count_b.fetch_add(10, Ordering::SeqCst);
        }));

        assert!(dispatcher.is_registered(first));
        assert!(dispatcher.unregister(first));
        assert!(!dispatcher.unregister(first));
        assert!(!dispatcher.is_registered(first));
        dispatcher.deliver(ticket, &message("1"));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
