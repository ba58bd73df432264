use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::protocol::{DecodedMessage, InboundEvent};
use crate::subscription::ChannelSubscription;

/// Lifecycle of the connection behind one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    AwaitingSocketId,
    Authorizing,
    Subscribing,
    Subscribed,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::AwaitingSocketId => "awaiting_socket_id",
            ConnectionStatus::Authorizing => "authorizing",
            ConnectionStatus::Subscribing => "subscribing",
            ConnectionStatus::Subscribed => "subscribed",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// `pusher:error` codes that mean the server has given up on this socket,
/// e.g. 4009 "connection is unauthorized".
const REJECTION_CODES: std::ops::RangeInclusive<u16> = 4000..=4999;

/// Identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket(u64);

impl SessionTicket {
    pub fn generation(self) -> u64 {
        self.0
    }
}

/// Arena of one: only the most recently issued ticket is current, and none
/// is once the arena is closed. Continuations compare their captured ticket
/// before touching shared state.
#[derive(Debug, Default)]
pub struct SessionArena {
    current: AtomicU64,
    closed: AtomicBool,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh ticket, invalidating the previous one.
    pub fn begin(&self) -> Option<SessionTicket> {
        if self.is_closed() {
            return None;
        }
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_closed() {
            return None;
        }
        Some(SessionTicket(generation))
    }

    pub fn is_current(&self, ticket: SessionTicket) -> bool {
        !self.is_closed() && self.current.load(Ordering::SeqCst) == ticket.0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns `false` if the arena was already closed.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.current.fetch_add(1, Ordering::SeqCst);
        first
    }
}

/// What the driver must do in response to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    SendPong,
    Authorize { socket_id: String },
    Deliver(DecodedMessage),
    SubscriptionConfirmed,
    ServerError { code: Option<u16>, message: String },
    /// The server refused this connection; the session must end.
    Rejected { code: u16, message: String },
    Ignore { reason: &'static str },
}

/// Per-socket protocol state. Pure: the driver feeds it events and performs
/// the returned [`Reaction`]s.
#[derive(Debug)]
pub struct ConnectionSession {
    ticket: SessionTicket,
    status: ConnectionStatus,
    socket_id: Option<String>,
    activity_timeout: Option<Duration>,
}

impl ConnectionSession {
    pub fn new(ticket: SessionTicket) -> Self {
        Self {
            ticket,
            status: ConnectionStatus::Connecting,
            socket_id: None,
            activity_timeout: None,
        }
    }

    pub fn ticket(&self) -> SessionTicket {
        self.ticket
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    /// Server-advertised activity timeout, once known.
    pub fn activity_timeout(&self) -> Option<Duration> {
        self.activity_timeout
    }

    pub fn socket_opened(&mut self) {
        if self.status == ConnectionStatus::Connecting {
            self.status = ConnectionStatus::AwaitingSocketId;
        }
    }

    pub fn grant_received(&mut self) {
        if self.status == ConnectionStatus::Authorizing {
            self.status = ConnectionStatus::Subscribing;
        }
    }

    pub fn subscribe_sent(&mut self) {
        if self.status == ConnectionStatus::Subscribing {
            self.status = ConnectionStatus::Subscribed;
        }
    }

    pub fn react(&mut self, event: InboundEvent, subscription: &ChannelSubscription) -> Reaction {
        match event {
            InboundEvent::Ping => Reaction::SendPong,
            InboundEvent::ConnectionEstablished(established) => {
                if self.status != ConnectionStatus::AwaitingSocketId {
                    return Reaction::Ignore {
                        reason: "duplicate connection_established",
                    };
                }
                self.activity_timeout = established.activity_timeout.map(Duration::from_secs);
                self.socket_id = Some(established.socket_id.clone());
                self.status = ConnectionStatus::Authorizing;
                Reaction::Authorize {
                    socket_id: established.socket_id,
                }
            }
            InboundEvent::MessageSent { channel, message } => {
                if self.status != ConnectionStatus::Subscribed {
                    Reaction::Ignore {
                        reason: "message before subscription",
                    }
                } else if !subscription.owns(channel.as_deref()) {
                    Reaction::Ignore {
                        reason: "message for another channel",
                    }
                } else {
                    Reaction::Deliver(message)
                }
            }
            InboundEvent::SubscriptionSucceeded { channel } => {
                if subscription.owns(channel.as_deref()) {
                    Reaction::SubscriptionConfirmed
                } else {
                    Reaction::Ignore {
                        reason: "confirmation for another channel",
                    }
                }
            }
            InboundEvent::ServerError {
                code: Some(code),
                message,
            } if REJECTION_CODES.contains(&code) => Reaction::Rejected { code, message },
            InboundEvent::ServerError { code, message } => Reaction::ServerError { code, message },
            InboundEvent::Pong => Reaction::Ignore { reason: "pong" },
            InboundEvent::Unrecognized { .. } => Reaction::Ignore {
                reason: "unrecognized event",
            },
        }
    }
}
