//! Realtime channel client: subscribes to one private message group on a
//! Pusher-protocol server (Laravel Reverb) and hands decoded messages to the
//! application.
//!
//! Responsibilities:
//! - opening the socket and waiting for the server-assigned socket id
//! - authorizing `private-message-group.{id}` against the backend
//! - answering keep-alive pings and detecting a silent server
//! - reconnecting after a fixed delay, with stale sessions unable to act
//! - guaranteeing no handler runs once a subscription is closed

pub mod auth;
pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod protocol;
pub mod session;
pub mod subscription;

pub use auth::{
    AuthRequest, ChannelAuthGrant, ChannelAuthorizer, CredentialProvider, HttpChannelAuthorizer,
    SharedToken, StaticToken,
};
pub use client::{ChannelSubscriptionHandle, HandlerRegistration, RealtimeChannelClient};
pub use config::{ClientConfig, Scheme};
pub use error::{AuthError, ChannelError, ConfigError, ProtocolError, SessionError};
pub use protocol::{DecodedMessage, MessageAuthor};
pub use session::ConnectionStatus;
pub use subscription::ChannelSubscription;
