use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::{AuthRequest, ChannelAuthorizer, CredentialProvider, HttpChannelAuthorizer};
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::error::{AuthError, ChannelError, ProtocolError, SessionError};
use crate::protocol::{DecodedMessage, FrameDecoder, InboundEvent, OutboundFrame};
use crate::session::{ConnectionSession, ConnectionStatus, Reaction};
use crate::subscription::ChannelSubscription;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens private-channel subscriptions against a Pusher-protocol server.
///
/// Cheap to clone; every [`ChannelSubscriptionHandle`] it opens owns its own
/// socket and driver task.
#[derive(Clone)]
pub struct RealtimeChannelClient {
    config: Arc<ClientConfig>,
    websocket_url: Url,
    decoder: FrameDecoder,
    authorizer: Arc<dyn ChannelAuthorizer>,
}

impl RealtimeChannelClient {
    /// Builds a client that authorizes channels over HTTP at
    /// `config.auth_endpoint`.
    pub fn new(config: ClientConfig) -> Result<Self, ChannelError> {
        let config = config.validated()?;
        let authorizer = HttpChannelAuthorizer::new(config.auth_url()?, config.auth_timeout())?;
        Self::with_authorizer(config, Arc::new(authorizer))
    }

    pub fn with_authorizer(
        config: ClientConfig,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> Result<Self, ChannelError> {
        let websocket_url = config.websocket_url()?;
        let decoder = FrameDecoder::new(config.message_event.clone());
        Ok(Self {
            config: Arc::new(config),
            websocket_url,
            decoder,
            authorizer,
        })
    }

    /// Starts the handshake for `group_id` in the background and returns
    /// immediately. Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        group_id: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<ChannelSubscriptionHandle, ChannelError> {
        let subscription = ChannelSubscription::new(group_id)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let dispatcher = Arc::new(Dispatcher::new());
        let cancel = CancellationToken::new();

        let driver = ConnectionDriver {
            config: Arc::clone(&self.config),
            url: self.websocket_url.clone(),
            decoder: self.decoder.clone(),
            subscription: subscription.clone(),
            authorizer: Arc::clone(&self.authorizer),
            credentials,
            dispatcher: Arc::clone(&dispatcher),
            cancel: cancel.clone(),
        };
        info!(
            target = "realtime.channel",
            group_id = %subscription.group_id(),
            channel = %subscription.channel_name(),
            "opening realtime subscription"
        );
        let task = runtime.spawn(driver.run());

        Ok(ChannelSubscriptionHandle {
            subscription,
            dispatcher,
            cancel,
            task: Some(task),
        })
    }
}

/// A live subscription to one message group. Dropping it closes it.
pub struct ChannelSubscriptionHandle {
    subscription: ChannelSubscription,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChannelSubscriptionHandle {
    pub fn group_id(&self) -> &str {
        self.subscription.group_id()
    }

    pub fn channel_name(&self) -> &str {
        self.subscription.channel_name()
    }

    /// Registers `handler` for every decoded message, called in arrival
    /// order from the subscription's driver task.
    pub fn on_message<F>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(&DecodedMessage) + Send + Sync + 'static,
    {
        let id = self.dispatcher.register(Arc::new(handler));
        HandlerRegistration {
            id,
            dispatcher: Arc::downgrade(&self.dispatcher),
        }
    }

    /// Channel-backed alternative to [`Self::on_message`]. The receiver ends
    /// once the subscription is closed.
    pub fn messages(&self) -> mpsc::UnboundedReceiver<DecodedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _registration = self.on_message(move |message: &DecodedMessage| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    pub fn handler_count(&self) -> usize {
        self.dispatcher.handler_count()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.dispatcher.status()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.dispatcher.current_status()
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.arena().is_closed()
    }

    /// Idempotent. No handler runs once this returns; the socket is released
    /// by the driver task shortly after.
    pub fn close(&self) {
        if self.dispatcher.close() {
            info!(
                target = "realtime.channel",
                group_id = %self.subscription.group_id(),
                "closing realtime subscription"
            );
        }
        self.cancel.cancel();
    }

    /// Closes and waits for the driver task to release the socket.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChannelSubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returned by [`ChannelSubscriptionHandle::on_message`].
pub struct HandlerRegistration {
    id: Option<u64>,
    dispatcher: Weak<Dispatcher>,
}

impl HandlerRegistration {
    /// `false` once the handler was removed or the subscription closed.
    pub fn is_active(&self) -> bool {
        match (self.id, self.dispatcher.upgrade()) {
            (Some(id), Some(dispatcher)) => dispatcher.is_registered(id),
            _ => false,
        }
    }

    pub fn remove(self) -> bool {
        match (self.id, self.dispatcher.upgrade()) {
            (Some(id), Some(dispatcher)) => dispatcher.unregister(id),
            _ => false,
        }
    }
}

enum SessionEnd {
    Cancelled,
    Failed(SessionError),
}

impl From<SessionError> for SessionEnd {
    fn from(err: SessionError) -> Self {
        SessionEnd::Failed(err)
    }
}

impl From<AuthError> for SessionEnd {
    fn from(err: AuthError) -> Self {
        SessionEnd::Failed(SessionError::Auth(err))
    }
}

impl From<ProtocolError> for SessionEnd {
    fn from(err: ProtocolError) -> Self {
        SessionEnd::Failed(SessionError::Protocol(err))
    }
}

enum Incoming {
    Text(String),
    Control,
}

fn read_frame(frame: Option<Result<Message, WsError>>) -> Result<Incoming, SessionError> {
    match frame {
        Some(Ok(Message::Text(text))) => Ok(Incoming::Text(text)),
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
            Ok(text) => Ok(Incoming::Text(text)),
            Err(err) => {
                warn!(target = "realtime.channel", error = %err, "dropping non-utf8 binary frame");
                Ok(Incoming::Control)
            }
        },
        Some(Ok(Message::Close(frame))) => Err(SessionError::ClosedByServer {
            code: frame.as_ref().map(|f| u16::from(f.code)),
            reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
        }),
        Some(Ok(_)) => Ok(Incoming::Control),
        Some(Err(err)) => Err(SessionError::Socket(err)),
        None => Err(SessionError::StreamEnded),
    }
}

/// Owns every connection attempt for one subscription. Frames from a socket
/// are handled one at a time; nothing else touches the socket.
struct ConnectionDriver {
    config: Arc<ClientConfig>,
    url: Url,
    decoder: FrameDecoder,
    subscription: ChannelSubscription,
    authorizer: Arc<dyn ChannelAuthorizer>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    async fn run(self) {
        while let Some(ticket) = self.dispatcher.arena().begin() {
            let mut session = ConnectionSession::new(ticket);
            self.dispatcher.publish(ticket, ConnectionStatus::Connecting);
            debug!(
                target = "realtime.channel",
                group_id = %self.subscription.group_id(),
                generation = ticket.generation(),
                url = %self.url,
                "connecting realtime socket"
            );

            let err = match self.run_session(&mut session).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(err) => err,
            };
            if !self.dispatcher.publish(ticket, ConnectionStatus::Reconnecting) {
                break;
            }
            warn!(
                target = "realtime.channel",
                group_id = %self.subscription.group_id(),
                generation = ticket.generation(),
                socket_id = session.socket_id().unwrap_or("-"),
                error = %err,
                delay_ms = self.config.reconnect_delay_ms,
                "realtime session lost; scheduling reconnect"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.reconnect_delay()) => {}
            }
        }
        debug!(
            target = "realtime.channel",
            group_id = %self.subscription.group_id(),
            "realtime driver stopped"
        );
    }

    async fn run_session(&self, session: &mut ConnectionSession) -> SessionEnd {
        let socket = match self.connect().await {
            Ok(socket) => socket,
            Err(end) => return end,
        };
        let (mut sink, mut stream) = socket.split();
        let end = self.drive(session, &mut sink, &mut stream).await;
        self.release(&mut sink, session).await;
        end
    }

    async fn connect(&self) -> Result<Socket, SessionEnd> {
        let timeout = self.config.connect_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
            result = tokio::time::timeout(timeout, connect_async(self.url.as_str())) => match result {
                Ok(Ok((socket, _))) => Ok(socket),
                Ok(Err(err)) => Err(SessionError::Connect(err).into()),
                Err(_) => Err(SessionError::ConnectTimeout(timeout).into()),
            },
        }
    }

    async fn drive(
        &self,
        session: &mut ConnectionSession,
        sink: &mut SocketSink,
        stream: &mut SocketStream,
    ) -> SessionEnd {
        session.socket_opened();
        self.dispatcher.publish(session.ticket(), session.status());
        debug!(
            target = "realtime.channel",
            generation = session.ticket().generation(),
            "socket opened; awaiting socket id"
        );

        let mut awaiting_pong = false;
        let idle = sleep(self.activity_window(session));
        tokio::pin!(idle);

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
                frame = stream.next() => match read_frame(frame) {
                    Ok(incoming) => {
                        awaiting_pong = false;
                        match incoming {
                            Incoming::Text(text) => self.handle_text(session, sink, stream, &text).await,
                            Incoming::Control => Ok(()),
                        }
                    }
                    Err(err) => Err(err.into()),
                },
                _ = &mut idle => {
                    if awaiting_pong {
                        Err(SessionError::Unresponsive.into())
                    } else {
                        awaiting_pong = true;
                        debug!(target = "realtime.channel", "socket idle; sending keep-alive ping");
                        self.send(sink, &OutboundFrame::Ping).await
                    }
                }
            };
            if let Err(end) = step {
                return end;
            }
            let window = if awaiting_pong {
                self.config.pong_timeout()
            } else {
                self.activity_window(session)
            };
            idle.as_mut().reset(Instant::now() + window);
        }
    }

    /// Smaller of the configured and the server-advertised idle windows.
    fn activity_window(&self, session: &ConnectionSession) -> Duration {
        let configured = self.config.activity_timeout();
        session
            .activity_timeout()
            .map_or(configured, |server| server.min(configured))
    }

    async fn handle_text(
        &self,
        session: &mut ConnectionSession,
        sink: &mut SocketSink,
        stream: &mut SocketStream,
        text: &str,
    ) -> Result<(), SessionEnd> {
        trace!(target = "realtime.channel", event = "ws_in", len = text.len());
        let event = match self.decoder.decode(text) {
            Ok(event) => event,
            Err(err) if err.ends_session() => return Err(err.into()),
            Err(err) => {
                warn!(target = "realtime.channel", error = %err, "dropping inbound frame");
                return Ok(());
            }
        };

        match session.react(event, &self.subscription) {
            Reaction::SendPong => self.send(sink, &OutboundFrame::Pong).await,
            Reaction::Authorize { socket_id } => {
                self.authorize_and_subscribe(session, sink, stream, socket_id)
                    .await
            }
            Reaction::Deliver(message) => {
                let handlers = self.dispatcher.deliver(session.ticket(), &message);
                debug!(
                    target = "realtime.channel",
                    message_id = %message.id,
                    handlers,
                    "delivered message"
                );
                Ok(())
            }
            Reaction::SubscriptionConfirmed => {
                debug!(
                    target = "realtime.channel",
                    channel = %self.subscription.channel_name(),
                    "server confirmed subscription"
                );
                Ok(())
            }
            Reaction::Rejected { code, message } => {
                Err(SessionError::Rejected { code, message }.into())
            }
            Reaction::ServerError { code, message } => {
                warn!(
                    target = "realtime.channel",
                    code = ?code,
                    message = %message,
                    "server reported protocol error"
                );
                Ok(())
            }
            Reaction::Ignore { reason } => {
                trace!(target = "realtime.channel", reason, "ignoring frame");
                Ok(())
            }
        }
    }

    async fn authorize_and_subscribe(
        &self,
        session: &mut ConnectionSession,
        sink: &mut SocketSink,
        stream: &mut SocketStream,
        socket_id: String,
    ) -> Result<(), SessionEnd> {
        let ticket = session.ticket();
        self.dispatcher.publish(ticket, session.status());

        let token = self
            .credentials
            .bearer_token()
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let request = AuthRequest {
            socket_id,
            channel_name: self.subscription.channel_name().to_string(),
        };
        debug!(
            target = "realtime.channel",
            socket_id = %request.socket_id,
            channel = %request.channel_name,
            "requesting channel authorization"
        );

        let result = {
            let auth = self.authorizer.authorize(&request, &token);
            tokio::pin!(auth);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SessionEnd::Cancelled),
                    result = &mut auth => break result,
                    frame = stream.next() => {
                        if let Incoming::Text(text) = read_frame(frame)? {
                            self.handle_during_authorization(sink, &text).await?;
                        }
                    }
                }
            }
        };
        // A grant that outlived its session is bound to a dead socket id.
        if !self.dispatcher.arena().is_current(ticket) {
            return Err(SessionEnd::Cancelled);
        }
        let grant = result?;

        session.grant_received();
        self.dispatcher.publish(ticket, session.status());
        self.send(
            sink,
            &OutboundFrame::Subscribe {
                channel: request.channel_name.clone(),
                auth: grant.auth,
                channel_data: grant.channel_data,
            },
        )
        .await?;
        session.subscribe_sent();
        self.dispatcher.publish(ticket, session.status());
        info!(
            target = "realtime.channel",
            socket_id = %request.socket_id,
            channel = %request.channel_name,
            generation = ticket.generation(),
            "subscribed to channel"
        );
        Ok(())
    }

    /// Until the grant arrives only pings matter; the channel is not joined
    /// yet so nothing else can be for us.
    async fn handle_during_authorization(
        &self,
        sink: &mut SocketSink,
        text: &str,
    ) -> Result<(), SessionEnd> {
        match self.decoder.decode(text) {
            Ok(InboundEvent::Ping) => self.send(sink, &OutboundFrame::Pong).await,
            Ok(event) => {
                debug!(
                    target = "realtime.channel",
                    event = ?event,
                    "dropping frame received during authorization"
                );
                Ok(())
            }
            Err(err) => {
                warn!(target = "realtime.channel", error = %err, "dropping inbound frame");
                Ok(())
            }
        }
    }

    async fn send(&self, sink: &mut SocketSink, frame: &OutboundFrame) -> Result<(), SessionEnd> {
        sink.send(Message::Text(frame.to_text()))
            .await
            .map_err(|err| SessionEnd::from(SessionError::Send(err)))
    }

    /// Best-effort goodbye: unsubscribe if we got that far, then a close frame.
    async fn release(&self, sink: &mut SocketSink, session: &ConnectionSession) {
        let channel = self.subscription.channel_name().to_string();
        let subscribed = session.status() == ConnectionStatus::Subscribed;
        let farewell = async {
            if subscribed {
                let frame = OutboundFrame::Unsubscribe { channel };
                let _ = sink.send(Message::Text(frame.to_text())).await;
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(RELEASE_TIMEOUT, farewell).await.is_err() {
            debug!(
                target = "realtime.channel",
                generation = session.ticket().generation(),
                "timed out releasing socket"
            );
        }
    }
}
