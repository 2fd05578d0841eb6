//! One actor per authenticated WebSocket.
//!
//! The socket is split in two. A writer task owns the sink: it serializes
//! every [`OutboundEvent`] queued on the connection's handle, sends periodic
//! pings and forwards control frames. The reader loop owns the stream and
//! handles client events strictly one at a time, awaiting each before it
//! reads the next frame.

use std::ops::ControlFlow;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use parley_shared::{ClientEvent, ErrorCode, OutboundEvent, UserId};

use crate::api::AppState;
use crate::auth::AuthError;
use crate::dispatcher::Dispatched;
use crate::error::RouterError;
use crate::registry::ConnectionHandle;

/// Credential expired, on connect or on reauthentication.
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
/// Credential invalid, or it names a different user than the session's.
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long cleanup waits for the writer to flush queued events.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn close_code_for(err: AuthError) -> u16 {
    match err {
        AuthError::Expired => CLOSE_TOKEN_EXPIRED,
        AuthError::Invalid | AuthError::Signing => CLOSE_TOKEN_INVALID,
    }
}

/// Close a freshly upgraded socket that failed authentication.
pub async fn reject(mut socket: WebSocket, err: AuthError) {
    let frame = CloseFrame {
        code: close_code_for(err),
        reason: err.to_string().into(),
    };
    let _ = socket.send(WsMessage::Close(Some(frame))).await;
}

/// Drive an authenticated connection until it closes.
pub async fn run_session(socket: WebSocket, state: AppState, user: UserId) {
    let (sink, mut stream) = socket.split();
    let (handle, events) = ConnectionHandle::new();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = handle.id();

    let registry = state.dispatcher.registry().clone();
    let channels = state.dispatcher.channels().clone();

    let writer = tokio::spawn(writer_task(
        sink,
        events,
        control_rx,
        state.config.ping_interval,
    ));

    registry.register(user, handle.clone()).await;
    registry.announce_presence().await;

    info!(user = %user, connection = %conn, "Session started");

    let idle = state.config.idle_timeout();
    loop {
        let frame = match timeout(idle, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                warn!(user = %user, connection = %conn, error = %e, "WebSocket receive error");
                break;
            }
            Ok(None) => {
                debug!(user = %user, connection = %conn, "WebSocket stream ended");
                break;
            }
            Err(_) => {
                info!(user = %user, connection = %conn, "Idle timeout, closing");
                let _ = control_tx.send(close_frame(CLOSE_GOING_AWAY, "idle timeout"));
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => {
                let flow = match ClientEvent::decode(text.as_str()) {
                    Ok(event) => handle_event(&state, &handle, user, event).await,
                    Err(e) => {
                        debug!(user = %user, error = %e, "Malformed frame");
                        handle.send(OutboundEvent::error(ErrorCode::BadRequest, e.to_string()));
                        ControlFlow::Continue(())
                    }
                };
                if let ControlFlow::Break(close) = flow {
                    let _ = control_tx.send(close);
                    break;
                }
            }
            WsMessage::Binary(_) => {
                handle.send(OutboundEvent::error(
                    ErrorCode::BadRequest,
                    "binary frames are not supported",
                ));
            }
            WsMessage::Close(frame) => {
                debug!(user = %user, connection = %conn, reason = ?frame, "Client initiated close");
                break;
            }
            // Pings are answered by the protocol layer; pongs only reset the idle timer.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    let rooms_left = channels.disconnect(conn).await;
    if registry.unregister(conn).await.is_some() {
        registry.announce_presence().await;
    }

    drop(handle);
    drop(control_tx);
    match timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(_) => {}
        Err(_) => warn!(user = %user, connection = %conn, "Writer did not drain in time"),
    }

    info!(user = %user, connection = %conn, rooms_left, "Session closed");
}

/// Handle one client event. `Break` carries the close frame to send.
async fn handle_event(
    state: &AppState,
    handle: &ConnectionHandle,
    user: UserId,
    event: ClientEvent,
) -> ControlFlow<WsMessage> {
    let dispatcher = &state.dispatcher;
    let friends = &state.friends;

    let result: Result<(), RouterError> = match event {
        ClientEvent::SendDirect { .. } | ClientEvent::SendGroup { .. } | ClientEvent::Message { .. } => {
            match event.into_draft(user) {
                Some(draft) => dispatcher.send_message(draft).await.map(|sent| {
                    handle.send(ack(&sent));
                }),
                None => Ok(()),
            }
        }
        ClientEvent::Typing { recipient_id } => {
            dispatcher.typing(user, recipient_id, true).await;
            Ok(())
        }
        ClientEvent::StopTyping { recipient_id } => {
            dispatcher.typing(user, recipient_id, false).await;
            Ok(())
        }
        ClientEvent::Unsend { message_id } => dispatcher
            .unsend(message_id)
            .await
            .map(|done| echo_direct_notice(handle, &done, OutboundEvent::UnsendNotice)),
        ClientEvent::Delete { message_id } => dispatcher
            .delete(message_id)
            .await
            .map(|done| echo_direct_notice(handle, &done, OutboundEvent::DeleteNotice)),
        ClientEvent::Join { room_id } => {
            dispatcher.channels().join(handle, room_id).await;
            Ok(())
        }
        ClientEvent::Leave { room_id } => {
            dispatcher.channels().leave(handle.id(), room_id).await;
            Ok(())
        }
        ClientEvent::SendFriendRequest { receiver_id } => friends
            .send_request(user, receiver_id)
            .await
            .map(|edge| {
                handle.send(OutboundEvent::FriendRequestSent(edge));
            }),
        ClientEvent::AcceptFriendRequest { sender_id } => {
            friends.accept_request(sender_id, user).await.map(|_| ())
        }
        ClientEvent::ListPendingRequests => friends.pending_for(user).await.map(|edges| {
            handle.send(OutboundEvent::PendingRequests(edges));
        }),
        ClientEvent::ListFriends => friends.friends_of(user).await.map(|edges| {
            handle.send(OutboundEvent::Friends(edges));
        }),
        ClientEvent::Reauthenticate { token } => {
            return reauthenticate(state, handle, user, &token);
        }
    };

    if let Err(e) = result {
        debug!(user = %user, code = %e.code(), error = %e, "Event rejected");
        handle.send(OutboundEvent::error(e.code(), e.to_string()));
    }
    ControlFlow::Continue(())
}

fn reauthenticate(
    state: &AppState,
    handle: &ConnectionHandle,
    user: UserId,
    token: &str,
) -> ControlFlow<WsMessage> {
    let err = match state.verifier.verify(token) {
        Ok(verified) if verified == user => {
            debug!(user = %user, "Session reauthenticated");
            return ControlFlow::Continue(());
        }
        Ok(other) => {
            warn!(user = %user, token_user = %other, "Reauthentication for a different user");
            AuthError::Invalid
        }
        Err(e) => e,
    };

    handle.send(OutboundEvent::error(ErrorCode::InvalidCredential, err.to_string()));
    ControlFlow::Break(close_frame(close_code_for(err), "reauthentication failed"))
}

/// `delivered` follows [`Delivery::reached_anyone`]: for a room message the
/// author's own joined connection counts as a recipient.
///
/// [`Delivery::reached_anyone`]: crate::dispatcher::Delivery::reached_anyone
fn ack(sent: &Dispatched) -> OutboundEvent {
    OutboundEvent::Ack {
        message_id: sent.message.id,
        delivered: sent.delivery.reached_anyone(),
    }
}

/// Room notices already reach the author through the broadcast; a direct
/// notice only reaches the recipient, so the author gets a copy.
fn echo_direct_notice(
    handle: &ConnectionHandle,
    done: &Dispatched,
    notice: fn(parley_shared::Message) -> OutboundEvent,
) {
    if done.message.room_id.is_none() {
        handle.send(notice(done.message.clone()));
    }
}

fn close_frame(code: u16, reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Owns the sink. Exits once every handle clone is dropped and the queue is
/// drained, after a close frame, or when the socket fails.
///
/// Queued events always go out before a close frame, so an error raised by
/// the event that ends the session reaches the client.
async fn writer_task(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut events: mpsc::UnboundedReceiver<OutboundEvent>,
    mut control: mpsc::UnboundedReceiver<WsMessage>,
    ping_interval: Duration,
) {
    let mut ping = interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(close_frame(CLOSE_NORMAL, "")).await;
                    break;
                };
                if !write_event(&mut sink, &event).await {
                    break;
                }
            }
            Some(frame) = control.recv() => {
                let closing = matches!(frame, WsMessage::Close(_));
                if closing {
                    while let Ok(event) = events.try_recv() {
                        if !write_event(&mut sink, &event).await {
                            break;
                        }
                    }
                }
                if sink.send(frame).await.is_err() || closing {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Encode and send one event. Returns `false` once the socket is gone; an
/// event that fails to encode is logged and skipped.
async fn write_event(sink: &mut SplitSink<WebSocket, WsMessage>, event: &OutboundEvent) -> bool {
    let text = match event.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode event");
            return true;
        }
    };
    sink.send(WsMessage::Text(text.into())).await.is_ok()
}
