//! Message routing: validate, persist, then deliver.
//!
//! Every outgoing message goes through the same three steps in order. A
//! failure at any step stops the cycle, so nothing is ever delivered that was
//! not first persisted, and nothing is persisted that was not first
//! validated. Live delivery is best effort: an offline recipient is a normal
//! outcome and the message stays retrievable through history.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use parley_shared::{
    ErrorCode, Message, MessageDraft, MessageFlag, MessageId, OutboundEvent, RoomId, Target, UserId,
};

use crate::blob_store::BlobStore;
use crate::channels::ChannelManager;
use crate::error::RouterError;
use crate::gateway::PersistenceGateway;
use crate::registry::ConnectionRegistry;

/// Where a persisted message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Delivery {
    /// Number of room connections the message was queued for. The author's
    /// own connection is one of them when it has joined the room.
    Room { recipients: usize },
    /// Whether the recipient was online.
    Direct { delivered: bool },
}

impl Delivery {
    /// Whether any connection was handed the event. A sender alone in a room
    /// it joined still counts, since its own copy was queued.
    pub fn reached_anyone(&self) -> bool {
        match *self {
            Delivery::Room { recipients } => recipients > 0,
            Delivery::Direct { delivered } => delivered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub message: Message,
    pub delivery: Delivery,
}

/// One uploaded file in a multi-attachment submission.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Result of one attachment cycle. Each file succeeds or fails on its own.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentOutcome {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelManager>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelManager>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            registry,
            channels,
            gateway,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    /// Validate, persist and deliver one message.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<Dispatched, RouterError> {
        let sender = draft.sender_id;
        let event = draft.validate().map_err(|e| {
            debug!(sender = %sender, error = %e, "Rejected message draft");
            RouterError::from(e)
        })?;

        let message = self.gateway.create_message(&event).await.map_err(|e| {
            warn!(sender = %sender, error = %e, "Failed to persist message");
            RouterError::from(e)
        })?;

        let delivery = self
            .deliver(event.target, OutboundEvent::Message(message.clone()))
            .await;

        info!(
            message = %message.id,
            sender = %sender,
            ?delivery,
            "Message dispatched"
        );

        Ok(Dispatched { message, delivery })
    }

    /// Forward a typing indicator to a direct recipient. Nothing is stored.
    pub async fn typing(&self, sender: UserId, recipient: UserId, active: bool) -> bool {
        let event = if active {
            OutboundEvent::Typing { sender_id: sender }
        } else {
            OutboundEvent::StopTyping { sender_id: sender }
        };
        self.registry.send_to(recipient, event).await
    }

    /// Retract a message and tell whoever can currently see it.
    pub async fn unsend(&self, id: MessageId) -> Result<Dispatched, RouterError> {
        self.flag_and_notify(id, MessageFlag::Unsend).await
    }

    pub async fn delete(&self, id: MessageId) -> Result<Dispatched, RouterError> {
        self.flag_and_notify(id, MessageFlag::Deleted).await
    }

    pub async fn history_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>, RouterError> {
        Ok(self.gateway.find_messages_between(a, b).await?)
    }

    pub async fn history_in_room(&self, room: RoomId) -> Result<Vec<Message>, RouterError> {
        Ok(self.gateway.find_messages_in_room(room).await?)
    }

    /// Upload each file and send it as its own message, one after another.
    ///
    /// Addressing is checked once up front; nothing is uploaded for a
    /// malformed submission. After that, a failing file does not stop or
    /// undo the others.
    pub async fn send_attachments(
        &self,
        blobs: &BlobStore,
        sender: UserId,
        room_id: Option<RoomId>,
        recipient_id: Option<UserId>,
        files: Vec<Attachment>,
    ) -> Result<Vec<AttachmentOutcome>, RouterError> {
        Target::from_parts(room_id, recipient_id)?;
        if files.is_empty() {
            return Err(RouterError::BadRequest("no files attached".to_string()));
        }

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            let url = match blobs.upload(&file.file_name, &file.bytes).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(sender = %sender, file = %file.file_name, error = %e, "Attachment upload failed");
                    outcomes.push(AttachmentOutcome {
                        file_name: file.file_name,
                        message: None,
                        delivery: None,
                        error: Some(e.code()),
                    });
                    continue;
                }
            };

            let draft = MessageDraft {
                sender_id: sender,
                text: url,
                room_id,
                recipient_id,
            };
            let outcome = match self.send_message(draft).await {
                Ok(Dispatched { message, delivery }) => AttachmentOutcome {
                    file_name: file.file_name,
                    message: Some(message),
                    delivery: Some(delivery),
                    error: None,
                },
                Err(e) => AttachmentOutcome {
                    file_name: file.file_name,
                    message: None,
                    delivery: None,
                    error: Some(e.code()),
                },
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn flag_and_notify(&self, id: MessageId, flag: MessageFlag) -> Result<Dispatched, RouterError> {
        if self.gateway.find_message(id).await?.is_none() {
            return Err(RouterError::MessageNotFound(id));
        }

        let message = match self.gateway.set_message_flag(id, flag).await {
            Ok(message) => message,
            Err(crate::gateway::GatewayError::NotFound) => {
                return Err(RouterError::MessageNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };

        let Some(target) = message.target() else {
            return Err(RouterError::InvalidState(format!(
                "message {id} has no addressing"
            )));
        };

        let notice = match flag {
            MessageFlag::Unsend => OutboundEvent::UnsendNotice(message.clone()),
            MessageFlag::Deleted => OutboundEvent::DeleteNotice(message.clone()),
        };
        let delivery = self.deliver(target, notice).await;

        info!(message = %id, ?flag, ?delivery, "Message flagged");
        Ok(Dispatched { message, delivery })
    }

    async fn deliver(&self, target: Target, event: OutboundEvent) -> Delivery {
        match target {
            Target::Room(room) => Delivery::Room {
                recipients: self.channels.broadcast(room, &event).await,
            },
            Target::User(recipient) => {
                let delivered = self.registry.send_to(recipient, event).await;
                if !delivered {
                    debug!(recipient = %recipient, "Recipient offline, stored only");
                }
                Delivery::Direct { delivered }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::RecordingGateway;
    use crate::registry::ConnectionHandle;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dispatcher: Dispatcher,
        gateway: Arc<RecordingGateway>,
    }

    fn harness() -> Harness {
        let gateway = RecordingGateway::new();
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ChannelManager::new()),
            gateway.clone(),
        );
        Harness {
            dispatcher,
            gateway,
        }
    }

    async fn connect(d: &Dispatcher, user: UserId) -> (ConnectionHandle, UnboundedReceiver<OutboundEvent>) {
        let (handle, rx) = ConnectionHandle::new();
        d.registry().register(user, handle.clone()).await;
        (handle, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_malformed_addressing_touches_nothing() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;

        for (room, recipient) in [(None, None), (Some(RoomId::new()), Some(b))] {
            let draft = MessageDraft {
                sender_id: a,
                text: "hello".to_string(),
                room_id: room,
                recipient_id: recipient,
            };
            let err = h.dispatcher.send_message(draft).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedAddressing);
        }

        assert_eq!(h.gateway.calls(), 0);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_delivers_nothing() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;
        h.gateway.set_failing(true);

        let err = h
            .dispatcher
            .send_message(MessageDraft::direct(a, b, "lost"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::PersistenceFailure);
        assert_eq!(h.gateway.calls(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_direct_to_online_recipient() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;

        let sent = h
            .dispatcher
            .send_message(MessageDraft::direct(a, b, "hi"))
            .await
            .unwrap();
        assert_eq!(sent.delivery, Delivery::Direct { delivered: true });

        match drain(&mut rx_b).as_slice() {
            [OutboundEvent::Message(m)] => assert_eq!(m.id, sent.message.id),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct_to_offline_recipient_is_stored() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());

        let sent = h
            .dispatcher
            .send_message(MessageDraft::direct(a, b, "later"))
            .await
            .unwrap();
        assert_eq!(sent.delivery, Delivery::Direct { delivered: false });

        let history = h.dispatcher.history_between(b, a).await.unwrap();
        assert_eq!(history, vec![sent.message]);
    }

    #[tokio::test]
    async fn test_room_members_get_same_id() {
        let h = harness();
        let room = RoomId::new();
        let (a, b, outsider) = (UserId::new(), UserId::new(), UserId::new());
        let (ha, mut rx_a) = connect(&h.dispatcher, a).await;
        let (hb, mut rx_b) = connect(&h.dispatcher, b).await;
        let (_ho, mut rx_o) = connect(&h.dispatcher, outsider).await;
        h.dispatcher.channels().join(&ha, room).await;
        h.dispatcher.channels().join(&hb, room).await;

        let sent = h
            .dispatcher
            .send_message(MessageDraft::group(a, room, "hey all"))
            .await
            .unwrap();
        assert_eq!(sent.delivery, Delivery::Room { recipients: 2 });

        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [OutboundEvent::Message(m)] => assert_eq!(m.id, sent.message.id),
                other => panic!("unexpected events: {other:?}"),
            }
        }
        assert!(drain(&mut rx_o).is_empty());
    }

    #[tokio::test]
    async fn test_lone_room_sender_counts_own_copy() {
        let h = harness();
        let room = RoomId::new();
        let a = UserId::new();
        let (ha, mut rx_a) = connect(&h.dispatcher, a).await;
        h.dispatcher.channels().join(&ha, room).await;

        let sent = h
            .dispatcher
            .send_message(MessageDraft::group(a, room, "anyone?"))
            .await
            .unwrap();

        assert_eq!(sent.delivery, Delivery::Room { recipients: 1 });
        assert!(sent.delivery.reached_anyone());
        assert_eq!(drain(&mut rx_a).len(), 1);

        // Not joined: nothing queued, though the message is stored.
        let other = RoomId::new();
        let sent = h
            .dispatcher
            .send_message(MessageDraft::group(a, other, "hello?"))
            .await
            .unwrap();
        assert!(!sent.delivery.reached_anyone());
        assert_eq!(h.dispatcher.history_in_room(other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsend_round_trip() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;

        let sent = h
            .dispatcher
            .send_message(MessageDraft::direct(a, b, "oops"))
            .await
            .unwrap();
        drain(&mut rx_b);

        let unsent = h.dispatcher.unsend(sent.message.id).await.unwrap();
        assert!(unsent.message.is_unsend);
        assert_eq!(unsent.delivery, Delivery::Direct { delivered: true });

        match drain(&mut rx_b).as_slice() {
            [OutboundEvent::UnsendNotice(m)] => {
                assert_eq!(m.id, sent.message.id);
                assert!(m.is_unsend);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsend_offline_recipient_sees_flag_in_history() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());

        let sent = h
            .dispatcher
            .send_message(MessageDraft::direct(a, b, "oops"))
            .await
            .unwrap();
        let unsent = h.dispatcher.unsend(sent.message.id).await.unwrap();
        assert_eq!(unsent.delivery, Delivery::Direct { delivered: false });

        let history = h.dispatcher.history_between(b, a).await.unwrap();
        assert!(history[0].is_unsend);
    }

    #[tokio::test]
    async fn test_delete_unknown_message() {
        let h = harness();
        let id = MessageId::new();
        assert!(matches!(
            h.dispatcher.delete(id).await,
            Err(RouterError::MessageNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_typing_is_not_persisted() {
        let h = harness();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;

        assert!(h.dispatcher.typing(a, b, true).await);
        assert!(h.dispatcher.typing(a, b, false).await);
        assert!(!h.dispatcher.typing(b, a, true).await);
        assert_eq!(h.gateway.calls(), 0);

        let events = drain(&mut rx_b);
        assert_eq!(
            events,
            vec![
                OutboundEvent::Typing { sender_id: a },
                OutboundEvent::StopTyping { sender_id: a },
            ]
        );
    }

    #[tokio::test]
    async fn test_attachments_are_independent_cycles() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path().to_path_buf(), "http://files.test", 16)
            .await
            .unwrap();
        let (a, b) = (UserId::new(), UserId::new());
        let (_hb, mut rx_b) = connect(&h.dispatcher, b).await;

        let files = vec![
            Attachment {
                file_name: "one.txt".to_string(),
                bytes: b"first".to_vec(),
            },
            Attachment {
                file_name: "huge.bin".to_string(),
                bytes: vec![7u8; 64],
            },
            Attachment {
                file_name: "three.txt".to_string(),
                bytes: b"third".to_vec(),
            },
        ];

        let outcomes = h
            .dispatcher
            .send_attachments(&blobs, a, None, Some(b), files)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].message.is_some());
        assert_eq!(outcomes[1].error, Some(ErrorCode::BadRequest));
        assert!(outcomes[2].message.is_some());

        let delivered = drain(&mut rx_b);
        assert_eq!(delivered.len(), 2);
        match &delivered[0] {
            OutboundEvent::Message(m) => assert!(m.text.starts_with("http://files.test/files/")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attachments_with_bad_addressing_upload_nothing() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path().to_path_buf(), "http://files.test", 1024)
            .await
            .unwrap();

        let err = h
            .dispatcher
            .send_attachments(
                &blobs,
                UserId::new(),
                None,
                None,
                vec![Attachment {
                    file_name: "a.txt".to_string(),
                    bytes: b"data".to_vec(),
                }],
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::MalformedAddressing);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(h.gateway.calls(), 0);
    }
}
