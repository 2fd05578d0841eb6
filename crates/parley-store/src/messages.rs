//! CRUD operations for [`Message`] records.

use chrono::{SubsecRound, Utc};
use rusqlite::params;

use parley_shared::{Message, MessageEvent, MessageFlag, MessageId, RoomId, Target, UserId};

use crate::database::{format_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, text, sender_id, room_id, recipient_id,
        is_unsend, is_deleted, is_seen, created_at
 FROM messages";

impl Database {
    /// Persist a validated message and return the stored record with its
    /// generated id and timestamp.
    pub fn insert_message(&self, event: &MessageEvent) -> Result<Message> {
        let (room_id, recipient_id) = match event.target {
            Target::Room(room) => (Some(room), None),
            Target::User(user) => (None, Some(user)),
        };

        let message = Message {
            id: MessageId::new(),
            text: event.text.clone(),
            sender_id: event.sender_id,
            room_id,
            recipient_id,
            is_unsend: false,
            is_deleted: false,
            is_seen: false,
            created_at: Utc::now().trunc_subsecs(6),
        };

        self.conn().execute(
            "INSERT INTO messages (id, text, sender_id, room_id, recipient_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.text,
                message.sender_id.to_string(),
                message.room_id.map(|r| r.to_string()),
                message.recipient_id.map(|u| u.to_string()),
                format_ts(&message.created_at),
            ],
        )?;

        Ok(message)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Set a soft-delete marker and return the updated record.
    ///
    /// Setting a flag that is already set is not an error.
    pub fn set_message_flag(&self, id: MessageId, flag: MessageFlag) -> Result<Message> {
        let column = match flag {
            MessageFlag::Unsend => "is_unsend",
            MessageFlag::Deleted => "is_deleted",
        };

        let affected = self.conn().execute(
            &format!("UPDATE messages SET {column} = 1 WHERE id = ?1"),
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.get_message(id)
    }

    /// Direct messages exchanged between two users, oldest first.
    pub fn messages_between(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE (sender_id = ?1 AND recipient_id = ?2)
                OR (sender_id = ?2 AND recipient_id = ?1)
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Messages posted to a room, oldest first.
    pub fn messages_in_room(&self, room_id: RoomId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE room_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![room_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let text: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let room_str: Option<String> = row.get(3)?;
    let recipient_str: Option<String> = row.get(4)?;
    let is_unsend: bool = row.get(5)?;
    let is_deleted: bool = row.get(6)?;
    let is_seen: bool = row.get(7)?;
    let ts_str: String = row.get(8)?;

    let room_id = room_str
        .map(|s| parse_uuid(3, &s).map(RoomId))
        .transpose()?;
    let recipient_id = recipient_str
        .map(|s| parse_uuid(4, &s).map(UserId))
        .transpose()?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        text,
        sender_id: UserId(parse_uuid(2, &sender_str)?),
        room_id,
        recipient_id,
        is_unsend,
        is_deleted,
        is_seen,
        created_at: parse_ts(8, &ts_str)?,
    })
}
