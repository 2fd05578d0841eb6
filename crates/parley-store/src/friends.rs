//! CRUD operations for [`FriendEdge`] records.
//!
//! At most one edge exists per unordered pair of users, enforced by the
//! `UNIQUE (user_lo, user_hi)` index.

use chrono::{SubsecRound, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::{FriendEdge, FriendEdgeId, FriendStatus, UserId};

use crate::database::{format_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str =
    "SELECT id, sender_id, receiver_id, status, created_at FROM friend_edges";

fn pair_key(a: UserId, b: UserId) -> (String, String) {
    (a.min(b).to_string(), a.max(b).to_string())
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a pending edge from `sender` to `receiver`.
    ///
    /// Fails with [`StoreError::Conflict`] if any edge already exists between
    /// the two users, in either direction.
    pub fn insert_friend_request(&self, sender: UserId, receiver: UserId) -> Result<FriendEdge> {
        let edge = FriendEdge {
            id: FriendEdgeId::new(),
            sender_id: sender,
            receiver_id: receiver,
            status: FriendStatus::Pending,
            created_at: Utc::now().trunc_subsecs(6),
        };
        let (lo, hi) = pair_key(sender, receiver);

        let result = self.conn().execute(
            "INSERT INTO friend_edges (id, sender_id, receiver_id, user_lo, user_hi, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.id.to_string(),
                sender.to_string(),
                receiver.to_string(),
                lo,
                hi,
                edge.status.as_str(),
                format_ts(&edge.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(edge),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!(
                    "friend edge between {sender} and {receiver} already exists"
                )))
            }
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_friend_edge(&self, id: FriendEdgeId) -> Result<FriendEdge> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_edge,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The edge between two users regardless of who sent the request.
    pub fn find_friend_edge(&self, a: UserId, b: UserId) -> Result<Option<FriendEdge>> {
        let (lo, hi) = pair_key(a, b);
        Ok(self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE user_lo = ?1 AND user_hi = ?2"),
                params![lo, hi],
                row_to_edge,
            )
            .optional()?)
    }

    /// Pending requests addressed to `receiver`, oldest first.
    pub fn pending_requests_for(&self, receiver: UserId) -> Result<Vec<FriendEdge>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE receiver_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![receiver.to_string()], row_to_edge)?;

        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Accepted edges on either side of `user`, oldest first.
    pub fn friends_of(&self, user: UserId) -> Result<Vec<FriendEdge>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE status = 'accepted' AND (sender_id = ?1 OR receiver_id = ?1)
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_edge)?;

        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Move an edge to `to`. The only legal transition is
    /// `pending -> accepted`; anything else is a [`StoreError::Conflict`].
    ///
    /// The update is conditional on the current state, so of two racing
    /// accepts exactly one succeeds.
    pub fn transition_friend_edge(&self, id: FriendEdgeId, to: FriendStatus) -> Result<FriendEdge> {
        let from = match to {
            FriendStatus::Accepted => FriendStatus::Pending,
            FriendStatus::Pending => {
                return Err(StoreError::Conflict(
                    "friend edges cannot return to pending".to_string(),
                ))
            }
        };

        let affected = self.conn().execute(
            "UPDATE friend_edges SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_str(), id.to_string(), from.as_str()],
        )?;

        if affected == 0 {
            // Distinguish a missing edge from one in the wrong state.
            let current = self.get_friend_edge(id)?;
            return Err(StoreError::Conflict(format!(
                "friend edge {id} is {}, expected {}",
                current.status.as_str(),
                from.as_str()
            )));
        }

        self.get_friend_edge(id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendEdge> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;

    let status = FriendStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(StoreError::InvalidValue(format!("friend status '{status_str}'"))),
        )
    })?;

    Ok(FriendEdge {
        id: FriendEdgeId(parse_uuid(0, &id_str)?),
        sender_id: UserId(parse_uuid(1, &sender_str)?),
        receiver_id: UserId(parse_uuid(2, &receiver_str)?),
        status,
        created_at: parse_ts(4, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn request_then_find_either_direction() {
        let db = db();
        let (a, b) = (UserId::new(), UserId::new());

        let edge = db.insert_friend_request(a, b).unwrap();
        assert_eq!(edge.status, FriendStatus::Pending);

        assert_eq!(db.find_friend_edge(a, b).unwrap(), Some(edge.clone()));
        assert_eq!(db.find_friend_edge(b, a).unwrap(), Some(edge));
        assert_eq!(db.find_friend_edge(a, UserId::new()).unwrap(), None);
    }

    #[test]
    fn duplicate_pair_conflicts_in_both_directions() {
        let db = db();
        let (a, b) = (UserId::new(), UserId::new());
        db.insert_friend_request(a, b).unwrap();

        assert!(matches!(db.insert_friend_request(a, b), Err(StoreError::Conflict(_))));
        assert!(matches!(db.insert_friend_request(b, a), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn accept_is_one_shot() {
        let db = db();
        let edge = db.insert_friend_request(UserId::new(), UserId::new()).unwrap();

        let accepted = db
            .transition_friend_edge(edge.id, FriendStatus::Accepted)
            .unwrap();
        assert_eq!(accepted.status, FriendStatus::Accepted);

        assert!(matches!(
            db.transition_friend_edge(edge.id, FriendStatus::Accepted),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.transition_friend_edge(edge.id, FriendStatus::Pending),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn transition_missing_edge_is_not_found() {
        assert!(matches!(
            db().transition_friend_edge(FriendEdgeId::new(), FriendStatus::Accepted),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn pending_and_friend_lists() {
        let db = db();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());

        let ab = db.insert_friend_request(a, b).unwrap();
        db.insert_friend_request(c, b).unwrap();

        assert_eq!(db.pending_requests_for(b).unwrap().len(), 2);
        assert!(db.pending_requests_for(a).unwrap().is_empty());

        db.transition_friend_edge(ab.id, FriendStatus::Accepted).unwrap();

        assert_eq!(db.pending_requests_for(b).unwrap().len(), 1);
        let friends_of_a = db.friends_of(a).unwrap();
        assert_eq!(friends_of_a.len(), 1);
        assert!(friends_of_a[0].involves(b));
        assert_eq!(db.friends_of(b).unwrap().len(), 1);
        assert!(db.friends_of(c).unwrap().is_empty());
    }
}
