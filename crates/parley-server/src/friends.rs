//! Friend requests: persist the edge, then notify whoever is online.

use std::sync::Arc;

use tracing::{debug, info};

use parley_shared::{FriendEdge, FriendStatus, OutboundEvent, UserId};

use crate::error::RouterError;
use crate::gateway::{GatewayError, PersistenceGateway};
use crate::registry::ConnectionRegistry;

pub struct FriendNotifier {
    registry: Arc<ConnectionRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl FriendNotifier {
    pub fn new(registry: Arc<ConnectionRegistry>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { registry, gateway }
    }

    /// Open a pending request from `sender` to `receiver`.
    ///
    /// Any existing edge between the two, in either direction and in any
    /// state, makes this a duplicate.
    pub async fn send_request(&self, sender: UserId, receiver: UserId) -> Result<FriendEdge, RouterError> {
        if sender == receiver {
            return Err(RouterError::BadRequest(
                "cannot send a friend request to yourself".to_string(),
            ));
        }

        if self.gateway.find_friend_edge(sender, receiver).await?.is_some() {
            debug!(sender = %sender, receiver = %receiver, "Duplicate friend request");
            return Err(RouterError::DuplicateRequest);
        }

        let edge = match self.gateway.create_friend_edge(sender, receiver).await {
            Ok(edge) => edge,
            // Lost a race with a concurrent request for the same pair.
            Err(GatewayError::Conflict(_)) => return Err(RouterError::DuplicateRequest),
            Err(e) => return Err(e.into()),
        };

        let delivered = self
            .registry
            .send_to(receiver, OutboundEvent::FriendRequestSent(edge.clone()))
            .await;

        info!(edge = %edge.id, sender = %sender, receiver = %receiver, delivered, "Friend request sent");
        Ok(edge)
    }

    /// Accept the pending request `requester -> acceptor` and notify both
    /// sides.
    pub async fn accept_request(
        &self,
        requester: UserId,
        acceptor: UserId,
    ) -> Result<FriendEdge, RouterError> {
        let edge = self
            .gateway
            .find_friend_edge(requester, acceptor)
            .await?
            .filter(|e| {
                e.sender_id == requester
                    && e.receiver_id == acceptor
                    && e.status == FriendStatus::Pending
            })
            .ok_or_else(|| {
                RouterError::InvalidState(format!("no pending request from {requester}"))
            })?;

        let accepted = match self
            .gateway
            .transition_friend_edge(edge.id, FriendStatus::Accepted)
            .await
        {
            Ok(edge) => edge,
            Err(GatewayError::Conflict(msg)) => return Err(RouterError::InvalidState(msg)),
            Err(GatewayError::NotFound) => {
                return Err(RouterError::InvalidState(format!(
                    "friend request {} no longer exists",
                    edge.id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let mut notified = 0;
        for party in [requester, acceptor] {
            if self
                .registry
                .send_to(party, OutboundEvent::FriendRequestAccepted(accepted.clone()))
                .await
            {
                notified += 1;
            }
        }

        info!(edge = %accepted.id, requester = %requester, acceptor = %acceptor, notified, "Friend request accepted");
        Ok(accepted)
    }

    pub async fn pending_for(&self, user: UserId) -> Result<Vec<FriendEdge>, RouterError> {
        Ok(self.gateway.pending_requests_for(user).await?)
    }

    pub async fn friends_of(&self, user: UserId) -> Result<Vec<FriendEdge>, RouterError> {
        Ok(self.gateway.friends_of(user).await?)
    }
}
