//! Local view of room membership, fed by the relay's lifecycle notices.
//!
//! None of these notices move the negotiation forward; they are logged and
//! kept for diagnostics. `full` is reported as a [`Error::RelayDelivery`].

use crate::error::{Error, Result};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Empty,
    OneMember,
    Full,
}

#[derive(Debug)]
pub struct RoomTracker {
    room: String,
    membership: Membership,
    rejected: bool,
}

impl RoomTracker {
    pub fn new(room: &str) -> Self {
        Self {
            room: room.to_string(),
            membership: Membership::Empty,
            rejected: false,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    /// True once the relay turned our join away
    pub fn was_rejected(&self) -> bool {
        self.rejected
    }

    fn check_room(&self, event: &str, room: &str) {
        if room != self.room {
            warn!("{} for room {} while tracking room {}", event, room, self.room);
        }
    }

    pub fn on_created(&mut self, room: &str) {
        self.check_room("created", room);
        info!("Created room {}", room);
        self.membership = Membership::OneMember;
    }

    pub fn on_joined(&mut self, room: &str) {
        self.check_room("joined", room);
        info!("Joined room {}", room);
        self.membership = Membership::Full;
    }

    pub fn on_new_peer(&mut self, room: &str) {
        self.check_room("new_peer", room);
        info!("New peer joined room {}", room);
        self.membership = Membership::Full;
    }

    pub fn on_full(&mut self, room: &str) -> Result<()> {
        self.check_room("full", room);
        info!("Room {} is full", room);
        self.rejected = true;
        Err(Error::RelayDelivery(format!("room {} is full", room)))
    }

    pub fn on_bye(&mut self, room: &str) {
        self.check_room("bye", room);
        if self.membership == Membership::Full {
            self.membership = Membership::OneMember;
        }
    }
}
