//! Authenticated player identity.

use std::net::SocketAddr;

use crate::slots::SlotId;

/// A BeamMP account as resolved by the auth API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    /// Session-scoped key; at most one live session per key.
    pub public_key: String,
    pub id: String,
    pub guest: bool,
    pub identifiers: Vec<String>,
    pub roles: String,
    pub user_id: String,
}

/// A player in the game session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Player {
    /// Shown to other players. Starts out as the account name.
    pub display_name: String,
    pub address: Option<SocketAddr>,
    /// Assigned once a slot reservation is bound.
    pub slot: Option<SlotId>,
    pub account: Account,
}

impl Player {
    pub fn public_key(&self) -> &str {
        &self.account.public_key
    }
}
