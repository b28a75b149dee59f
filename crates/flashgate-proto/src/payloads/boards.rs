//! Board catalog payload types.

use serde::{Deserialize, Serialize};

/// One board configuration known to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Configuration file name, e.g. `stm32f0x.cfg`.
    pub name: String,
    /// Whether the peer marked this board as a favourite.
    pub favourite: bool,
}

impl Board {
    /// Build a board entry.
    pub fn new(name: impl Into<String>, favourite: bool) -> Self {
        Self { name: name.into(), favourite }
    }
}

/// Full board catalog: every known board plus the favourites subset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoardsData {
    /// All boards, favourites flagged in place.
    pub all: Vec<Board>,
    /// Favourite boards in display order.
    pub favorites: Vec<Board>,
}
