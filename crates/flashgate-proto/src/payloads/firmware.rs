//! Firmware catalog payload types.

use serde::{Deserialize, Serialize};

/// One firmware image present in the gateway's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    /// Image file name.
    pub name: String,
    /// Whether the peer marked this image as a favourite.
    pub favourite: bool,
}

impl Firmware {
    /// Build a firmware entry.
    pub fn new(name: impl Into<String>, favourite: bool) -> Self {
        Self { name: name.into(), favourite }
    }
}

/// Full firmware catalog: every stored image plus the favourites subset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareData {
    /// All firmware images, favourites flagged in place.
    pub all: Vec<Firmware>,
    /// Favourite images in display order.
    pub favorites: Vec<Firmware>,
}
