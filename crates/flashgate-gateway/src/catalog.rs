//! Board and firmware catalog.
//!
//! Boards are the `*.cfg` files in the boards directory (programmer target
//! configurations); firmware images are whatever the firmware directory
//! holds. Favourites are peer-managed and persisted as a small JSON document
//! next to the data.

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use flashgate_core::{HandlerError, Responder};
use flashgate_proto::{
    Envelope, Payload, PayloadKind,
    payloads::{
        boards::{Board, BoardsData},
        firmware::{Firmware, FirmwareData},
    },
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Favourites {
    boards: Vec<String>,
    firmware: Vec<String>,
}

/// Catalog of boards and firmware with persisted favourites.
pub struct CatalogStore {
    boards_dir: PathBuf,
    firmware_dir: PathBuf,
    favourites_path: PathBuf,
    favourites: Mutex<Favourites>,
}

impl CatalogStore {
    /// Open the catalog, loading persisted favourites when present.
    pub fn open(
        boards_dir: impl Into<PathBuf>,
        firmware_dir: impl Into<PathBuf>,
        favourites_path: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let favourites_path = favourites_path.into();
        let favourites = match fs::read(&favourites_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                tracing::warn!(%error, "favourites file unreadable, starting fresh");
                Favourites::default()
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Favourites::default(),
            Err(error) => return Err(error),
        };

        Ok(Self {
            boards_dir: boards_dir.into(),
            firmware_dir: firmware_dir.into(),
            favourites_path,
            favourites: Mutex::new(favourites),
        })
    }

    /// All known boards plus the favourites subset.
    pub fn boards(&self) -> io::Result<BoardsData> {
        let names = list_files(&self.boards_dir, Some("cfg"))?;
        let favourites = self.lock().boards.clone();
        Ok(BoardsData {
            all: flag_favourites(&names, &favourites, Board::new),
            favorites: favourites.into_iter().map(|name| Board::new(name, true)).collect(),
        })
    }

    /// All stored firmware images plus the favourites subset.
    pub fn firmware(&self) -> io::Result<FirmwareData> {
        let names = list_files(&self.firmware_dir, None)?;
        let favourites = self.lock().firmware.clone();
        Ok(FirmwareData {
            all: flag_favourites(&names, &favourites, Firmware::new),
            favorites: favourites.into_iter().map(|name| Firmware::new(name, true)).collect(),
        })
    }

    /// Replace the favourite boards set and persist it.
    pub fn set_favourite_boards(&self, names: Vec<String>) -> io::Result<()> {
        let snapshot = {
            let mut favourites = self.lock();
            favourites.boards = names;
            serde_json::to_vec_pretty(&*favourites)?
        };
        fs::write(&self.favourites_path, snapshot)
    }

    /// Replace the favourite firmware set and persist it.
    pub fn set_favourite_firmware(&self, names: Vec<String>) -> io::Result<()> {
        let snapshot = {
            let mut favourites = self.lock();
            favourites.firmware = names;
            serde_json::to_vec_pretty(&*favourites)?
        };
        fs::write(&self.favourites_path, snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Favourites> {
        match self.favourites.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Sorted file names in `dir`, optionally filtered by extension.
fn list_files(dir: &Path, extension: Option<&str>) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(wanted) = extension {
            if path.extension().and_then(|e| e.to_str()) != Some(wanted) {
                continue;
            }
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn flag_favourites<T>(
    names: &[String],
    favourites: &[String],
    make: impl Fn(String, bool) -> T,
) -> Vec<T> {
    let favourite_set: HashSet<&str> = favourites.iter().map(String::as_str).collect();
    names.iter().map(|name| make(name.clone(), favourite_set.contains(name.as_str()))).collect()
}

/// Serves `GetBoardsRequest`.
pub struct GetBoardsResponder {
    store: Arc<CatalogStore>,
}

impl GetBoardsResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for GetBoardsResponder {
    type Request = ();
    type Response = BoardsData;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::GetBoardsRequest
    }

    fn unpack_request(&self, _request: &Envelope) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_request(&self, _request: ()) -> Result<BoardsData, HandlerError> {
        self.store.boards().map_err(HandlerError::failed)
    }

    fn prepare_response(&self, response: BoardsData) -> Payload {
        Payload::GetBoardsResponse(response)
    }
}

/// Serves `PutBoardsRequest`.
pub struct PutBoardsResponder {
    store: Arc<CatalogStore>,
}

impl PutBoardsResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for PutBoardsResponder {
    type Request = BoardsData;
    type Response = bool;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::PutBoardsRequest
    }

    fn unpack_request(&self, request: &Envelope) -> Result<BoardsData, HandlerError> {
        match &request.payload {
            Some(Payload::PutBoardsRequest(data)) => Ok(data.clone()),
            _ => Err(HandlerError::BadRequest("expected put-boards payload".to_string())),
        }
    }

    async fn on_request(&self, request: BoardsData) -> Result<bool, HandlerError> {
        let names = request.favorites.into_iter().map(|board| board.name).collect();
        self.store.set_favourite_boards(names).map_err(HandlerError::failed)?;
        Ok(true)
    }

    fn prepare_response(&self, success: bool) -> Payload {
        Payload::PutBoardsResponse { success }
    }
}

/// Serves `GetFirmwareRequest`.
pub struct GetFirmwareResponder {
    store: Arc<CatalogStore>,
}

impl GetFirmwareResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for GetFirmwareResponder {
    type Request = ();
    type Response = FirmwareData;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::GetFirmwareRequest
    }

    fn unpack_request(&self, _request: &Envelope) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_request(&self, _request: ()) -> Result<FirmwareData, HandlerError> {
        self.store.firmware().map_err(HandlerError::failed)
    }

    fn prepare_response(&self, response: FirmwareData) -> Payload {
        Payload::GetFirmwareResponse(response)
    }
}

/// Serves `PutFirmwareRequest`.
pub struct PutFirmwareResponder {
    store: Arc<CatalogStore>,
}

impl PutFirmwareResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for PutFirmwareResponder {
    type Request = FirmwareData;
    type Response = bool;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::PutFirmwareRequest
    }

    fn unpack_request(&self, request: &Envelope) -> Result<FirmwareData, HandlerError> {
        match &request.payload {
            Some(Payload::PutFirmwareRequest(data)) => Ok(data.clone()),
            _ => Err(HandlerError::BadRequest("expected put-firmware payload".to_string())),
        }
    }

    async fn on_request(&self, request: FirmwareData) -> Result<bool, HandlerError> {
        let names = request.favorites.into_iter().map(|firmware| firmware.name).collect();
        self.store.set_favourite_firmware(names).map_err(HandlerError::failed)?;
        Ok(true)
    }

    fn prepare_response(&self, success: bool) -> Payload {
        Payload::PutFirmwareResponse { success }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_files() -> (tempfile::TempDir, Arc<CatalogStore>) {
        let dir = tempfile::tempdir().unwrap();
        let boards = dir.path().join("boards");
        let firmware = dir.path().join("firmware");
        fs::create_dir(&boards).unwrap();
        fs::create_dir(&firmware).unwrap();

        fs::write(boards.join("stm32f0x.cfg"), b"cfg").unwrap();
        fs::write(boards.join("rp2040.cfg"), b"cfg").unwrap();
        fs::write(boards.join("notes.txt"), b"not a board").unwrap();
        fs::write(firmware.join("blink.elf"), b"elf").unwrap();

        let store =
            CatalogStore::open(&boards, &firmware, dir.path().join("favourites.json")).unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn lists_boards_sorted_and_filtered() {
        let (_dir, store) = store_with_files();
        let data = store.boards().unwrap();

        let names: Vec<&str> = data.all.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["rp2040.cfg", "stm32f0x.cfg"]);
        assert!(data.favorites.is_empty());
    }

    #[test]
    fn favourites_survive_reopen() {
        let (dir, store) = store_with_files();
        store.set_favourite_boards(vec!["rp2040.cfg".to_string()]).unwrap();
        drop(store);

        let reopened = CatalogStore::open(
            dir.path().join("boards"),
            dir.path().join("firmware"),
            dir.path().join("favourites.json"),
        )
        .unwrap();

        let data = reopened.boards().unwrap();
        assert_eq!(data.favorites.len(), 1);
        assert!(data.all.iter().any(|b| b.name == "rp2040.cfg" && b.favourite));
        assert!(data.all.iter().any(|b| b.name == "stm32f0x.cfg" && !b.favourite));
    }

    #[tokio::test]
    async fn put_boards_updates_favourites() {
        let (_dir, store) = store_with_files();
        let responder = PutBoardsResponder::new(Arc::clone(&store));

        let request = Envelope::request(
            0,
            1,
            Payload::PutBoardsRequest(BoardsData {
                all: Vec::new(),
                favorites: vec![Board::new("stm32f0x.cfg", true)],
            }),
        );

        let data = responder.unpack_request(&request).unwrap();
        assert!(responder.on_request(data).await.unwrap());

        let boards = store.boards().unwrap();
        assert_eq!(boards.favorites.len(), 1);
        assert_eq!(boards.favorites[0].name, "stm32f0x.cfg");
    }
}
