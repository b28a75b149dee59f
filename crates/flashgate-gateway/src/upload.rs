//! Chunked firmware upload store.
//!
//! Uploads land in the firmware directory. Parts must arrive in order; the
//! closing checksum is verified against a running SHA-256 digest and a
//! mismatch removes the half-written file.

use std::{
    collections::HashMap,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use flashgate_core::{HandlerError, Responder};
use flashgate_proto::{
    Envelope, Payload, PayloadKind,
    payloads::upload::{FileUpload, UploadEvent, UploadResult},
};
use sha2::{Digest, Sha256};

struct ActiveUpload {
    path: PathBuf,
    file: fs::File,
    next_part: u32,
    hasher: Sha256,
}

#[derive(Default)]
struct UploadState {
    next_uid: u64,
    active: HashMap<u64, ActiveUpload>,
}

/// Uid-assigning store for in-progress uploads.
pub struct UploadStore {
    dir: PathBuf,
    state: Mutex<UploadState>,
}

impl UploadStore {
    /// Store writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), state: Mutex::new(UploadState::default()) }
    }

    /// Open an upload; returns the assigned uid and the verdict.
    pub fn start(&self, name: &str) -> (Option<u64>, UploadResult) {
        let Ok(path) = self.path_for(name) else {
            return (None, UploadResult::IoError);
        };
        if path.exists() {
            tracing::warn!(name, "upload target already exists");
            return (None, UploadResult::AlreadyExists);
        }

        let file = match fs::File::create(&path) {
            Ok(file) => file,
            Err(error) => {
                tracing::error!(name, %error, "failed to create upload target");
                return (None, UploadResult::IoError);
            },
        };

        let mut state = self.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        state
            .active
            .insert(uid, ActiveUpload { path, file, next_part: 0, hasher: Sha256::new() });

        tracing::debug!(name, uid, "upload started");
        (Some(uid), UploadResult::Ok)
    }

    /// Append one part; parts must arrive in declared order.
    pub fn append(&self, uid: u64, part_no: u32, chunk: &[u8]) -> UploadResult {
        let mut state = self.lock();
        let Some(upload) = state.active.get_mut(&uid) else {
            tracing::warn!(uid, "part for unknown upload");
            return UploadResult::IoError;
        };

        if upload.next_part != part_no {
            tracing::warn!(uid, expected = upload.next_part, got = part_no, "part out of order");
            return UploadResult::IoError;
        }

        if let Err(error) = upload.file.write_all(chunk).and_then(|()| upload.file.flush()) {
            tracing::error!(uid, %error, "failed to write part");
            return UploadResult::IoError;
        }

        upload.next_part += 1;
        upload.hasher.update(chunk);
        UploadResult::Ok
    }

    /// Close an upload, verifying the peer's checksum.
    pub fn finish(&self, uid: u64, checksum: &[u8]) -> UploadResult {
        let Some(upload) = self.lock().active.remove(&uid) else {
            tracing::warn!(uid, "finish for unknown upload");
            return UploadResult::IoError;
        };

        let digest = upload.hasher.finalize();
        if digest.as_slice() != checksum {
            tracing::warn!(uid, "upload checksum mismatch, discarding");
            let _ = fs::remove_file(&upload.path);
            return UploadResult::InvalidChecksum;
        }

        tracing::debug!(uid, path = %upload.path.display(), "upload finished");
        UploadResult::Ok
    }

    /// Remove a stored file by name.
    pub fn delete(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path_for(name)?)
    }

    /// Resolve `name` inside the store, rejecting path traversal.
    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"));
        }
        Ok(self.dir.join(name))
    }

    fn lock(&self) -> MutexGuard<'_, UploadState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Directory the store writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Serves `FileUpload` events.
pub struct FileUploadResponder {
    store: Arc<UploadStore>,
}

impl FileUploadResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<UploadStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for FileUploadResponder {
    type Request = FileUpload;
    type Response = FileUpload;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::FileUpload
    }

    fn unpack_request(&self, request: &Envelope) -> Result<FileUpload, HandlerError> {
        match &request.payload {
            Some(Payload::FileUpload(upload)) => Ok(upload.clone()),
            _ => Err(HandlerError::BadRequest("expected file-upload payload".to_string())),
        }
    }

    async fn on_request(&self, request: FileUpload) -> Result<FileUpload, HandlerError> {
        let (uid, result) = match &request.event {
            UploadEvent::Start { name, .. } => self.store.start(name),
            UploadEvent::Part { part_no, chunk } => {
                let uid = request
                    .uid
                    .ok_or_else(|| HandlerError::BadRequest("part without uid".to_string()))?;
                (Some(uid), self.store.append(uid, *part_no, chunk))
            },
            UploadEvent::Finish { checksum } => {
                let uid = request
                    .uid
                    .ok_or_else(|| HandlerError::BadRequest("finish without uid".to_string()))?;
                (Some(uid), self.store.finish(uid, checksum))
            },
            UploadEvent::Result(_) => {
                return Err(HandlerError::BadRequest("unexpected result event".to_string()));
            },
        };

        Ok(FileUpload { uid, event: UploadEvent::Result(result) })
    }

    fn prepare_response(&self, response: FileUpload) -> Payload {
        Payload::FileUpload(response)
    }
}

/// Serves `DeleteFile`.
pub struct DeleteFileResponder {
    store: Arc<UploadStore>,
}

impl DeleteFileResponder {
    /// Responder over `store`.
    pub fn new(store: Arc<UploadStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Responder for DeleteFileResponder {
    type Request = String;
    type Response = ();

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::DeleteFile
    }

    fn unpack_request(&self, request: &Envelope) -> Result<String, HandlerError> {
        match &request.payload {
            Some(Payload::DeleteFile { name }) => Ok(name.clone()),
            _ => Err(HandlerError::BadRequest("expected delete-file payload".to_string())),
        }
    }

    async fn on_request(&self, name: String) -> Result<(), HandlerError> {
        tracing::info!(name, "deleting stored file");
        self.store.delete(&name).map_err(HandlerError::failed)
    }

    fn prepare_response(&self, (): ()) -> Payload {
        Payload::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UploadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        (dir, store)
    }

    fn sha256(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    #[test]
    fn upload_in_order_verifies_and_lands() {
        let (dir, store) = store();

        let (uid, result) = store.start("app.elf");
        assert_eq!(result, UploadResult::Ok);
        let uid = uid.unwrap();

        assert_eq!(store.append(uid, 0, b"hello "), UploadResult::Ok);
        assert_eq!(store.append(uid, 1, b"world"), UploadResult::Ok);
        assert_eq!(store.finish(uid, &sha256(&[b"hello ", b"world"])), UploadResult::Ok);

        assert_eq!(fs::read(dir.path().join("app.elf")).unwrap(), b"hello world");
    }

    #[test]
    fn out_of_order_part_is_rejected() {
        let (_dir, store) = store();
        let (uid, _) = store.start("app.elf");
        let uid = uid.unwrap();

        assert_eq!(store.append(uid, 1, b"skipped ahead"), UploadResult::IoError);
        assert_eq!(store.append(uid, 0, b"still fine"), UploadResult::Ok);
    }

    #[test]
    fn checksum_mismatch_discards_the_file() {
        let (dir, store) = store();
        let (uid, _) = store.start("app.elf");
        let uid = uid.unwrap();

        assert_eq!(store.append(uid, 0, b"content"), UploadResult::Ok);
        assert_eq!(store.finish(uid, b"not a digest"), UploadResult::InvalidChecksum);
        assert!(!dir.path().join("app.elf").exists());
    }

    #[test]
    fn duplicate_name_already_exists() {
        let (dir, store) = store();
        fs::write(dir.path().join("app.elf"), b"previous").unwrap();

        let (uid, result) = store.start("app.elf");
        assert_eq!(result, UploadResult::AlreadyExists);
        assert!(uid.is_none());
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (_dir, store) = store();
        let (uid, result) = store.start("../escape");
        assert_eq!(result, UploadResult::IoError);
        assert!(uid.is_none());
        assert!(store.delete("nested/name").is_err());
    }

    #[tokio::test]
    async fn responder_round_trip() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let responder = FileUploadResponder::new(Arc::clone(&store));

        let start = FileUpload {
            uid: None,
            event: UploadEvent::Start {
                name: "fw.bin".to_string(),
                size: 4,
                chunks: 1,
                file_type: flashgate_proto::payloads::upload::FileType::Firmware,
            },
        };
        let response = responder.on_request(start).await.unwrap();
        let uid = response.uid.unwrap();
        assert_eq!(response.event, UploadEvent::Result(UploadResult::Ok));

        let part =
            FileUpload { uid: Some(uid), event: UploadEvent::Part { part_no: 0, chunk: b"data".to_vec() } };
        let response = responder.on_request(part).await.unwrap();
        assert_eq!(response.event, UploadEvent::Result(UploadResult::Ok));

        let finish =
            FileUpload { uid: Some(uid), event: UploadEvent::Finish { checksum: sha256(&[b"data"]) } };
        let response = responder.on_request(finish).await.unwrap();
        assert_eq!(response.event, UploadEvent::Result(UploadResult::Ok));
    }
}
