//! Chunked file upload payload types.
//!
//! An upload is a conversation of `FileUpload` envelopes: the peer opens it
//! with [`UploadEvent::Start`], streams numbered [`UploadEvent::Part`]
//! chunks, and closes with [`UploadEvent::Finish`] carrying a SHA-256
//! checksum of the whole file. The gateway answers each event with
//! [`UploadEvent::Result`].

use serde::{Deserialize, Serialize};

/// One step of a chunked upload conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    /// Upload handle assigned by the gateway's `Start` result; absent on the
    /// opening event.
    pub uid: Option<u64>,
    /// The step itself.
    pub event: UploadEvent,
}

/// Upload conversation steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadEvent {
    /// Open an upload.
    Start {
        /// Destination file name.
        name: String,
        /// Total file size in bytes.
        size: u64,
        /// Number of parts the peer will send.
        chunks: u32,
        /// Kind of file being uploaded.
        file_type: FileType,
    },
    /// One chunk of file content.
    Part {
        /// Zero-based part number; parts must arrive in order.
        part_no: u32,
        /// Chunk bytes.
        chunk: Vec<u8>,
    },
    /// Close the upload.
    Finish {
        /// SHA-256 digest of the complete file.
        checksum: Vec<u8>,
    },
    /// Gateway verdict for the preceding event.
    Result(UploadResult),
}

/// Kinds of uploadable files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Firmware image destined for the flash store.
    Firmware,
}

/// Outcome of an upload step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadResult {
    /// Step accepted.
    Ok,
    /// Finish checksum did not match the received content.
    InvalidChecksum,
    /// Out-of-order part, unknown upload handle, or filesystem failure.
    IoError,
    /// A file with the requested name already exists.
    AlreadyExists,
}
