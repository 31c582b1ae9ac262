//! Protocol messages
//!
//! The frames exchanged on a connection. Each call is a sequence of client
//! frames answered by zero or more data frames and exactly one `Status`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::responses::Status;
use crate::storage::FileMetadata;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Point in time as seconds and nanoseconds since the Unix epoch.
///
/// `nanos` is always in `0..1_000_000_000`, also for times before the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp {
                seconds: since.as_secs() as i64,
                nanos: since.subsec_nanos(),
            },
            Err(before) => {
                let before = before.duration();
                let seconds = -(before.as_secs() as i64);
                match before.subsec_nanos() {
                    0 => Timestamp { seconds, nanos: 0 },
                    nanos => Timestamp {
                        seconds: seconds - 1,
                        nanos: NANOS_PER_SEC - nanos,
                    },
                }
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        let nanos = Duration::from_nanos(u64::from(ts.nanos.min(NANOS_PER_SEC - 1)));
        if ts.seconds >= 0 {
            UNIX_EPOCH + Duration::from_secs(ts.seconds as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(ts.seconds.unsigned_abs()) + nanos
        }
    }
}

/// One upload message. Only the first message of a call names the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileResponse {
    pub chunk: Vec<u8>,
}

/// Paging fields are accepted for compatibility and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesRequest {
    pub page_size: i32,
    pub page_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<FileMetadata> for FileInfo {
    fn from(meta: FileMetadata) -> Self {
        FileInfo {
            name: meta.name,
            created_at: meta.created_at.into(),
            updated_at: meta.updated_at.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub files: Vec<FileInfo>,
}

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Upload(UploadFileRequest),
    /// Graceful end of an upload stream
    CloseSend,
    Download(DownloadFileRequest),
    ListFiles(ListFilesRequest),
    /// Abort the call in flight
    Cancel,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Upload(_) => "Upload",
            ClientFrame::CloseSend => "CloseSend",
            ClientFrame::Download(_) => "Download",
            ClientFrame::ListFiles(_) => "ListFiles",
            ClientFrame::Cancel => "Cancel",
        }
    }
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    UploadFile(UploadFileResponse),
    DownloadChunk(DownloadFileResponse),
    ListFiles(ListFilesResponse),
    Status(Status),
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::UploadFile(_) => "UploadFile",
            ServerFrame::DownloadChunk(_) => "DownloadChunk",
            ServerFrame::ListFiles(_) => "ListFiles",
            ServerFrame::Status(_) => "Status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_after_epoch() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        let ts = Timestamp::from(time);
        assert_eq!(ts, Timestamp { seconds: 1_700_000_000, nanos: 250 });
        assert_eq!(SystemTime::from(ts), time);
    }

    #[test]
    fn timestamp_before_epoch_keeps_nanos_positive() {
        let time = UNIX_EPOCH - Duration::new(1, 500_000_000);
        let ts = Timestamp::from(time);
        assert_eq!(ts, Timestamp { seconds: -2, nanos: 500_000_000 });
        assert_eq!(SystemTime::from(ts), time);
    }

    #[test]
    fn file_info_from_metadata() {
        let created = UNIX_EPOCH + Duration::from_secs(10);
        let updated = UNIX_EPOCH + Duration::from_secs(20);
        let info = FileInfo::from(FileMetadata {
            name: "a.txt".into(),
            created_at: created,
            updated_at: updated,
        });
        assert_eq!(info.name, "a.txt");
        assert_eq!(info.created_at.seconds, 10);
        assert_eq!(info.updated_at.seconds, 20);
    }

    #[test]
    fn frames_survive_postcard() {
        let frame = ClientFrame::Upload(UploadFileRequest {
            filename: "a.txt".into(),
            chunk: b"hello".to_vec(),
        });
        let bytes = postcard::to_stdvec(&frame).unwrap();
        let decoded: ClientFrame = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }
}
