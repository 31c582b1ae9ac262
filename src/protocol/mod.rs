//! Wire protocol
//!
//! Length-prefixed `postcard` frames carrying the upload, download and list calls.

pub mod codec;
pub mod handlers;
pub mod messages;
pub mod responses;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter};
pub use handlers::ConnectionHandler;
pub use messages::{
    ClientFrame, DownloadFileRequest, DownloadFileResponse, FileInfo, ListFilesRequest,
    ListFilesResponse, ServerFrame, Timestamp, UploadFileRequest, UploadFileResponse,
};
pub use responses::{Status, StatusCode};
