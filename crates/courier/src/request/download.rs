//! Download destinations and resume data.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use url::Url;

use crate::error::{CourierError, Result};
use crate::http::HttpResponse;

/// How a finished download is moved into place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Create missing parent directories of the destination.
    pub create_intermediate_directories: bool,
    /// Replace a file already at the destination.
    pub remove_previous_file: bool,
}

impl DownloadOptions {
    /// Neither option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create missing parent directories.
    pub fn create_intermediate_directories(mut self) -> Self {
        self.create_intermediate_directories = true;
        self
    }

    /// Replace an existing file.
    pub fn remove_previous_file(mut self) -> Self {
        self.remove_previous_file = true;
        self
    }
}

/// Picks the final location of a download, given the temporary file and
/// the response head.
pub type Destination = Arc<dyn Fn(&Path, &HttpResponse) -> (PathBuf, DownloadOptions) + Send + Sync>;

/// A destination closure from a plain function.
pub fn destination<F>(f: F) -> Destination
where
    F: Fn(&Path, &HttpResponse) -> (PathBuf, DownloadOptions) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Save into `directory` under the response's suggested file name.
pub fn suggested_download_destination(
    directory: impl Into<PathBuf>,
    options: DownloadOptions,
) -> Destination {
    let directory = directory.into();
    Arc::new(move |_, response| (directory.join(response.suggested_filename()), options))
}

/// Everything needed to continue an interrupted download.
///
/// Produced by [`DownloadRequest::cancel_producing_resume_data`](super::DownloadRequest::cancel_producing_resume_data)
/// and consumed by [`Session::download_resuming`](crate::Session::download_resuming).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// URL of the interrupted download.
    pub url: Url,
    /// Bytes already in `partial_file`.
    pub bytes_received: u64,
    /// The partially downloaded file.
    pub partial_file: PathBuf,
    /// Entity tag of the partial content.
    pub etag: Option<String>,
    /// Last-Modified of the partial content.
    pub last_modified: Option<String>,
    /// Full size of the resource, if the server said.
    pub total_bytes: Option<u64>,
}

impl ResumeData {
    /// Serialize to opaque bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Restore from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The `Range` header value that continues the transfer.
    pub fn range_header(&self) -> String {
        format!("bytes={}-", self.bytes_received)
    }

    /// The `If-Range` validator, preferring the entity tag.
    pub fn if_range(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Move a finished download to `destination`, honouring `options`.
///
/// A rename is tried first; across file systems the file is copied instead.
pub(crate) fn move_to_destination(
    file: TempPath,
    destination: &Path,
    options: DownloadOptions,
) -> Result<PathBuf> {
    let fail = |err: io::Error| CourierError::DownloadDestinationFailed {
        path: destination.to_path_buf(),
        kind: err.kind(),
        message: err.to_string(),
    };

    if options.create_intermediate_directories
        && let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(fail)?;
    }

    if options.remove_previous_file && destination.exists() {
        fs::remove_file(destination).map_err(fail)?;
    }

    if destination.exists() {
        return Err(fail(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a file already exists at the destination",
        )));
    }

    match file.persist(destination) {
        Ok(()) => Ok(destination.to_path_buf()),
        Err(err) => {
            let file = err.path;
            fs::copy(&file, destination).map_err(fail)?;
            drop(file);
            Ok(destination.to_path_buf())
        }
    }
}
