//! Upload bodies.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{CourierError, Result};
use crate::http::{MultipartFormData, UrlRequest};
use crate::logging::targets;
use crate::transport::{BodyStream, TaskKind};

/// What an upload sends.
pub enum UploadSource {
    /// An in-memory body.
    Data(Bytes),
    /// The contents of a file.
    File(PathBuf),
    /// A body stream, handed to the transport when it asks for one.
    Stream(BodyStream),
    /// A multipart form, encoded in memory or spilled to disk depending on
    /// its size.
    Multipart(MultipartFormData),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Multipart(form) => f.debug_tuple("Multipart").field(&form.part_count()).finish(),
        }
    }
}

/// The resolved body of an upload: what the transport is asked to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Uploadable {
    Data(Bytes),
    File { path: PathBuf, remove_on_finish: bool },
    Stream,
}

impl Uploadable {
    pub(crate) fn task_kind(&self) -> TaskKind {
        match self {
            Self::Data(data) => TaskKind::UploadData(data.clone()),
            Self::File { path, .. } => TaskKind::UploadFile(path.clone()),
            Self::Stream => TaskKind::UploadStream,
        }
    }

    /// Delete a spilled multipart file.
    pub(crate) fn cleanup(&self) {
        if let Self::File {
            path,
            remove_on_finish: true,
        } = self
            && let Err(err) = fs::remove_file(path)
        {
            warn!(target: targets::REQUEST, path = %path.display(), error = %err, "failed to remove multipart file");
        }
    }
}

/// A source resolved into what the transport sends.
pub(crate) struct ResolvedUpload {
    pub(crate) uploadable: Uploadable,
    pub(crate) stream: Option<BodyStream>,
    pub(crate) content_type: Option<String>,
}

/// Upload bookkeeping kept on the request.
///
/// The source is resolved once; retries reuse the resolved body.
pub(crate) struct UploadState {
    source: Option<UploadSource>,
    resolved: Option<(Uploadable, Option<String>)>,
    stream: Option<BodyStream>,
}

impl UploadState {
    pub(crate) fn new(source: UploadSource) -> Self {
        Self {
            source: Some(source),
            resolved: None,
            stream: None,
        }
    }

    pub(crate) fn take_source(&mut self) -> Option<UploadSource> {
        self.source.take()
    }

    pub(crate) fn uploadable(&self) -> Option<&Uploadable> {
        self.resolved.as_ref().map(|(uploadable, _)| uploadable)
    }

    pub(crate) fn store(&mut self, resolved: ResolvedUpload) {
        if resolved.stream.is_some() {
            self.stream = resolved.stream;
        }
        self.resolved = Some((resolved.uploadable, resolved.content_type));
    }

    /// Add the body's headers to `request` and return the task kind, once
    /// the source has been resolved.
    pub(crate) fn apply_to(&self, request: &mut UrlRequest) -> Result<Option<TaskKind>> {
        let Some((uploadable, content_type)) = &self.resolved else {
            return Ok(None);
        };
        if let Some(content_type) = content_type {
            request.set_header("Content-Type", content_type)?;
        }
        Ok(Some(uploadable.task_kind()))
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self.uploadable(), Some(Uploadable::Stream))
            || matches!(self.source, Some(UploadSource::Stream(_)))
    }

    pub(crate) fn take_stream(&mut self) -> Option<BodyStream> {
        self.stream.take()
    }
}

/// Resolve `source` into what the transport sends.
///
/// Multipart forms at or above `threshold` bytes are written to a file
/// under `temp_dir` instead of being held in memory.
pub(crate) fn create_uploadable(
    source: UploadSource,
    threshold: u64,
    temp_dir: &Path,
) -> Result<ResolvedUpload> {
    let plain = |uploadable| ResolvedUpload {
        uploadable,
        stream: None,
        content_type: None,
    };

    match source {
        UploadSource::Data(data) => Ok(plain(Uploadable::Data(data))),
        UploadSource::File(path) => Ok(plain(Uploadable::File {
            path,
            remove_on_finish: false,
        })),
        UploadSource::Stream(stream) => Ok(ResolvedUpload {
            uploadable: Uploadable::Stream,
            stream: Some(stream),
            content_type: None,
        }),
        UploadSource::Multipart(form) => {
            let content_type = Some(form.content_type());
            let length = form.content_length();
            if length < threshold {
                return Ok(ResolvedUpload {
                    uploadable: Uploadable::Data(form.encode()?),
                    stream: None,
                    content_type,
                });
            }

            let directory = temp_dir.join("courier.multipart");
            fs::create_dir_all(&directory).map_err(|err| {
                CourierError::MultipartEncodingFailed(format!("{}: {err}", directory.display()))
            })?;
            let path = directory.join(format!("{:016x}", rand::thread_rng().r#gen::<u64>()));
            debug!(
                target: targets::REQUEST,
                bytes = length,
                path = %path.display(),
                "encoding multipart form to disk"
            );
            if let Err(err) = form.write_encoded_data(&path) {
                let _ = fs::remove_file(&path);
                return Err(err);
            }
            Ok(ResolvedUpload {
                uploadable: Uploadable::File {
                    path,
                    remove_on_finish: true,
                },
                stream: None,
                content_type,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;

    fn request() -> UrlRequest {
        UrlRequest::parse(HttpMethod::Post, "https://upload.test/").unwrap()
    }

    #[test]
    fn test_small_multipart_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let form = MultipartFormData::with_boundary("b").text("name", "value");
        let expected = form.encode().unwrap();

        let mut state = UploadState::new(UploadSource::Multipart(form));
        let source = state.take_source().unwrap();
        state.store(create_uploadable(source, 1024, dir.path()).unwrap());

        assert_eq!(state.uploadable(), Some(&Uploadable::Data(expected)));

        // Every attempt gets the multipart header again.
        for _ in 0..2 {
            let mut req = request();
            let kind = state.apply_to(&mut req).unwrap();
            assert!(matches!(kind, Some(TaskKind::UploadData(_))));
            assert_eq!(req.header("content-type"), Some("multipart/form-data; boundary=b"));
        }
    }

    #[test]
    fn test_large_multipart_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let form = MultipartFormData::with_boundary("b").data(
            "blob",
            vec![7u8; 4096],
            Some("blob.bin"),
            Some("application/octet-stream"),
        );
        let expected = form.encode().unwrap();

        let resolved = create_uploadable(UploadSource::Multipart(form), 1024, dir.path()).unwrap();
        let uploadable = resolved.uploadable;

        let Uploadable::File { path, remove_on_finish } = &uploadable else {
            panic!("expected a file upload, got {uploadable:?}");
        };
        assert!(remove_on_finish);
        assert!(path.starts_with(dir.path()));
        assert_eq!(fs::read(path).unwrap(), expected);

        uploadable.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn test_plain_sources() {
        let dir = tempfile::tempdir().unwrap();

        let data = create_uploadable(UploadSource::Data(Bytes::from_static(b"x")), 0, dir.path())
            .unwrap();
        assert!(matches!(data.uploadable.task_kind(), TaskKind::UploadData(_)));
        assert!(data.content_type.is_none());

        let file = dir.path().join("in.txt");
        fs::write(&file, b"hello").unwrap();
        let resolved = create_uploadable(UploadSource::File(file.clone()), 0, dir.path()).unwrap();
        resolved.uploadable.cleanup();
        assert!(file.exists(), "caller-owned files are never removed");
    }

    #[test]
    fn test_stream_source() {
        let stream: BodyStream = Box::pin(futures_util::stream::empty());
        let mut state = UploadState::new(UploadSource::Stream(stream));
        assert!(state.is_stream());
        assert!(state.take_stream().is_none());

        let source = state.take_source().unwrap();
        state.store(create_uploadable(source, 0, Path::new("/tmp")).unwrap());
        assert!(state.is_stream());
        assert!(state.take_stream().is_some());
        assert!(state.take_stream().is_none());
    }
}
