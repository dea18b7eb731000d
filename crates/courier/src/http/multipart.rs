//! `multipart/form-data` bodies.
//!
//! A [`MultipartFormData`] collects body parts and encodes them either into
//! memory or, for large forms, into a file on disk so the upload can stream
//! from it. The choice is made by the session using its configured memory
//! threshold.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use rand::Rng;

use crate::error::{CourierError, Result};

const CRLF: &str = "\r\n";

/// Default size above which a form is encoded to disk, in bytes.
pub const DEFAULT_ENCODING_MEMORY_THRESHOLD: u64 = 10_000_000;

#[derive(Clone, Debug)]
enum PartBody {
    Bytes(Bytes),
    File(PathBuf),
}

#[derive(Clone, Debug)]
struct BodyPart {
    headers: Vec<(String, String)>,
    body: PartBody,
    length: u64,
}

impl BodyPart {
    fn encoded_headers(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
        out
    }
}

/// A `multipart/form-data` body under construction.
#[derive(Clone, Debug)]
pub struct MultipartFormData {
    boundary: String,
    parts: Vec<BodyPart>,
}

impl Default for MultipartFormData {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormData {
    /// Create an empty form with a random boundary.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let boundary = format!("courier.boundary.{:08x}{:08x}", rng.r#gen::<u32>(), rng.r#gen::<u32>());
        Self::with_boundary(boundary)
    }

    /// Create an empty form with a fixed boundary.
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    /// The boundary separating parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The `Content-Type` header value for this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Append a text field.
    pub fn text(self, name: &str, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.data(name, Bytes::from(value), None, None)
    }

    /// Append an in-memory part with optional file name and MIME type.
    pub fn data(
        mut self,
        name: &str,
        data: impl Into<Bytes>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        self.parts.push(BodyPart {
            headers: content_headers(name, file_name, mime_type),
            body: PartBody::Bytes(data),
            length,
        });
        self
    }

    /// Append a file part.
    ///
    /// The file name defaults to the last path component and the MIME type is
    /// guessed from the extension. The file must exist and be a regular file.
    pub fn file(
        mut self,
        name: &str,
        path: impl AsRef<Path>,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            CourierError::MultipartEncodingFailed(format!("{}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(CourierError::MultipartEncodingFailed(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let derived_name = path.file_name().and_then(|n| n.to_str()).unwrap_or(name);
        let file_name = file_name.unwrap_or(derived_name);
        let mime = mime_type.unwrap_or_else(|| mime_type_for_path(path));

        self.parts.push(BodyPart {
            headers: content_headers(name, Some(file_name), Some(mime)),
            body: PartBody::File(path.to_path_buf()),
            length: metadata.len(),
        });
        Ok(self)
    }

    /// Total encoded size in bytes.
    pub fn content_length(&self) -> u64 {
        let mut total = 0u64;
        for (index, part) in self.parts.iter().enumerate() {
            total += self.boundary_line(index).len() as u64;
            total += part.encoded_headers().len() as u64;
            total += part.length;
        }
        total + self.final_boundary().len() as u64
    }

    /// Encode the whole form into memory.
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.content_length() as usize);
        for (index, part) in self.parts.iter().enumerate() {
            out.extend_from_slice(self.boundary_line(index).as_bytes());
            out.extend_from_slice(part.encoded_headers().as_bytes());
            match &part.body {
                PartBody::Bytes(data) => out.extend_from_slice(data),
                PartBody::File(path) => {
                    let mut contents = Vec::with_capacity(part.length as usize);
                    File::open(path)
                        .and_then(|mut f| f.read_to_end(&mut contents))
                        .map_err(|e| encoding_error(path, e))?;
                    out.extend_from_slice(&contents);
                }
            }
        }
        out.extend_from_slice(self.final_boundary().as_bytes());
        Ok(out.freeze())
    }

    /// Encode the form into a new file at `path`.
    ///
    /// Fails if the file already exists.
    pub fn write_encoded_data(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| encoding_error(path, e))?;
        self.write_to(&mut file).map_err(|e| encoding_error(path, e))?;
        file.flush().map_err(|e| encoding_error(path, e))
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        for (index, part) in self.parts.iter().enumerate() {
            out.write_all(self.boundary_line(index).as_bytes())?;
            out.write_all(part.encoded_headers().as_bytes())?;
            match &part.body {
                PartBody::Bytes(data) => out.write_all(data)?,
                PartBody::File(path) => {
                    let mut source = File::open(path)?;
                    io::copy(&mut source, out)?;
                }
            }
        }
        out.write_all(self.final_boundary().as_bytes())
    }

    fn boundary_line(&self, index: usize) -> String {
        if index == 0 {
            format!("--{}{CRLF}", self.boundary)
        } else {
            format!("{CRLF}--{}{CRLF}", self.boundary)
        }
    }

    fn final_boundary(&self) -> String {
        format!("{CRLF}--{}--{CRLF}", self.boundary)
    }
}

fn encoding_error(path: &Path, err: io::Error) -> CourierError {
    CourierError::MultipartEncodingFailed(format!("{}: {err}", path.display()))
}

fn content_headers(
    name: &str,
    file_name: Option<&str>,
    mime_type: Option<&str>,
) -> Vec<(String, String)> {
    let mut disposition = format!("form-data; name=\"{}\"", quote(name));
    if let Some(file_name) = file_name {
        disposition.push_str(&format!("; filename=\"{}\"", quote(file_name)));
    }

    let mut headers = vec![("Content-Disposition".to_string(), disposition)];
    if let Some(mime) = mime_type {
        headers.push(("Content-Type".to_string(), mime.to_string()));
    }
    headers
}

fn quote(value: &str) -> String {
    value.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

/// Guess a MIME type from a file extension.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_layout() {
        let form = MultipartFormData::with_boundary("XYZ")
            .text("name", "courier")
            .data("blob", &b"\x00\x01"[..], Some("blob.bin"), Some("application/octet-stream"));

        let encoded = form.encode().unwrap();
        let expected = concat!(
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"name\"\r\n\r\n",
            "courier",
            "\r\n--XYZ\r\n",
            "Content-Disposition: form-data; name=\"blob\"; filename=\"blob.bin\"\r\n",
            "Content-Type: application/octet-stream\r\n\r\n",
            "\x00\x01",
            "\r\n--XYZ--\r\n",
        );
        assert_eq!(&encoded[..], expected.as_bytes());
        assert_eq!(form.content_length(), encoded.len() as u64);
        assert_eq!(form.content_type(), "multipart/form-data; boundary=XYZ");
    }

    #[test]
    fn test_file_part_and_disk_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "hello").unwrap();

        let form = MultipartFormData::with_boundary("B")
            .file("upload", &source, None, None)
            .unwrap();
        let target = dir.path().join("form.bin");
        form.write_encoded_data(&target).unwrap();

        let written = std::fs::read(&target).unwrap();
        assert_eq!(written, form.encode().unwrap().to_vec());
        let text = String::from_utf8(written).unwrap();
        assert!(text.contains("filename=\"notes.txt\""));
        assert!(text.contains("Content-Type: text/plain"));

        // Refuses to overwrite.
        assert!(form.write_encoded_data(&target).is_err());
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = MultipartFormData::new()
            .file("f", dir.path().join("absent"), None, None)
            .unwrap_err();
        assert!(matches!(err, CourierError::MultipartEncodingFailed(_)));

        let err = MultipartFormData::new()
            .file("f", dir.path(), None, None)
            .unwrap_err();
        assert!(matches!(err, CourierError::MultipartEncodingFailed(_)));
    }

    #[test]
    fn test_random_boundaries_differ() {
        assert_ne!(
            MultipartFormData::new().boundary(),
            MultipartFormData::new().boundary()
        );
    }
}
