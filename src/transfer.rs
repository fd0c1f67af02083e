use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use bytes::Bytes;
use regex::Regex;
use reqwest::{header::HeaderMap, Method};

use crate::{RelayError, RequestOptions, Result};

/// Transfer progress snapshot passed to progress callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
    /// Rounded percentage, `0` while the total is unknown.
    pub percent: u8,
}

impl Progress {
    pub fn new(loaded: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => ((loaded.min(total) * 100 + total / 2) / total) as u8,
            _ => 0,
        };
        Self {
            loaded,
            total,
            percent,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// A file to send in a multipart upload.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Reads a file from disk, naming the part after the file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            RelayError::invalid_request(format!("cannot read {}: {err}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        Ok(Self::new(file_name, bytes))
    }
}

/// A multipart form: file parts plus plain text fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultipartForm {
    pub files: Vec<(String, UploadFile)>,
    pub fields: Vec<(String, String)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, field: impl Into<String>, file: UploadFile) -> Self {
        self.files.push((field.into(), file));
        self
    }

    pub fn text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    /// Total size of all file parts in bytes.
    pub fn file_bytes(&self) -> u64 {
        self.files.iter().map(|(_, file)| file.bytes.len() as u64).sum()
    }
}

/// What to upload: loose files, which get wrapped under the upload field
/// name, or a form that is sent as-is.
#[derive(Clone, Debug)]
pub enum UploadSource {
    Files(Vec<UploadFile>),
    Form(MultipartForm),
}

impl From<UploadFile> for UploadSource {
    fn from(file: UploadFile) -> Self {
        Self::Files(vec![file])
    }
}

impl From<Vec<UploadFile>> for UploadSource {
    fn from(files: Vec<UploadFile>) -> Self {
        Self::Files(files)
    }
}

impl From<MultipartForm> for UploadSource {
    fn from(form: MultipartForm) -> Self {
        Self::Form(form)
    }
}

impl UploadSource {
    pub(crate) fn into_form(
        self,
        field_name: &str,
        extra: Vec<(String, String)>,
    ) -> MultipartForm {
        match self {
            Self::Form(form) => form,
            Self::Files(files) => MultipartForm {
                files: files
                    .into_iter()
                    .map(|file| (field_name.to_owned(), file))
                    .collect(),
                fields: extra,
            },
        }
    }
}

/// Options for [`RelayClient::upload`](crate::RelayClient::upload).
#[derive(Clone)]
pub struct UploadOptions {
    /// Multipart field for loose files. Defaults to `file`.
    pub field_name: String,
    /// Extra text fields appended after the files.
    pub extra_data: Vec<(String, String)>,
    pub on_progress: Option<ProgressFn>,
    /// Dedup is off and the timeout is unset unless overridden here.
    pub request: RequestOptions,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            field_name: "file".to_owned(),
            extra_data: Vec::new(),
            on_progress: None,
            request: RequestOptions::default(),
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("field_name", &self.field_name)
            .field("extra_data", &self.extra_data)
            .field("on_progress", &self.on_progress.is_some())
            .field("request", &self.request)
            .finish()
    }
}

/// Options for [`RelayClient::download`](crate::RelayClient::download).
#[derive(Clone)]
pub struct DownloadOptions {
    /// Overrides the name taken from `Content-Disposition`.
    pub filename: Option<String>,
    /// `GET` (default) or `POST`.
    pub method: Method,
    pub query: Option<serde_json::Value>,
    /// Request body, only sent with `POST`.
    pub body: Option<serde_json::Value>,
    pub on_progress: Option<ProgressFn>,
    pub request: RequestOptions,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            filename: None,
            method: Method::GET,
            query: None,
            body: None,
            on_progress: None,
            request: RequestOptions::default(),
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("filename", &self.filename)
            .field("method", &self.method)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("on_progress", &self.on_progress.is_some())
            .field("request", &self.request)
            .finish()
    }
}

/// A downloaded file held in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Download {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl Download {
    /// Writes the file into `dir` under its resolved name and returns the
    /// full path.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let name = Path::new(&self.filename)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "download".into());
        let path = dir.as_ref().join(name);
        tokio::fs::write(&path, &self.bytes).await.map_err(|err| {
            RelayError::invalid_request(format!("cannot write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

/// Status and headers of a response whose body is not needed.
#[derive(Clone, Debug)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: HeaderMap,
}

static DISPOSITION_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*?=(?:UTF-8'')?["']?([^"';\n]+)"#)
        .expect("filename pattern is valid")
});

/// Extracts the file name from a `Content-Disposition` header value.
pub(crate) fn disposition_filename(disposition: &str) -> Option<String> {
    let captured = DISPOSITION_FILENAME.captures(disposition)?.get(1)?;
    let name = percent_decode(captured.as_str().trim());
    (!name.is_empty()).then_some(name)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let high = hex_digit(bytes[index + 1]);
            let low = hex_digit(bytes[index + 2]);
            if let (Some(high), Some(low)) = (high, low) {
                decoded.push((high << 4) | low);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
