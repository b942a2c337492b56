use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::multistatus::{PROPFIND_BODY, normalize_etag, parse_multistatus};
use crate::watchdog::{Stalled, Watchdog};

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const NEXTCLOUD_DAV_PATH: &str = "remote.php/webdav/";

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed multistatus response: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("no transfer progress within {0:?}")]
    Timeout(Duration),
    #[error("unsupported HTTP method: {0}")]
    InvalidMethod(&'static str),
    #[error("url cannot carry a path: {0}")]
    InvalidBaseUrl(String),
    #[error("remote path contains unsupported component: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Flavour of WebDAV server; NextCloud and OwnCloud serve DAV below a fixed
/// sub-path of the configured URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerType {
    #[default]
    Generic,
    NextCloud,
    OwnCloud,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown server type: {0}")]
pub struct UnknownServerType(pub String);

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Generic => "Generic",
            ServerType::NextCloud => "NextCloud",
            ServerType::OwnCloud => "OwnCloud",
        }
    }

    pub fn dav_url(&self, url: &Url) -> Result<Url, DavError> {
        match self {
            ServerType::Generic => Ok(url.clone()),
            ServerType::NextCloud | ServerType::OwnCloud => {
                let mut base = url.clone();
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                Ok(base.join(NEXTCLOUD_DAV_PATH)?)
            }
        }
    }
}

impl FromStr for ServerType {
    type Err = UnknownServerType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "generic" | "webdav" => Ok(ServerType::Generic),
            "nextcloud" => Ok(ServerType::NextCloud),
            "owncloud" => Ok(ServerType::OwnCloud),
            _ => Err(UnknownServerType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    File,
    Dir,
}

/// Immediate child of a listed collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub resource_type: ResourceType,
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DavConfig {
    pub url: Url,
    pub server_type: ServerType,
    pub username: String,
    pub password: String,
    pub remote_root: String,
    pub disable_certificate_check: bool,
    pub inactivity_timeout: Duration,
}

impl DavConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            server_type: ServerType::Generic,
            username: String::new(),
            password: String::new(),
            remote_root: String::new(),
            disable_certificate_check: false,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    remote_root: String,
    username: String,
    password: String,
    inactivity: Duration,
}

impl DavClient {
    pub fn new(config: DavConfig) -> Result<Self, DavError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.disable_certificate_check)
            .build()?;
        let base_url = config.server_type.dav_url(&config.url)?;
        if base_url.cannot_be_a_base() {
            return Err(DavError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http,
            base_url,
            remote_root: config.remote_root,
            username: config.username,
            password: config.password,
            inactivity: config.inactivity_timeout,
        })
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, DavError> {
        Self::new(DavConfig::new(Url::parse(base_url)?))
    }

    /// Same connection settings, addressing paths below `remote_root`.
    pub fn with_remote_root(&self, remote_root: impl Into<String>) -> Self {
        Self {
            remote_root: remote_root.into(),
            ..self.clone()
        }
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Succeeds when the root answers a `PROPFIND` with `207 Multi-Status`.
    pub async fn check_connection(&self) -> Result<(), DavError> {
        let url = self.endpoint("", true)?;
        let watchdog = Watchdog::new(self.inactivity);
        self.watched(&watchdog, async {
            let response = self.send(self.propfind(url, "0")?, &watchdog).await?;
            Self::expect_multistatus(response).await?;
            Ok(())
        })
        .await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<Resource>, DavError> {
        let url = self.endpoint(path, true)?;
        let own_path = decoded_path(url.path());
        let watchdog = Watchdog::new(self.inactivity);
        let body = self
            .watched(&watchdog, async {
                let response = self.send(self.propfind(url, "1")?, &watchdog).await?;
                Self::expect_multistatus(response).await
            })
            .await?;

        let mut items = Vec::new();
        for response in parse_multistatus(&body)? {
            let href_path = href_path(&response.href);
            let href_path = href_path.trim_end_matches('/');
            if href_path == own_path.trim_end_matches('/') {
                continue;
            }
            let Some(name) = href_path.rsplit('/').next().filter(|name| !name.is_empty()) else {
                continue;
            };
            items.push(Resource {
                name: name.to_string(),
                resource_type: if response.is_collection {
                    ResourceType::Dir
                } else {
                    ResourceType::File
                },
                etag: response.etag,
            });
        }
        Ok(items)
    }

    /// Change tag of a single entry, `None` when it does not exist.
    pub async fn etag(&self, path: &str) -> Result<Option<String>, DavError> {
        let url = self.endpoint(path, false)?;
        let watchdog = Watchdog::new(self.inactivity);
        let body = self
            .watched(&watchdog, async {
                let response = self.send(self.propfind(url, "0")?, &watchdog).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                Self::expect_multistatus(response).await.map(Some)
            })
            .await?;
        let Some(body) = body else {
            return Ok(None);
        };
        Ok(parse_multistatus(&body)?
            .into_iter()
            .next()
            .and_then(|response| response.etag))
    }

    pub async fn download_bytes(&self, path: &str) -> Result<Vec<u8>, DavError> {
        let url = self.endpoint(path, false)?;
        let watchdog = Watchdog::new(self.inactivity);
        self.watched(&watchdog, async {
            let response = self
                .send(self.request(Method::GET, url), &watchdog)
                .await?;
            let response = Self::check_status(response).await?;
            let mut stream = response.bytes_stream();
            let mut out = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                watchdog.touch();
                out.extend_from_slice(&chunk);
            }
            Ok(out)
        })
        .await
    }

    /// Streams a remote file into `target`. Data lands in a hidden partial
    /// file first and only replaces `target` once complete.
    pub async fn download_to_path(&self, path: &str, target: &Path) -> Result<(), DavError> {
        let url = self.endpoint(path, false)?;
        let partial = partial_path(target);
        let watchdog = Watchdog::new(self.inactivity);
        let result = self
            .watched(&watchdog, async {
                let response = self
                    .send(self.request(Method::GET, url), &watchdog)
                    .await?;
                let response = Self::check_status(response).await?;
                Self::stream_to_file(response, &partial, &watchdog).await?;
                tokio::fs::rename(&partial, target).await?;
                Ok(())
            })
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }

    /// Uploads `source` and returns the new change tag if the server sent one.
    pub async fn upload_from_path(
        &self,
        source: &Path,
        path: &str,
    ) -> Result<Option<String>, DavError> {
        let url = self.endpoint(path, false)?;
        let watchdog = Watchdog::new(self.inactivity);
        let response = self
            .watched(&watchdog, async {
                let file = tokio::fs::File::open(source).await?;
                let len = file.metadata().await?.len();
                let progress = watchdog.clone();
                let stream = ReaderStream::new(file).inspect(move |_| progress.touch());
                let request = self
                    .request(Method::PUT, url)
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream));
                let response = self.send(request, &watchdog).await?;
                Self::check_status(response).await
            })
            .await?;
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag)
            .filter(|etag| !etag.is_empty()))
    }

    /// `MKCOL`; an existing collection (405) is not an error.
    pub async fn create_folder(&self, path: &str) -> Result<(), DavError> {
        let url = self.endpoint(path, true)?;
        let request = self.request(dav_method("MKCOL")?, url);
        let watchdog = Watchdog::new(self.inactivity);
        self.watched(&watchdog, async {
            let response = self.send(request, &watchdog).await?;
            if response.status() == StatusCode::METHOD_NOT_ALLOWED {
                return Ok(());
            }
            Self::check_status(response).await?;
            Ok(())
        })
        .await
    }

    /// Deletes a file or collection; a missing entry (404) is not an error.
    pub async fn delete_resource(&self, path: &str) -> Result<(), DavError> {
        let url = self.endpoint(path, false)?;
        let watchdog = Watchdog::new(self.inactivity);
        self.watched(&watchdog, async {
            let response = self
                .send(self.request(Method::DELETE, url), &watchdog)
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Self::check_status(response).await?;
            Ok(())
        })
        .await
    }

    async fn watched<T>(
        &self,
        watchdog: &Watchdog,
        call: impl Future<Output = Result<T, DavError>>,
    ) -> Result<T, DavError> {
        watchdog
            .guard(call)
            .await
            .map_err(|Stalled(window)| DavError::Timeout(window))?
    }

    async fn send(
        &self,
        request: RequestBuilder,
        watchdog: &Watchdog,
    ) -> Result<reqwest::Response, DavError> {
        let response = request.send().await?;
        watchdog.touch();
        Ok(response)
    }

    async fn stream_to_file(
        response: reqwest::Response,
        partial: &Path,
        watchdog: &Watchdog,
    ) -> Result<(), DavError> {
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            watchdog.touch();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        if self.username.is_empty() && self.password.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    fn propfind(&self, url: Url, depth: &'static str) -> Result<RequestBuilder, DavError> {
        Ok(self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", HeaderValue::from_static(depth))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/xml; charset=utf-8"),
            )
            .body(PROPFIND_BODY))
    }

    fn endpoint(&self, path: &str, collection: bool) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DavError::InvalidBaseUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            for part in self
                .remote_root
                .split('/')
                .chain(path.split('/'))
                .filter(|part| !part.is_empty() && *part != ".")
            {
                if part == ".." {
                    return Err(DavError::InvalidPath(path.to_string()));
                }
                segments.push(part);
            }
            if collection {
                segments.push("");
            }
        }
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Status { status, body })
        }
    }

    async fn expect_multistatus(response: reqwest::Response) -> Result<String, DavError> {
        if response.status() == StatusCode::MULTI_STATUS {
            Ok(response.text().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Status { status, body })
        }
    }
}

impl DavError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Status { status, .. } => Some(classify_api_status(*status)),
            DavError::Timeout(_) => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DavError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn dav_method(name: &'static str) -> Result<Method, DavError> {
    Method::from_bytes(name.as_bytes()).map_err(|_| DavError::InvalidMethod(name))
}

fn decoded_path(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Servers answer with either an absolute path or a full URL in `<href>`.
fn href_path(href: &str) -> String {
    match Url::parse(href) {
        Ok(url) => decoded_path(url.path()),
        Err(_) => decoded_path(href),
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str, root: &str) -> DavClient {
        DavClient::with_base_url(base)
            .unwrap()
            .with_remote_root(root)
    }

    #[test]
    fn endpoint_joins_root_and_path() {
        let client = client("https://dav.example/dav", "/Tasks/lib.otl");
        let url = client.endpoint("/2024/3/item one.json", false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example/dav/Tasks/lib.otl/2024/3/item%20one.json"
        );
        let dir = client.endpoint("/2024", true).unwrap();
        assert_eq!(dir.as_str(), "https://dav.example/dav/Tasks/lib.otl/2024/");
    }

    #[test]
    fn endpoint_rejects_parent_components() {
        let client = client("https://dav.example/", "");
        assert!(matches!(
            client.endpoint("/../secret", false),
            Err(DavError::InvalidPath(_))
        ));
    }

    #[test]
    fn nextcloud_base_url_appends_dav_path() {
        let url = Url::parse("https://cloud.example/nc").unwrap();
        assert_eq!(
            ServerType::NextCloud.dav_url(&url).unwrap().as_str(),
            "https://cloud.example/nc/remote.php/webdav/"
        );
        assert_eq!(
            ServerType::Generic.dav_url(&url).unwrap().as_str(),
            "https://cloud.example/nc"
        );
    }

    #[test]
    fn server_type_parses_case_insensitively() {
        assert_eq!("nextcloud".parse::<ServerType>(), Ok(ServerType::NextCloud));
        assert_eq!("OwnCloud".parse::<ServerType>(), Ok(ServerType::OwnCloud));
        assert_eq!(
            ServerType::Generic.as_str().parse::<ServerType>(),
            Ok(ServerType::Generic)
        );
        assert!("ftp".parse::<ServerType>().is_err());
    }

    #[test]
    fn partial_path_is_hidden_sibling() {
        assert_eq!(
            partial_path(Path::new("/root/2024/3/item.json")),
            PathBuf::from("/root/2024/3/.item.json.partial")
        );
    }

    #[test]
    fn classification_matches_status() {
        let err = DavError::Status {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
        assert!(!err.is_retryable());
        let err = DavError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(DavError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!err.is_not_found());
        let missing = DavError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(missing.is_not_found());
        assert_eq!(missing.classification(), Some(ApiErrorClass::Permanent));
    }
}
