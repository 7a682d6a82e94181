//! HTTP client for the remote storage API.
//! Uses JSON-RPC style calls: `POST {base}/api/fs/{method}`.

use crate::error::RemoteError;
use crate::remote::{
    Downloaded, EntryKind, Listing, RemoteEntry, RemoteStorage, Revision, SpaceUsage, WriteMode,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::ops::Range;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Request timeout for a single call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Account information returned by the whoami endpoint.
#[derive(Debug, Deserialize)]
pub struct AccountInfo {
    #[serde(alias = "account_id", alias = "user_id", default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Entry as it appears on the wire.
#[derive(Debug, Deserialize)]
struct WireEntry {
    path: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    #[serde(default, alias = "bytes")]
    size: u64,
    #[serde(alias = "revision")]
    rev: String,
    #[serde(default)]
    modified: Option<String>,
}

impl From<WireEntry> for RemoteEntry {
    fn from(wire: WireEntry) -> Self {
        RemoteEntry {
            modified: wire.modified.as_deref().and_then(parse_time),
            path: wire.path,
            kind: wire.kind,
            size: wire.size,
            revision: Revision::new(wire.rev),
        }
    }
}

/// Bytes payload: `{"__type__":"bytes","data":"base64..."}`.
#[derive(Debug, Deserialize)]
struct BytesValue {
    #[serde(rename = "__type__")]
    #[allow(dead_code)]
    type_tag: String,
    data: String,
}

/// JSON-RPC response wrapper.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: Option<Value>,
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// RPC error codes used by the server for filesystem failures.
const RPC_NOT_FOUND: i32 = -32004;
const RPC_CONFLICT: i32 = -32009;
const RPC_ALREADY_EXISTS: i32 = -32010;
const RPC_NOT_EMPTY: i32 = -32011;

/// Parse a remote timestamp: RFC 3339, or the legacy
/// `Sat, 21 Aug 2010 22:31:20 +0000` form.
pub fn parse_time(s: &str) -> Option<SystemTime> {
    let parsed = chrono::DateTime::parse_from_rfc3339(s)
        .or_else(|_| chrono::DateTime::parse_from_rfc2822(s))
        .ok()?;
    let secs = u64::try_from(parsed.timestamp()).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Remote storage HTTP client.
pub struct CloudClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CloudClient {
    /// Create a new client authenticated by a bearer capability token.
    pub fn new(base_url: &str, token: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Map HTTP status code to RemoteError.
    fn status_to_error(status: reqwest::StatusCode, retry_after: Option<Duration>, body: String) -> RemoteError {
        match status.as_u16() {
            401 => RemoteError::AuthExpired,
            404 => RemoteError::NotFound(body),
            409 => RemoteError::Conflict(body),
            429 => RemoteError::RateLimited { retry_after },
            code => RemoteError::ServerError {
                status: code,
                message: body,
            },
        }
    }

    /// Map RPC-level errors (HTTP 200 with an `error` member).
    fn rpc_error(err: JsonRpcError) -> RemoteError {
        let lower = err.message.to_lowercase();
        match err.code {
            RPC_NOT_FOUND => RemoteError::NotFound(err.message),
            RPC_CONFLICT => RemoteError::Conflict(err.message),
            RPC_ALREADY_EXISTS => RemoteError::AlreadyExists(err.message),
            RPC_NOT_EMPTY => RemoteError::NotEmpty(err.message),
            _ if lower.contains("not found") => RemoteError::NotFound(err.message),
            _ if lower.contains("must not be empty") || lower.contains("not empty") => {
                RemoteError::NotEmpty(err.message)
            }
            _ => RemoteError::InvalidResponse(format!("RPC error {}: {}", err.code, err.message)),
        }
    }

    /// Classify a transport failure from `send()`.
    fn transport_error(e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout {
                duration: REQUEST_TIMEOUT,
                source: e,
            }
        } else if e.is_connect() {
            RemoteError::ConnectionRefused(e.to_string())
        } else {
            RemoteError::HttpError(e)
        }
    }

    fn retry_after(resp: &Response) -> Option<Duration> {
        resp.headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Build headers for requests.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        // Tokens are expected to be ASCII; a bad one surfaces as a 401.
        if let Ok(auth_value) = HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            headers.insert(AUTHORIZATION, auth_value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Send a JSON-RPC request and return the raw response after status checks.
    /// `Ok(None)` means HTTP 304.
    fn rpc_send(&self, method: &str, params: Value) -> Result<Option<Response>, RemoteError> {
        let url = format!("{}/api/fs/{}", self.base_url, method);

        let rpc_request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });
        debug!("POST {} {}", url, method);

        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&rpc_request)
            .send()
            .map_err(Self::transport_error)?;

        if resp.status().as_u16() == 304 {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = Self::retry_after(&resp);
            let text = resp.text().unwrap_or_default();
            return Err(Self::status_to_error(status, retry_after, text));
        }

        Ok(Some(resp))
    }

    /// Call a JSON-RPC method and decode its result.
    fn rpc_call<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> Result<T, RemoteError> {
        let resp = self
            .rpc_send(method, params)?
            .ok_or_else(|| RemoteError::InvalidResponse(format!("unexpected 304 from {}", method)))?;
        Self::decode(resp)
    }

    fn decode<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, RemoteError> {
        let rpc_resp: JsonRpcResponse<T> = serde_json::from_slice(&resp.bytes()?)?;

        if let Some(err) = rpc_resp.error {
            return Err(Self::rpc_error(err));
        }

        rpc_resp
            .result
            .ok_or_else(|| RemoteError::InvalidResponse("no result in response".to_string()))
    }

    /// Get current account info (used to verify the token at mount time).
    pub fn whoami(&self) -> Result<AccountInfo, RemoteError> {
        let url = format!("{}/api/auth/whoami", self.base_url);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .map_err(Self::transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = Self::retry_after(&resp);
            let text = resp.text().unwrap_or_default();
            return Err(Self::status_to_error(status, retry_after, text));
        }

        Ok(resp.json()?)
    }
}

#[derive(Debug, Deserialize)]
struct ListResult {
    entries: Vec<WireEntry>,
    #[serde(default)]
    hash: Option<String>,
}

impl RemoteStorage for CloudClient {
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let result: ListResult = self.rpc_call("list", json!({ "path": path }))?;
        Ok(result.entries.into_iter().map(RemoteEntry::from).collect())
    }

    fn list_if_changed(&self, path: &str, hash: Option<&str>) -> Result<Listing, RemoteError> {
        match self.rpc_send("list", json!({ "path": path, "hash": hash }))? {
            None => {
                debug!("Server returned 304 Not Modified for listing of {}", path);
                Ok(Listing::NotModified)
            }
            Some(resp) => {
                let result: ListResult = Self::decode(resp)?;
                Ok(Listing::Entries {
                    entries: result.entries.into_iter().map(RemoteEntry::from).collect(),
                    hash: result.hash,
                })
            }
        }
    }

    fn metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let entry: WireEntry = self.rpc_call("metadata", json!({ "path": path }))?;
        Ok(entry.into())
    }

    fn download(&self, path: &str, range: Range<u64>) -> Result<Downloaded, RemoteError> {
        #[derive(Deserialize)]
        struct DownloadResult {
            #[serde(alias = "revision")]
            rev: String,
            data: BytesValue,
        }

        let result: DownloadResult = self.rpc_call(
            "download",
            json!({
                "path": path,
                "offset": range.start,
                "length": range.end.saturating_sub(range.start)
            }),
        )?;
        let data = STANDARD.decode(&result.data.data)?;
        Ok(Downloaded {
            data,
            revision: Revision::new(result.rev),
        })
    }

    fn upload(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<RemoteEntry, RemoteError> {
        let mode = match mode {
            WriteMode::Add => json!("add"),
            WriteMode::Overwrite => json!("overwrite"),
            WriteMode::Update(rev) => json!({ "update": rev.as_str() }),
        };
        let entry: WireEntry = self.rpc_call(
            "upload",
            json!({
                "path": path,
                "mode": mode,
                "content": {
                    "__type__": "bytes",
                    "data": STANDARD.encode(data)
                }
            }),
        )?;
        Ok(entry.into())
    }

    fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let _: Value = self.rpc_call("delete", json!({ "path": path }))?;
        Ok(())
    }

    fn move_path(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError> {
        let entry: WireEntry = self.rpc_call(
            "move",
            json!({
                "from_path": from,
                "to_path": to
            }),
        )?;
        Ok(entry.into())
    }

    fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let entry: WireEntry = self.rpc_call("create_folder", json!({ "path": path }))?;
        Ok(entry.into())
    }

    fn space_usage(&self) -> Result<Option<SpaceUsage>, RemoteError> {
        #[derive(Deserialize)]
        struct UsageResult {
            used: u64,
            allocated: u64,
        }

        let usage: UsageResult = self.rpc_call("space_usage", json!({}))?;
        Ok(Some(SpaceUsage {
            used: usage.used,
            allocated: usage.allocated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        let rfc3339 = parse_time("2010-08-21T22:31:20Z").unwrap();
        let legacy = parse_time("Sat, 21 Aug 2010 22:31:20 +0000").unwrap();
        assert_eq!(rfc3339, legacy);
        assert!(parse_time("yesterday").is_none());
    }

    #[test]
    fn test_rpc_error_classification() {
        let err = CloudClient::rpc_error(JsonRpcError {
            code: -32000,
            message: "path/not_found".to_string(),
        });
        assert!(matches!(err, RemoteError::InvalidResponse(_)));

        let err = CloudClient::rpc_error(JsonRpcError {
            code: -32000,
            message: "File Not Found".to_string(),
        });
        assert!(err.is_not_found());

        let err = CloudClient::rpc_error(JsonRpcError {
            code: RPC_CONFLICT,
            message: "rev mismatch".to_string(),
        });
        assert!(err.is_conflict());

        let err = CloudClient::rpc_error(JsonRpcError {
            code: -32000,
            message: "Folder must not be empty".to_string(),
        });
        assert!(matches!(err, RemoteError::NotEmpty(_)));
    }

    #[test]
    fn test_wire_entry_conversion() {
        let wire: WireEntry = serde_json::from_value(json!({
            "path": "/docs/a.txt",
            "type": "file",
            "bytes": 42,
            "rev": "abc",
            "modified": "2024-01-02T03:04:05Z"
        }))
        .unwrap();
        let entry = RemoteEntry::from(wire);
        assert_eq!(entry.size, 42);
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.revision.as_str(), "abc");
        assert!(entry.modified.is_some());
    }
}
