//! In-memory drive backend for tests
//!
//! Speaks the same wire protocol as the real service (metadata, object and
//! flat list endpoints keyed by the base64 object id) on top of a
//! `BTreeMap`, and lets tests inject connection failures, rejected tokens,
//! listing timeouts and interrupted uploads.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use super::auth::{StaticToken, TokenCache};
use super::executor::{HttpRequest, HttpResponse, RequestExecutor, Transport, TransportError};
use super::http_retry::HttpRetryConfig;
use super::request::path_from_object_id;
use super::{DirEntry, DirectoryListing, FileEntry, Method};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    requests: Vec<HttpRequest>,
    rejected_tokens: HashSet<String>,
    pending_failures: u32,
    failed_sends: u32,
    list_timeouts: HashSet<String>,
    put_budget: Option<usize>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

fn json_response<T: serde::Serialize>(status: u16, value: &T) -> HttpResponse {
    HttpResponse {
        status,
        body: serde_json::to_vec(value).unwrap_or_default(),
    }
}

fn empty(status: u16) -> HttpResponse {
    HttpResponse { status, body: Vec::new() }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executor over this backend with a fixed token and instant retries
    pub fn executor(self: &Arc<Self>) -> Arc<RequestExecutor> {
        Arc::new(RequestExecutor::new(
            "https://storage.test",
            Arc::new(TokenCache::new(Arc::new(StaticToken::new("test-token")))),
            self.clone(),
            HttpRetryConfig::immediate(2),
        ))
    }

    pub fn insert_object(&self, path: &str, body: &[u8]) {
        self.lock().objects.insert(path.to_string(), body.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(path).cloned()
    }

    pub fn remove_object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.remove(path)
    }

    pub fn object_paths(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    /// Requests that hit the given endpoint (`/metadata`, `/object`, `/sync/list`)
    pub fn requests_to(&self, endpoint: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.url.path() == endpoint)
            .count()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Make the next `n` sends fail at the connection level
    pub fn fail_next_sends(&self, n: u32) {
        self.lock().pending_failures = n;
    }

    pub fn failed_sends(&self) -> u32 {
        self.lock().failed_sends
    }

    /// Answer `401` for requests carrying this bearer token
    pub fn reject_token(&self, token: &str) {
        self.lock().rejected_tokens.insert(token.to_string());
    }

    /// Make the flat list endpoint report a server-side timeout for this directory
    pub fn time_out_listing(&self, path: &str) {
        self.lock().list_timeouts.insert(path.trim_end_matches('/').to_string());
    }

    /// Allow only `n` more object uploads; later PUTs fail at the connection level
    pub fn limit_object_puts(&self, n: Option<usize>) {
        self.lock().put_budget = n;
    }

    fn list_one_level(state: &State, dir: &str) -> Option<DirectoryListing> {
        let prefix = format!("{}/", dir);
        let mut listing = DirectoryListing::default();
        let mut seen_dirs = BTreeSet::new();
        for (key, body) in state.objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => listing
                    .files
                    .push(FileEntry::new(rest, key.clone(), body.len() as u64)),
                Some((child, _)) => {
                    if seen_dirs.insert(child.to_string()) {
                        listing.directories.push(DirEntry {
                            name: child.to_string(),
                            path: format!("{}{}", prefix, child),
                        });
                    }
                }
            }
        }
        if listing.is_empty() {
            None
        } else {
            Some(listing)
        }
    }

    fn list_flat(state: &State, dir: &str) -> Vec<FileEntry> {
        let prefix = format!("{}/", dir);
        state
            .objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, body)| FileEntry::new(base_name(key), key.clone(), body.len() as u64))
            .collect()
    }

    fn route(state: &mut State, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let Some(path) = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "p")
            .and_then(|(_, v)| path_from_object_id(&v))
        else {
            return Ok(empty(400));
        };
        let dir = path.trim_end_matches('/').to_string();

        match (request.url.path(), request.method) {
            ("/metadata", Method::Get) => Ok(match Self::list_one_level(state, &dir) {
                Some(listing) => json_response(200, &listing),
                None => empty(404),
            }),
            ("/sync/list", Method::Get) => {
                if state.list_timeouts.contains(&dir) {
                    return Ok(HttpResponse {
                        status: 504,
                        body: b"Gateway Timeout".to_vec(),
                    });
                }
                let files = Self::list_flat(state, &dir);
                Ok(if files.is_empty() { empty(404) } else { json_response(200, &files) })
            }
            ("/object", Method::Get) => Ok(match state.objects.get(&path) {
                Some(body) => HttpResponse { status: 200, body: body.clone() },
                None => empty(404),
            }),
            ("/object", Method::Put) => {
                if let Some(budget) = state.put_budget.as_mut() {
                    if *budget == 0 {
                        state.failed_sends += 1;
                        return Err(TransportError::Connection("connection reset by peer".to_string()));
                    }
                    *budget -= 1;
                }
                state
                    .objects
                    .insert(path, request.body.clone().unwrap_or_default());
                Ok(empty(201))
            }
            ("/object", Method::Delete) => Ok(match state.objects.remove(&path) {
                Some(_) => empty(204),
                None => empty(404),
            }),
            _ => Ok(empty(400)),
        }
    }
}

#[async_trait]
impl Transport for MemoryBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            state.failed_sends += 1;
            return Err(TransportError::Connection("connection refused".to_string()));
        }

        let token = request
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string();
        if state.rejected_tokens.contains(&token) {
            return Ok(empty(401));
        }

        let response = Self::route(&mut state, &request)?;
        match request.max_body_bytes {
            Some(limit) if response.body.len() as u64 > limit => Err(TransportError::BodyTooLarge { limit }),
            _ => Ok(response),
        }
    }
}
