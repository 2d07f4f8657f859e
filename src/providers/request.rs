//! Drive API request descriptions
//!
//! A `DriveRequest` describes one REST call independently of the token and
//! the base URL; the executor turns it into a concrete HTTP request on every
//! attempt so retries can replay it.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};

use super::{ContentType, DriveError, Method};
use crate::path_translator::NAMESPACE_PREFIX;

/// Which endpoint a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// One level of a remote directory, split into files and directories
    Metadata,
    /// A single stored object
    Object,
    /// Flat recursive listing of all files below a directory
    DirectoryList,
}

/// Where the bearer token travels besides the Authorization header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    Header,
    QueryParameter,
}

#[derive(Debug, Clone)]
pub struct DriveRequest {
    kind: RequestKind,
    path: String,
    method: Method,
    body: Option<Vec<u8>>,
    content_type: ContentType,
    token_placement: TokenPlacement,
    response_limit: Option<u64>,
    extra_query: Vec<(String, String)>,
}

fn raise_if_invalid_drive_path(path: &str) -> Result<(), DriveError> {
    if !path.starts_with(NAMESPACE_PREFIX) {
        return Err(DriveError::PathConfiguration(format!(
            "Remote path '{}' must start with {}",
            path, NAMESPACE_PREFIX
        )));
    }
    Ok(())
}

/// Object id used in the `p` query parameter
pub fn object_id(path: &str) -> String {
    URL_SAFE.encode(path.as_bytes())
}

/// Inverse of [`object_id`]
pub fn path_from_object_id(id: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(id.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

impl DriveRequest {
    fn new(kind: RequestKind, path: &str, method: Method) -> Result<Self, DriveError> {
        raise_if_invalid_drive_path(path)?;
        Ok(Self {
            kind,
            path: path.to_string(),
            method,
            body: None,
            content_type: ContentType::Json,
            token_placement: TokenPlacement::Header,
            response_limit: None,
            extra_query: Vec::new(),
        })
    }

    /// List one directory level
    pub fn metadata(path: &str) -> Result<Self, DriveError> {
        Self::new(RequestKind::Metadata, path, Method::Get)
    }

    /// Flat listing of every file below `path`
    pub fn directory_list(path: &str) -> Result<Self, DriveError> {
        let mut request = Self::new(RequestKind::DirectoryList, path, Method::Get)?;
        request.extra_query.push(("type".to_string(), "file".to_string()));
        Ok(request)
    }

    /// Download an object; the token goes in the query string
    pub fn get_object(path: &str) -> Result<Self, DriveError> {
        let mut request = Self::new(RequestKind::Object, path, Method::Get)?;
        request.token_placement = TokenPlacement::QueryParameter;
        Ok(request)
    }

    /// Store an object, overwriting whatever is there
    pub fn put_object(path: &str, body: Vec<u8>) -> Result<Self, DriveError> {
        let mut request = Self::new(RequestKind::Object, path, Method::Put)?;
        request.body = Some(body);
        request.content_type = ContentType::OctetStream;
        Ok(request)
    }

    pub fn delete_object(path: &str) -> Result<Self, DriveError> {
        Self::new(RequestKind::Object, path, Method::Delete)
    }

    /// Refuse response bodies larger than `bytes`
    pub fn with_response_limit(mut self, bytes: u64) -> Self {
        self.response_limit = Some(bytes);
        self
    }

    /// Attach a body to any request; GET requests with a body are rejected by [`validate`](Self::validate)
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn response_limit(&self) -> Option<u64> {
        self.response_limit
    }

    /// Method-specific body rules
    pub fn validate(&self) -> Result<(), DriveError> {
        match self.method {
            Method::Get if self.body.is_some() => Err(DriveError::InvalidConfig(format!(
                "GET {} cannot carry a request body",
                self.path
            ))),
            Method::Delete if self.body.is_some() => Err(DriveError::InvalidConfig(format!(
                "DELETE {} cannot carry a request body",
                self.path
            ))),
            _ => Ok(()),
        }
    }

    /// Build the full request URL below `api_base`
    pub fn url(&self, api_base: &str, token: Option<&str>) -> Result<url::Url, DriveError> {
        let endpoint = match self.kind {
            RequestKind::Metadata => "metadata",
            RequestKind::Object => "object",
            RequestKind::DirectoryList => "sync/list",
        };
        let raw = format!("{}/{}", api_base.trim_end_matches('/'), endpoint);
        let mut url = url::Url::parse(&raw)
            .map_err(|e| DriveError::InvalidConfig(format!("Invalid API URL '{}': {}", raw, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("p", &object_id(&self.path));
            for (key, value) in &self.extra_query {
                query.append_pair(key, value);
            }
            if let (TokenPlacement::QueryParameter, Some(token)) = (self.token_placement, token) {
                query.append_pair("access_token", token);
            }
        }
        Ok(url)
    }
}

impl std::fmt::Display for DriveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?} {}", self.method, self.kind, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_paths_outside_namespace() {
        let err = DriveRequest::metadata("/Other/x").unwrap_err();
        assert!(matches!(err, DriveError::PathConfiguration(_)));
    }

    #[test]
    fn test_get_with_body_is_rejected() {
        let request = DriveRequest::get_object("/Drive/a").unwrap().with_body(vec![1]);
        assert!(request.validate().is_err());
        assert!(DriveRequest::put_object("/Drive/a", vec![1]).unwrap().validate().is_ok());
        assert!(DriveRequest::put_object("/Drive/a", vec![]).unwrap().validate().is_ok());
    }

    #[test]
    fn test_object_url_carries_token_in_query() {
        let request = DriveRequest::get_object("/Drive/docs/a b.txt").unwrap();
        let url = request.url("https://storage.test/", Some("tok")).unwrap();
        assert_eq!(url.path(), "/object");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0].0, "p");
        assert_eq!(path_from_object_id(&pairs[0].1).as_deref(), Some("/Drive/docs/a b.txt"));
        assert!(pairs.contains(&("access_token".to_string(), "tok".to_string())));
    }

    #[test]
    fn test_metadata_url_keeps_token_out_of_query() {
        let request = DriveRequest::metadata("/Drive/docs").unwrap();
        let url = request.url("https://storage.test", Some("tok")).unwrap();
        assert_eq!(url.path(), "/metadata");
        assert!(!url.query().unwrap_or_default().contains("access_token"));
    }

    #[test]
    fn test_only_limited_requests_carry_a_response_limit() {
        assert_eq!(DriveRequest::directory_list("/Drive/docs").unwrap().response_limit(), None);
        assert_eq!(DriveRequest::metadata("/Drive/docs").unwrap().response_limit(), None);
        let part = DriveRequest::get_object("/Drive/docs/a").unwrap().with_response_limit(2048);
        assert_eq!(part.response_limit(), Some(2048));
    }

    #[test]
    fn test_directory_list_url() {
        let request = DriveRequest::directory_list("/Drive/docs").unwrap();
        let url = request.url("https://storage.test", None).unwrap();
        assert_eq!(url.path(), "/sync/list");
        assert!(url.query_pairs().any(|(k, v)| k == "type" && v == "file"));
    }
}
