use crate::api::{ApiError, AppState};
use crate::user_store::User;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use serde::Deserialize;
use tracing::{debug, error};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// An authenticated caller
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
}

impl Principal {
    /// Stream the caller reads and writes
    pub fn stream_id(&self) -> i64 {
        self.user.id
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.user.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Administrator role required".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyParam {
    key: Option<String>,
}

/// API key from the header, or the `key` query parameter devices use
pub fn extract_api_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    Query::<KeyParam>::try_from_uri(uri)
        .ok()
        .and_then(|Query(param)| param.key)
        .filter(|key| !key.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = extract_api_key(&parts.headers, &parts.uri)
            .ok_or_else(|| ApiError::Forbidden("Invalid API key".to_string()))?;

        let user = state.users.get_by_api_key(&key).await.map_err(|e| {
            error!(error = %e, "Failed to resolve API key");
            ApiError::from(e)
        })?;

        match user {
            Some(user) => {
                debug!(user_id = user.id, role = ?user.role, "Request authenticated");
                Ok(Principal { user })
            }
            None => Err(ApiError::Forbidden("Invalid API key".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_key_from_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("header-key"));
        let uri: Uri = "/pictures?key=query-key".parse().unwrap();

        assert_eq!(extract_api_key(&headers, &uri).as_deref(), Some("header-key"));
    }

    #[test]
    fn test_key_from_query() {
        let uri: Uri = "/upload_picture?key=123abc&limit=5".parse().unwrap();
        assert_eq!(
            extract_api_key(&HeaderMap::new(), &uri).as_deref(),
            Some("123abc")
        );
    }

    #[test]
    fn test_missing_or_empty_key() {
        let headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers, &"/pictures".parse().unwrap()), None);
        assert_eq!(extract_api_key(&headers, &"/pictures?key=".parse().unwrap()), None);
    }
}
