//! API Key 认证
//!
//! 提交与取消部署需要 `x-api-key`，状态查询类接口不需要

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// 认证 header 名称，客户端与服务端共用
pub const API_KEY_HEADER: &str = "x-api-key";

/// API Key 认证 Extractor
///
/// ```ignore
/// async fn submit_deployment(
///     _auth: RequireApiKey,
///     State(state): State<Arc<AppState>>,
/// ) -> Response { ... }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 未配置 API key 时拒绝所有请求
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    if expected_key.is_empty() {
        tracing::warn!("API key not configured, rejecting authenticated request");
        return Err(ApiError::unauthorized());
    }

    let provided_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided_key {
        Some(key) if key == expected_key => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!(header = API_KEY_HEADER, "Missing API key header");
            Err(ApiError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_api_key_success() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("test-key"));

        let result = verify_api_key(&headers, "test-key");
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_api_key_wrong_key() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong-key"));

        let result = verify_api_key(&headers, "test-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_api_key_missing() {
        let headers = HeaderMap::new();

        let result = verify_api_key(&headers, "test-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_api_key_unconfigured() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(""));

        let result = verify_api_key(&headers, "");
        assert!(result.is_err());
    }
}
