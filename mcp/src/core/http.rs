//! HTTP client construction for persistent-stream backends.
//!
//! Applies outbound proxy settings, the bearer credential and extra headers
//! to a `reqwest` client that the rmcp SSE / streamable transports use.

use std::{collections::HashMap, time::Duration};

use super::config::OutboundProxyConfig;
use crate::error::{ProxyError, ProxyResult};

/// Socket connect bound for a single HTTP attempt; the overall connect
/// timeout still governs the backend.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Apply proxy configuration to a ClientBuilder
pub(crate) fn apply_proxy_to_builder(
    mut builder: reqwest::ClientBuilder,
    proxy_cfg: &OutboundProxyConfig,
) -> ProxyResult<reqwest::ClientBuilder> {
    if let Some(ref http_proxy) = proxy_cfg.http {
        let proxy = reqwest::Proxy::http(http_proxy)
            .map_err(|e| ProxyError::Config(format!("Invalid HTTP proxy: {}", e)))?;
        builder = builder.proxy(with_exclusions_and_auth(proxy, proxy_cfg));
    }

    if let Some(ref https_proxy) = proxy_cfg.https {
        let proxy = reqwest::Proxy::https(https_proxy)
            .map_err(|e| ProxyError::Config(format!("Invalid HTTPS proxy: {}", e)))?;
        builder = builder.proxy(with_exclusions_and_auth(proxy, proxy_cfg));
    }

    Ok(builder)
}

fn with_exclusions_and_auth(
    mut proxy: reqwest::Proxy,
    proxy_cfg: &OutboundProxyConfig,
) -> reqwest::Proxy {
    if let Some(ref no_proxy) = proxy_cfg.no_proxy {
        proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
    }
    if let (Some(username), Some(password)) = (&proxy_cfg.username, &proxy_cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }
    proxy
}

pub(crate) fn build_request_headers(
    token: Option<&str>,
    custom_headers: &HashMap<String, String>,
) -> ProxyResult<reqwest::header::HeaderMap> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| ProxyError::Config(format!("auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ProxyError::Config(format!("header name '{}': {}", key, e)))?,
            value
                .parse()
                .map_err(|e| ProxyError::Config(format!("header value for '{}': {}", key, e)))?,
        );
    }

    Ok(headers)
}

/// Build HTTP client with default headers.
pub(crate) fn build_http_client(
    proxy_config: Option<&OutboundProxyConfig>,
    token: Option<&str>,
    custom_headers: &HashMap<String, String>,
) -> ProxyResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(HTTP_CONNECT_TIMEOUT);

    if let Some(proxy_cfg) = proxy_config {
        builder = apply_proxy_to_builder(builder, proxy_cfg)?;
    }

    let req_headers = build_request_headers(token, custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| ProxyError::Config(format!("build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_include_bearer_and_custom() {
        let mut custom = HashMap::new();
        custom.insert("X-Api-Key".to_string(), "abc".to_string());

        let headers = build_request_headers(Some("tok"), &custom).unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer tok"
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "abc");
    }

    #[test]
    fn test_headers_reject_invalid_name() {
        let mut custom = HashMap::new();
        custom.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(
            build_request_headers(None, &custom),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_apply_proxy_to_builder_with_http() {
        let proxy = OutboundProxyConfig {
            http: Some("http://proxy.example.com:8080".to_string()),
            no_proxy: Some("localhost,127.0.0.1".to_string()),
            ..Default::default()
        };

        let builder = reqwest::Client::builder();
        let result = apply_proxy_to_builder(builder, &proxy);
        assert!(result.is_ok(), "Should apply proxy to builder");
        assert!(result.unwrap().build().is_ok(), "Should build client");
    }

    #[test]
    fn test_apply_proxy_to_builder_with_auth() {
        let proxy = OutboundProxyConfig {
            https: Some("http://proxy.example.com:8080".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Default::default()
        };

        let result = apply_proxy_to_builder(reqwest::Client::builder(), &proxy);
        assert!(result.is_ok(), "Should apply proxy with authentication");
        assert!(result.unwrap().build().is_ok(), "Should build client");
    }

    #[test]
    fn test_apply_proxy_to_builder_invalid_url() {
        let proxy = OutboundProxyConfig {
            http: Some("://invalid".to_string()),
            ..Default::default()
        };

        let result = apply_proxy_to_builder(reqwest::Client::builder(), &proxy);
        assert!(result.is_err(), "Should fail with invalid proxy URL");
    }

    #[test]
    fn test_build_http_client_without_proxy() {
        let client = build_http_client(None, Some("tok"), &HashMap::new());
        assert!(client.is_ok());
    }
}
