pub mod enrichment_queue;
pub mod error;
pub mod live;
pub mod metadata_cache;
pub mod resonite;
pub mod retry;
pub mod session_hash;
pub mod transport;
pub mod vrchat;

use error::ApiError;
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Shared HTTP client for all API requests to enable connection pooling
pub static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(5)
        .build()
        .expect("Failed to create HTTP client")
});

/// Send a GET request and decode the JSON body.
///
/// A 404 is `Ok(None)`; other failures map onto [`ApiError`].
pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    context: &str,
) -> Result<Option<T>, ApiError> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ApiError::from_status(status, context));
    }

    let body = response.text().await?;
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| ApiError::Protocol(format!("{context}: {e}")))
}

/// Download raw bytes (thumbnails)
pub(crate) async fn get_bytes(url: &str) -> Result<Option<Vec<u8>>, ApiError> {
    let response = HTTP_CLIENT.get(url).send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(ApiError::from_status(status, url));
    }

    Ok(Some(response.bytes().await?.to_vec()))
}
