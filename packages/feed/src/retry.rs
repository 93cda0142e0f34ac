//! HTTP retry helper for feed downloads.
//!
//! Feed hosts are third-party ad networks and fail in all the usual ways.
//! [`send_bytes`] retries transient failures (timeouts, connection resets,
//! HTTP 429 and 5xx) with exponential backoff before giving up. Client
//! errors other than 429 are permanent and returned immediately.

use std::time::Duration;

use crate::FeedError;

/// Maximum number of retries after the first attempt.
///
/// Backoff is 2s, 4s, 8s, so a dead host costs ~14s plus request timeouts.
const MAX_RETRIES: u32 = 3;

/// Sends the request built by `build_request` and returns the response body.
///
/// The closure is called once per attempt because a
/// [`reqwest::RequestBuilder`] is consumed by `send()`.
///
/// # Errors
///
/// Returns [`FeedError`] if the request still fails after [`MAX_RETRIES`]
/// retries, or immediately on a non-retryable status.
pub async fn send_bytes<F>(build_request: F) -> Result<Vec<u8>, FeedError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let response = send_inner(&build_request, MAX_RETRIES).await?;
    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

async fn send_inner<F>(build_request: &F, max_retries: u32) -> Result<reqwest::Response, FeedError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    with_retries(max_retries, || async move {
        let response = build_request().send().await.map_err(classify_error)?;
        let status = response.status();

        if is_retryable_status(status) {
            return Err(Failure::Transient(status_error(&response)));
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(Failure::Permanent(status_error(&response)));
        }
        Ok(response)
    })
    .await
}

/// A failed attempt, tagged with whether another attempt may succeed.
#[derive(Debug)]
enum Failure {
    Transient(FeedError),
    Permanent(FeedError),
}

/// Runs `attempt` until it succeeds, fails permanently, or has been retried
/// `max_retries` times.
async fn with_retries<T, F, Fut>(max_retries: u32, mut attempt: F) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let mut retries = 0;

    loop {
        if retries > 0 {
            let delay = backoff(retries);
            log::warn!("  retry {retries}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(Failure::Transient(e)) if retries < max_retries => {
                log::warn!("  transient error: {e}");
                retries += 1;
            }
            Err(Failure::Transient(e) | Failure::Permanent(e)) => return Err(e),
        }
    }
}

/// Delay before retry number `attempt` (1-based).
const fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

/// Rate limiting and server errors are worth another attempt.
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

fn classify_error(e: reqwest::Error) -> Failure {
    if is_transient(&e) {
        Failure::Transient(FeedError::Http(e))
    } else {
        Failure::Permanent(FeedError::Http(e))
    }
}

fn status_error(response: &reqwest::Response) -> FeedError {
    FeedError::Status {
        status: response.status().as_u16(),
        url: response.url().to_string(),
    }
}
