//! Shared SSE plumbing for streaming invokers.

use eventsource_stream::Eventsource;
use futures::StreamExt;

use crate::error::InvokeError;

/// Map an error response to the invoker error taxonomy before streaming.
///
/// 401/403 become the sentinel codes the client-side reducer expands into
/// guidance text; anything else passes the provider's body through.
pub(crate) async fn ensure_ok(response: reqwest::Response) -> Result<reqwest::Response, InvokeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(InvokeError::Unauthorized);
    }
    if status == reqwest::StatusCode::FORBIDDEN {
        return Err(InvokeError::SecurityCheck);
    }
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        Err(InvokeError::Api(format!("request failed with status {}", status)))
    } else {
        Err(InvokeError::Api(body))
    }
}

/// Drive an SSE response body, calling `handle` with each event's data
/// payload. Stops at stream end or when `handle` returns `false`.
pub(crate) async fn drive<F>(response: reqwest::Response, mut handle: F) -> Result<(), InvokeError>
where
    F: FnMut(&str) -> Result<bool, InvokeError>,
{
    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| InvokeError::Api(e.to_string()))?;
        if !handle(&event.data)? {
            break;
        }
    }
    Ok(())
}
