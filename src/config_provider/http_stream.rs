//! HTTP streaming config source: a long-poll against the management endpoint that
//! yields line-delimited topology documents (§4.5, priority source 2).

use futures::StreamExt;
use tracing::warn;

use crate::error::{CoreError, Result};

/// Opens a long-poll GET against `uri` and forwards each newline-delimited JSON
/// document to `on_document` as it arrives. Returns once the connection closes
/// (the caller's reconnect loop decides whether and when to call this again).
pub async fn stream(client: &reqwest::Client, uri: &url::Url, mut on_document: impl FnMut(String)) -> Result<()> {
    let response = client.get(uri.clone()).send().await?;
    if !response.status().is_success() {
        return Err(CoreError::ConnectFailed(format!(
            "management streaming endpoint returned {}",
            response.status()
        )));
    }

    let mut buffer = String::new();
    let mut bytes = response.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => {
                warn!("discarding non-UTF-8 chunk from config streaming endpoint");
                continue;
            }
        };
        buffer.push_str(text);
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            if !line.is_empty() {
                on_document(line);
            }
        }
    }
    Ok(())
}
