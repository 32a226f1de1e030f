//! Pooled-mode dispatch: one connection checked out of the node's pool per in-flight
//! operation (§4.4).

use std::time::Duration;

use futures::{SinkExt, StreamExt};

use crate::connection::ConnectionPool;
use crate::error::{CoreError, Result};
use crate::protocol::Frame;

/// Sends `request` and waits for its response on a freshly acquired connection,
/// bounded by `deadline`. The checkout is discarded rather than returned to the pool
/// whenever the exchange fails, since the connection's framing state is no longer
/// trustworthy after a partial write or a decode error.
pub async fn execute(pool: &ConnectionPool, request: Frame, deadline: Duration) -> Result<Frame> {
    let mut checkout = pool.acquire().await?;

    let outcome = tokio::time::timeout(deadline, async {
        checkout.transport().send(request).await?;
        checkout
            .transport()
            .next()
            .await
            .ok_or_else(|| CoreError::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed while awaiting response",
            ))))?
    })
    .await;

    match outcome {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            checkout.discard();
            Err(err)
        }
        Err(_) => {
            checkout.discard();
            Err(CoreError::OperationTimeout(deadline))
        }
    }
}
