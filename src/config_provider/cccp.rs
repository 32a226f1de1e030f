//! Carrier Configuration Publication: topology documents fetched over a data
//! connection via the `GetClusterConfig` opcode (§4.5, priority source 1).

use bytes::Bytes;
use futures::{SinkExt, StreamExt};

use crate::connection::handshake::Transport;
use crate::error::{CoreError, Result};
use crate::protocol::{Frame, Opcode, Status};

/// Issues `GetClusterConfig` on an already-authenticated transport and returns the
/// raw topology document body.
pub async fn fetch(transport: &mut Transport) -> Result<Bytes> {
    let request = Frame::request(Opcode::GetClusterConfig, 0, 0, 0);
    transport.send(request).await?;
    let response = transport
        .next()
        .await
        .ok_or_else(|| CoreError::ConnectFailed("connection closed during CCCP fetch".into()))??;

    match response.status() {
        Some(Status::Success) => Ok(response.value),
        Some(status) => Err(CoreError::ServerStatus {
            status,
            error_map_text: None,
        }),
        None => Err(CoreError::Internal("CCCP reply was not a response frame".into())),
    }
}
