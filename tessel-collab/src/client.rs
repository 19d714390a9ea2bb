//! Minimal WebSocket client speaking the editor protocol.
//!
//! Used by integration tests and scripting tools: connect, send requests,
//! and pull server messages in order. There is no local document model.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

pub struct EditClient {
    username: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl EditClient {
    /// Connect and complete the `Hello` / `Welcome` handshake.
    pub async fn connect(url: &str, username: impl Into<String>) -> Result<Self, ProtocolError> {
        let username = username.into();
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let mut client = Self { username, ws };

        client
            .send(&ClientMessage::Hello {
                username: client.username.clone(),
            })
            .await?;
        match client.recv().await? {
            ServerMessage::Welcome { .. } => Ok(client),
            ServerMessage::Error { message, .. } => Err(ProtocolError::Rejected(message)),
            other => Err(ProtocolError::Rejected(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        self.ws.send(Message::Binary(msg.encode()?.into())).await?;
        Ok(())
    }

    /// Next server message. Control frames are skipped.
    pub async fn recv(&mut self) -> Result<ServerMessage, ProtocolError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return ServerMessage::decode(&data),
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<ServerMessage, ProtocolError> {
        tokio::time::timeout(wait, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Skip messages until one matches `pred`, giving up after `wait` overall.
    pub async fn recv_until<F>(&mut self, wait: Duration, mut pred: F) -> Result<ServerMessage, ProtocolError>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.ws.close(None).await?;
        Ok(())
    }
}
