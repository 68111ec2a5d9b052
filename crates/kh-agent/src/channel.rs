//! The agent half of the control channel (§4.2): a `tokio-tungstenite`
//! WebSocket client authenticated with `X-Agent-Id` / `Authorization:
//! Bearer <api_key>` headers, matching the boundary `kh-server::http`
//! validates on upgrade.

use futures_util::{SinkExt, StreamExt};
use http::Request;
use kh_protocol::Frame;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One connected control channel. Wraps the raw socket so the caller deals
/// only in `Frame`s, never `Message`s.
pub struct Channel {
    socket: Socket,
}

impl Channel {
    /// Connect and upgrade to a WebSocket at `{server_url}/api/agent/channel`,
    /// presenting the agent's credentials for the header half of the
    /// two-factor validation `kh-server` requires (§6; the client-cert
    /// subject half is the injected TLS layer's job, Non-goal).
    pub async fn connect(server_url: &str, agent_id: u64, api_key: &str) -> Result<Self, ChannelError> {
        let ws_url = to_ws_url(server_url);
        let mut request = format!("{ws_url}/api/agent/channel")
            .into_client_request()
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            "X-Agent-Id",
            agent_id.to_string().parse().map_err(|_| {
                ChannelError::InvalidUrl("agent id not a valid header value".into())
            })?,
        );
        headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {api_key}").parse().map_err(|_| {
                ChannelError::InvalidUrl("api key not a valid header value".into())
            })?,
        );

        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { socket })
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let text = frame
            .to_json()
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Returns `Ok(None)` on a clean close; `Err` on a transport error or a
    /// frame that failed to parse (logged and skipped by the caller, not
    /// treated as a fatal channel error since malformed frames are
    /// `InvalidInput`, §7, not a reason to tear down the connection).
    pub async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed control frame, dropping");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChannelError::WebSocket(e)),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

fn to_ws_url(server_url: &str) -> String {
    if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_scheme_maps_to_ws_scheme() {
        assert_eq!(to_ws_url("http://127.0.0.1:7878"), "ws://127.0.0.1:7878");
        assert_eq!(to_ws_url("https://kh.example.com"), "wss://kh.example.com");
    }
}
