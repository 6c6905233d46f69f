//! WebSocket transport for the live feed.
//!
//! Each transport runs in its own task and reports back over a channel.
//! Events carry the generation they were opened with so the driver can
//! ignore anything from a transport it has already replaced.

use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { generation: u64 },
    Message { generation: u64, text: String },
    /// Closed by the peer or failed. `error` is None for a clean close.
    Closed { generation: u64, error: Option<String> },
}

/// Owns a running transport task. Dropping the handle closes the socket.
pub struct TransportHandle {
    generation: u64,
    stop: Option<oneshot::Sender<()>>,
}

impl TransportHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the task to close the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the feed URL: http(s) maps to ws(s) and the space id is appended as
/// the `space_id` query parameter.
pub fn build_stream_url(base: &str, space_id: &str) -> Result<Url, ClientError> {
    let mut url =
        Url::parse(base).map_err(|err| ClientError::Config(format!("invalid stream URL: {err}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => url.scheme(),
        other => {
            return Err(ClientError::Config(format!(
                "unsupported stream URL scheme: {other}"
            )))
        }
    }
    .to_string();

    url.set_scheme(&scheme)
        .map_err(|_| ClientError::Config("invalid stream URL scheme".to_string()))?;
    url.query_pairs_mut().append_pair("space_id", space_id);
    Ok(url)
}

/// Spawn a transport task for `url`.
pub fn open(
    url: Url,
    auth_token: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> TransportHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(run(url, auth_token, generation, events, stop_rx));
    TransportHandle {
        generation,
        stop: Some(stop_tx),
    }
}

async fn run(
    url: Url,
    auth_token: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let request = match build_request(&url, auth_token.as_deref()) {
        Ok(request) => request,
        Err(err) => {
            let _ = events.send(TransportEvent::Closed {
                generation,
                error: Some(err.to_string()),
            });
            return;
        }
    };

    let connected = tokio::select! {
        _ = &mut stop => return,
        result = connect_async(request) => result,
    };

    let mut socket = match connected {
        Ok((socket, _)) => socket,
        Err(err) => {
            tracing::debug!("Stream connect to {} failed: {}", url, err);
            let _ = events.send(TransportEvent::Closed {
                generation,
                error: Some(err.to_string()),
            });
            return;
        }
    };

    if events.send(TransportEvent::Opened { generation }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = socket.close(None).await;
                return;
            }
            incoming = socket.next() => {
                let event = match incoming {
                    Some(Ok(Message::Text(text))) => TransportEvent::Message { generation, text },
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => TransportEvent::Message { generation, text },
                        Err(_) => {
                            tracing::debug!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => TransportEvent::Closed { generation, error: None },
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => TransportEvent::Closed { generation, error: Some(err.to_string()) },
                };

                let closed = matches!(event, TransportEvent::Closed { .. });
                if events.send(event).is_err() || closed {
                    return;
                }
            }
        }
    }
}

fn build_request(
    url: &Url,
    auth_token: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ClientError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| ClientError::Config(err.to_string()))?;
    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|err| ClientError::Config(format!("invalid auth token: {err}")))?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}
