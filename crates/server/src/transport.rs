//! Session transport.
//!
//! The driver never touches the socket: it reads inbound text frames from
//! an mpsc receiver and writes [`Outbound`] frames to an mpsc sender. This
//! module bridges those channels to a WebSocket. Tests drive a session by
//! holding the other ends of the channels directly.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Client frame prefix submitting (or replacing) source code.
pub const CODE_PREFIX: &str = "CODE:";
/// Client frame terminating the current execution.
pub const STOP_COMMAND: &str = "STOP";
/// Sentinel sent when the exec's process ends on its own.
pub const EXEC_TERMINATED: &str = "EXEC_TERMINATED";
/// Sentinel sent when an execution outlives its time budget.
pub const EXEC_TIMEOUT: &str = "EXEC_TIMEOUT";

/// Frames per session buffered toward the client before backpressure.
pub const OUTBOUND_CAPACITY: usize = 64;
/// Inbound frames buffered toward the driver.
pub const INBOUND_CAPACITY: usize = 64;

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Control or diagnostic message, sent as a text frame.
    Text(String),
    /// Raw program output chunk, sent as a binary frame so partial UTF-8
    /// sequences survive.
    Output(Bytes),
}

/// Pump frames between a WebSocket and the session channels until either
/// side goes away.
///
/// Dropping the inbound sender tells the driver the transport closed;
/// the driver dropping its outbound sender ends this loop and closes the
/// socket.
pub async fn drive_websocket(
    ws: WebSocketStream<TcpStream>,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<String>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("websocket closed by peer");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary control noise
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read failed");
                    break;
                }
            },
            msg = outbound.recv() => match msg {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Output(chunk)) => {
                    if sink.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                None => break, // session driver finished
            },
        }
    }

    let _ = sink.close().await;
}

/// Extract the `lang` parameter from a request query string.
pub fn lang_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("lang=")
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}
