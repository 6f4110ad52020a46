//! Local stand-ins for the call server and the session API.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Call server
// ============================================================================

/// Accepts one WebSocket client and lets the test script both directions.
pub struct FakeCallServer {
    pub url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    /// `None` once the client closed the socket
    incoming: mpsc::UnboundedReceiver<Option<Value>>,
}

impl FakeCallServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(socket) = accept_async(stream).await else {
                return;
            };
            let (mut write, mut read) = socket.split();

            loop {
                tokio::select! {
                    message = out_rx.recv() => match message {
                        Some(Message::Close(frame)) => {
                            let _ = write.send(Message::Close(frame)).await;
                            let _ = write.close().await;
                            break;
                        }
                        Some(message) => {
                            if write.send(message).await.is_err() {
                                break;
                            }
                        }
                        // Test dropped the server: drop the socket without a close frame
                        None => break,
                    },
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let value = serde_json::from_str(&text).unwrap_or(Value::Null);
                            let _ = in_tx.send(Some(value));
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            let _ = in_tx.send(None);
        });

        Self {
            url,
            outgoing: out_tx,
            incoming: in_rx,
        }
    }

    /// Send an envelope `{type, payload}`.
    pub fn send(&self, kind: &str, payload: Value) {
        let frame = json!({ "type": kind, "payload": payload }).to_string();
        self.send_raw(&frame);
    }

    pub fn send_raw(&self, text: &str) {
        self.outgoing
            .send(Message::Text(text.to_string()))
            .expect("server task gone");
    }

    /// Close the socket from the server side with a close frame.
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    /// Next frame from the client. Panics if the client closed first.
    pub async fn recv(&mut self) -> Value {
        match tokio::time::timeout(WAIT, self.incoming.recv()).await {
            Ok(Some(Some(value))) => value,
            Ok(_) => panic!("client closed the socket"),
            Err(_) => panic!("no frame from client"),
        }
    }

    /// Wait for the client to close the socket, returning any frames sent first.
    pub async fn closed(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, self.incoming.recv()).await {
                Ok(Some(Some(value))) => frames.push(value),
                Ok(_) => return frames,
                Err(_) => panic!("client never closed the socket"),
            }
        }
    }
}

/// A `ws://` URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

// ============================================================================
// Session API
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Value,
}

pub type Route = Arc<dyn Fn(&str, &str) -> Option<(u16, Value)> + Send + Sync>;

/// Minimal HTTP/1.1 responder. `route(method, path)` returns the status and
/// JSON body; `None` leaves the request hanging until the client gives up.
pub struct FakeApi {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeApi {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str, &str) -> Option<(u16, Value)> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route: Route = Arc::new(route);

        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let route = route.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, route, log).await;
                });
            }
        });

        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait until `count` requests have been recorded.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<Recorded> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let requests = self.requests();
            if requests.len() >= count {
                return requests;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} requests, saw {:?}", count, requests);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    route: Route,
    log: Arc<Mutex<Vec<Recorded>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);

    log.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        body,
    });

    let Some((status, reply)) = route(&method, &path) else {
        // Hold the connection open without answering
        tokio::time::sleep(Duration::from_secs(60)).await;
        return Ok(());
    };

    let reply = reply.to_string();
    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reply.len(),
        reply
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

// ============================================================================
// Canned API bodies
// ============================================================================

pub fn session_json(id: &str, user_id: &str, persona_id: &str) -> Value {
    json!({
        "id": id,
        "user_id": user_id,
        "persona_id": persona_id,
        "conversation_id": null,
        "started_at": "2026-01-15T10:30:00.123456",
        "ended_at": null,
        "status": "active"
    })
}

pub fn scorecard_json(overall: u32) -> Value {
    json!({
        "id": "card-1",
        "session_id": "b1",
        "overall_score": overall,
        "opener_score": 8,
        "opener_feedback": "Strong hook",
        "objection_handling_score": 6,
        "objection_handling_feedback": "Acknowledge before answering",
        "tone_confidence_score": 7,
        "tone_confidence_feedback": "Steady pace",
        "close_attempt_score": 5,
        "close_attempt_feedback": "Ask for a specific time",
        "best_moment": "The opening question",
        "biggest_mistake": "Talking over the fee objection",
        "what_to_say_instead": "That's fair, what would make it worth it?",
        "meeting_booked": false,
        "created_at": "2026-01-15T10:45:00Z"
    })
}

pub fn end_session_json(session_id: &str, overall: u32) -> Value {
    json!({
        "session_id": session_id,
        "status": "ended",
        "ended_at": "2026-01-15T10:45:00Z",
        "scorecard": scorecard_json(overall)
    })
}
