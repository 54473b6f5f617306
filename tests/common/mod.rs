#![allow(dead_code)]

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use ws_gateway_client::{
    BackoffConfig, GatewayConfig, LifecycleEvent, RawEventConsumer, ShardState, ShardingConfig,
};

pub const TOKEN: &str = "test-token";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with tight timings so reconnects happen in milliseconds.
pub fn fast_config(compression: bool) -> GatewayConfig {
    GatewayConfig::builder()
        .token(TOKEN)
        .compression(compression)
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Some(Duration::from_millis(50)),
            floor: Duration::from_millis(1),
            ..Default::default()
        })
        .sharding(ShardingConfig {
            start_stagger: Duration::from_millis(10),
            fast_retry_delay: Duration::from_millis(20),
            ..Default::default()
        })
        .build()
        .unwrap()
}

/// A local gateway that hands each accepted socket to the test.
pub struct MockGateway {
    pub url: String,
    sockets: mpsc::UnboundedReceiver<GatewaySocket>,
}

impl MockGateway {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uri = req.uri().to_string();
                        Ok(resp)
                    };
                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        let _ = tx.send(GatewaySocket {
                            ws,
                            uri,
                            compressor: None,
                        });
                    }
                });
            }
        });

        Self { url, sockets: rx }
    }

    /// Next client connection, without a deadline.
    pub async fn next_socket(&mut self) -> Option<GatewaySocket> {
        self.sockets.recv().await
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> GatewaySocket {
        timeout(STEP_TIMEOUT, self.sockets.recv())
            .await
            .expect("client did not connect in time")
            .expect("listener stopped")
    }
}

/// Server side of one client connection.
pub struct GatewaySocket {
    ws: WebSocketStream<TcpStream>,
    /// Request target of the upgrade, including the query string
    pub uri: String,
    compressor: Option<Compress>,
}

impl GatewaySocket {
    /// Compress every later payload as one zlib stream.
    pub fn enable_compression(&mut self) {
        self.compressor = Some(Compress::new(Compression::default(), true));
    }

    pub async fn send(&mut self, payload: Value) {
        match self.compressor.as_mut() {
            Some(compressor) => {
                let bytes = compress(compressor, &payload);
                self.ws.send(Message::Binary(bytes)).await.unwrap();
            }
            None => self.ws.send(Message::Text(payload.to_string())).await.unwrap(),
        }
    }

    /// Send a compressed payload split over two binary frames.
    pub async fn send_split(&mut self, payload: Value) {
        let compressor = self.compressor.as_mut().expect("compression not enabled");
        let bytes = compress(compressor, &payload);
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        self.ws.send(Message::Binary(head.to_vec())).await.unwrap();
        self.ws.send(Message::Binary(tail.to_vec())).await.unwrap();
    }

    pub async fn hello(&mut self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}))
            .await;
    }

    pub async fn dispatch(&mut self, event: &str, seq: u64, d: Value) {
        self.send(json!({"op": 0, "t": event, "s": seq, "d": d})).await;
    }

    /// HELLO, wait for IDENTIFY, answer READY. Returns the IDENTIFY payload.
    pub async fn handshake(&mut self, session_id: &str) -> Value {
        self.hello(45_000).await;
        let identify = self.recv_op(2).await;
        self.dispatch("READY", 1, json!({"session_id": session_id, "v": 6}))
            .await;
        identify
    }

    /// Next client payload, or None once the client closed.
    pub async fn recv(&mut self) -> Option<Value> {
        timeout(STEP_TIMEOUT, self.next_payload())
            .await
            .expect("client sent nothing in time")
    }

    /// Like `recv`, without a deadline.
    pub async fn next_payload(&mut self) -> Option<Value> {
        loop {
            let message = self.ws.next().await?;
            match message {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Next payload whose op is in `ops`, skipping everything else.
    pub async fn recv_any(&mut self, ops: &[u64]) -> Value {
        loop {
            let payload = self.recv().await.expect("client closed the connection");
            if payload["op"].as_u64().is_some_and(|op| ops.contains(&op)) {
                return payload;
            }
        }
    }

    pub async fn recv_op(&mut self, op: u64) -> Value {
        self.recv_any(&[op]).await
    }

    /// Read until the client's close frame and return its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        loop {
            let message = timeout(STEP_TIMEOUT, self.ws.next())
                .await
                .expect("client did not close in time")?;
            match message {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Close with `code` and let the close handshake finish.
    pub async fn close(mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.ws.close(Some(frame)).await;
        let _ = timeout(STEP_TIMEOUT, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}

fn compress(compressor: &mut Compress, payload: &Value) -> Vec<u8> {
    let input = payload.to_string();
    let mut out = Vec::with_capacity(input.len() * 2 + 1024);
    compressor
        .compress_vec(input.as_bytes(), &mut out, FlushCompress::Sync)
        .unwrap();
    assert!(out.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    out
}

/// Consumer that records everything it is given.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<(u32, String, Value)>>,
    pub lifecycle: Mutex<Vec<(LifecycleEvent, Instant)>>,
}

impl RawEventConsumer for Recorder {
    fn process_raw_event(&self, shard_id: u32, event_name: &str, payload: Value) {
        self.events
            .lock()
            .push((shard_id, event_name.to_string(), payload));
    }

    fn on_lifecycle(&self, event: LifecycleEvent) {
        self.lifecycle.lock().push((event, Instant::now()));
    }
}

impl Recorder {
    pub fn event_names(&self, shard_id: u32) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == shard_id)
            .map(|(_, name, _)| name.clone())
            .collect()
    }

    pub fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.lifecycle.lock().iter().map(|(event, _)| *event).collect()
    }

    /// Poll until `event_name` has been dispatched to `shard_id`.
    pub async fn wait_for_event(&self, shard_id: u32, event_name: &str) {
        timeout(STEP_TIMEOUT, async {
            while !self.event_names(shard_id).iter().any(|n| n == event_name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} was never dispatched", event_name));
    }
}

/// Wait until the watched state equals `target`.
pub async fn wait_for_state(
    states: &mut tokio::sync::watch::Receiver<ShardState>,
    target: ShardState,
) {
    timeout(STEP_TIMEOUT, states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("shard never reached {:?}", target))
        .unwrap();
}

pub fn recorder() -> Arc<Recorder> {
    Arc::new(Recorder::default())
}
