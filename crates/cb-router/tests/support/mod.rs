//! Test support: a scripted HTTP endpoint and a pre-wired engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cb_router::{
    AuthzCacheConfig, BreakerConfig, CallbackDispatcher, CircuitBreakerRegistry,
    DispatcherConfig, DomainAuthorizer, EventRouter, ExecutionRecorder, Shutdown,
};
use cb_store::{ConfigStore, MemoryStore};

/// One request as seen by the endpoint. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Minimal scripted HTTP endpoint: the n-th request is answered with the
/// n-th status in the script (the last entry repeats). Requests are
/// recorded for assertions.
pub struct TestEndpoint {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    counter: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl TestEndpoint {
    pub async fn start(script: Vec<u16>) -> Self {
        Self::start_with_delay(script, Duration::ZERO).await
    }

    /// Starts an endpoint that waits `delay` before answering each request.
    pub async fn start_with_delay(script: Vec<u16>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(script);

        let accept_task = {
            let requests = requests.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let requests = requests.clone();
                    let counter = counter.clone();
                    let script = script.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, requests, counter, script, delay).await;
                    });
                }
            })
        };

        Self {
            addr,
            requests,
            counter,
            accept_task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Domain key for this endpoint: `127.0.0.1:<port>` (the port is never
    /// the scheme default).
    pub fn domain(&self) -> String {
        self.addr.to_string()
    }

    pub fn hits(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for TestEndpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn handle_connection(
    mut stream: TcpStream,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    counter: Arc<AtomicUsize>,
    script: Arc<Vec<u16>>,
    delay: Duration,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > 64 * 1024 {
            return;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let Ok(n) = stream.read(&mut chunk).await else {
            break;
        };
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let index = counter.fetch_add(1, Ordering::SeqCst);
    requests.lock().push(RecordedRequest {
        method,
        path,
        headers,
        body,
    });

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = script
        .get(index)
        .or(script.last())
        .copied()
        .unwrap_or(200);
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Scripted",
    };
    let body_out = if (200..300).contains(&status) { "ok" } else { "err" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body_out}",
        body_out.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// A fully wired dispatch pipeline over an in-memory store.
pub struct Engine {
    pub store: Arc<MemoryStore>,
    pub store_dyn: Arc<dyn ConfigStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub router: Arc<EventRouter>,
    pub shutdown: Arc<Shutdown>,
}

pub fn engine() -> Engine {
    engine_with_breakers(BreakerConfig::default())
}

pub fn engine_with_breakers(breaker_config: BreakerConfig) -> Engine {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn ConfigStore> = store.clone();
    let shutdown = Arc::new(Shutdown::new());
    let authorizer = Arc::new(DomainAuthorizer::new(
        store_dyn.clone(),
        AuthzCacheConfig::default(),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_config));
    let recorder = Arc::new(ExecutionRecorder::new(store_dyn.clone()));
    let dispatcher = Arc::new(
        CallbackDispatcher::new(
            store_dyn.clone(),
            authorizer,
            breakers.clone(),
            recorder,
            DispatcherConfig::default(),
            shutdown.clone(),
        )
        .expect("dispatcher"),
    );
    let router = Arc::new(EventRouter::new(store_dyn.clone(), dispatcher.clone()));
    Engine {
        store,
        store_dyn,
        breakers,
        dispatcher,
        router,
        shutdown,
    }
}
