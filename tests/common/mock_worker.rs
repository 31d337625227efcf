// Mock worker for testing - serves POST /aggregate with scripted chunks
#![allow(dead_code)]

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};

/// What the body does after the scripted chunks have been sent.
#[derive(Clone, Debug)]
pub enum Tail {
    /// Close the body.
    End,
    /// Keep the connection open without sending anything.
    Stall,
    /// Send this chunk forever, `chunk_delay` apart.
    Repeat(String),
}

/// Configuration for mock worker behavior
#[derive(Clone, Debug)]
pub struct MockWorkerConfig {
    pub status: StatusCode,
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    pub tail: Tail,
}

impl MockWorkerConfig {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status: StatusCode::OK,
            chunks: chunks.into_iter().map(Into::into).collect(),
            chunk_delay: Duration::from_millis(5),
            tail: Tail::End,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_tail(mut self, tail: Tail) -> Self {
        self.tail = tail;
        self
    }
}

#[derive(Default)]
struct Observed {
    requests: Mutex<Vec<serde_json::Value>>,
    open_bodies: AtomicUsize,
    body_dropped: AtomicBool,
}

#[derive(Clone)]
struct AppState {
    config: MockWorkerConfig,
    observed: Arc<Observed>,
}

/// Sets `body_dropped` once the server side of a response body goes away.
struct BodyGuard(Arc<Observed>);

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.open_bodies.fetch_sub(1, Ordering::SeqCst);
        self.0.body_dropped.store(true, Ordering::SeqCst);
    }
}

/// Mock worker server for testing
pub struct MockWorker {
    addr: SocketAddr,
    observed: Arc<Observed>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockWorker {
    /// Bind an ephemeral port and start serving.
    pub async fn start(config: MockWorkerConfig) -> Self {
        let observed = Arc::new(Observed::default());
        let app = Router::new()
            .route("/aggregate", post(aggregate_handler))
            .with_state(AppState {
                config,
                observed: observed.clone(),
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock worker");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("Server error: {}", e);
            }
        });

        Self {
            addr,
            observed,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// JSON bodies received so far.
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.observed.requests.lock().unwrap().clone()
    }

    pub fn open_bodies(&self) -> usize {
        self.observed.open_bodies.load(Ordering::SeqCst)
    }

    /// Wait until a response body has been dropped by the server.
    pub async fn wait_body_dropped(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.observed.body_dropped.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.observed.body_dropped.load(Ordering::SeqCst)
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn aggregate_handler(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    state.observed.requests.lock().unwrap().push(body);
    let cfg = state.config;
    if !cfg.status.is_success() {
        return (cfg.status, "worker unavailable").into_response();
    }

    state.observed.open_bodies.fetch_add(1, Ordering::SeqCst);
    let guard = BodyGuard(state.observed.clone());
    let delay = cfg.chunk_delay;

    let scripted = stream::iter(cfg.chunks).then(move |c| async move {
        tokio::time::sleep(delay).await;
        c
    });
    let tail = match cfg.tail {
        Tail::End => stream::empty().boxed(),
        Tail::Stall => stream::pending().boxed(),
        Tail::Repeat(chunk) => stream::repeat(chunk)
            .then(move |c| async move {
                tokio::time::sleep(delay).await;
                c
            })
            .boxed(),
    };
    let body = scripted.chain(tail).map(move |c| {
        let _held = &guard;
        Ok::<_, Infallible>(Bytes::from(c))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body))
        .unwrap()
}
