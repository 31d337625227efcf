//! Streaming client for the worker's `/aggregate` endpoint.
//!
//! One [`StreamingClient::request`] call is one session: it opens a single HTTP
//! request and hands back a [`FrameStream`] that decodes the chunked body lazily.
//! Sessions share nothing but the connection pool, so several may run at once;
//! limiting the application to one active aggregation is the caller's policy.

mod decoder;

pub use decoder::{decode_line, parse_payload, FrameDecoder, DATA_PREFIX, DEFAULT_ERROR_MESSAGE};

use crate::error::SessionError;
use crate::model::{AggregateRequest, Frame};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:6759";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the worker, e.g. `http://127.0.0.1:6759`.
    pub endpoint: String,
    /// Longest accepted silence while waiting for response headers or body bytes.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            user_agent: format!("keyword-aggregator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn aggregate_url(&self) -> String {
        format!("{}/aggregate", self.endpoint.trim_end_matches('/'))
    }

    /// First socket address the endpoint resolves to; used for readiness probes.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let url = reqwest::Url::parse(&self.endpoint)
            .with_context(|| format!("invalid endpoint URL {}", self.endpoint))?;
        url.socket_addrs(|| None)
            .with_context(|| format!("cannot resolve endpoint {}", self.endpoint))?
            .into_iter()
            .next()
            .with_context(|| format!("endpoint {} has no address", self.endpoint))
    }
}

#[derive(Debug, Clone)]
pub struct StreamingClient {
    http: reqwest::Client,
    cfg: ClientConfig,
}

impl StreamingClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        // No overall request timeout: a session may legitimately stream for minutes.
        // Inactivity is bounded per read instead.
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.connect_timeout)
            .no_proxy()
            .build()
            .context("build http client")?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cfg
    }

    /// Open one aggregation session.
    ///
    /// Fails before any frame with `InvalidRequest` or `Transport`. Dropping the
    /// returned stream closes the connection.
    pub async fn request(&self, req: &AggregateRequest) -> Result<FrameStream, SessionError> {
        req.validate()?;
        let url = self.cfg.aggregate_url();
        tracing::debug!(%url, keyword = %req.keyword, top_n = req.top_n, "opening aggregation session");

        let send = self.http.post(&url).json(req).send();
        let resp = tokio::time::timeout(self.cfg.idle_timeout, send)
            .await
            .map_err(|_| {
                SessionError::Transport(format!(
                    "no response from worker within {}",
                    humantime::format_duration(self.cfg.idle_timeout)
                ))
            })??;

        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "worker returned HTTP {status}"
            )));
        }

        Ok(FrameStream::from_byte_stream(
            resp.bytes_stream(),
            self.cfg.idle_timeout,
        ))
    }
}

/// Lazy, pull-based sequence of decoded frames for one session.
///
/// Yields `Ok` frames up to and including the terminal one, or a single `Err`
/// as the last item. Not restartable.
///
/// A read that sees no bytes for `idle_timeout` ends the stream with a
/// `SessionError::Transport`, the same class as any other timeout.
pub struct FrameStream {
    inner: BoxStream<'static, Result<Frame, SessionError>>,
}

struct DecodeState {
    chunks: BoxStream<'static, Result<Bytes, String>>,
    decoder: FrameDecoder,
    ready: VecDeque<Result<Frame, SessionError>>,
    idle_timeout: Duration,
    closed: bool,
}

impl DecodeState {
    // Release the body as soon as the outcome is known.
    fn close(&mut self) {
        self.closed = true;
        self.chunks = stream::empty().boxed();
    }
}

impl FrameStream {
    /// Decode an arbitrary stream of body chunks.
    pub fn from_byte_stream<S, E>(chunks: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        let state = DecodeState {
            chunks: chunks.map(|r| r.map_err(|e| e.to_string())).boxed(),
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            idle_timeout,
            closed: false,
        };

        let inner = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.ready.pop_front() {
                    return Some((item, st));
                }
                if st.closed {
                    return None;
                }
                match tokio::time::timeout(st.idle_timeout, st.chunks.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        st.ready.extend(st.decoder.feed(&chunk));
                        if st.decoder.is_finished() {
                            st.close();
                        }
                    }
                    Ok(Some(Err(e))) => {
                        st.close();
                        st.ready
                            .push_back(Err(SessionError::Transport(format!("body read failed: {e}"))));
                    }
                    Ok(None) => {
                        st.ready.extend(st.decoder.finish());
                        if !st.decoder.is_finished() {
                            st.ready.push_back(Err(SessionError::Transport(
                                "stream ended before a terminal frame".into(),
                            )));
                        }
                        st.close();
                    }
                    Err(_) => {
                        tracing::warn!(
                            idle = %humantime::format_duration(st.idle_timeout),
                            pending = st.decoder.pending(),
                            "worker stream stalled"
                        );
                        st.close();
                        st.ready.push_back(Err(SessionError::Transport(format!(
                            "no data from worker for {}",
                            humantime::format_duration(st.idle_timeout)
                        ))));
                    }
                }
            }
        })
        .boxed();

        Self { inner }
    }
}

impl Stream for FrameStream {
    type Item = Result<Frame, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
