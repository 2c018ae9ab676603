//! HTTP front door.
//!
//! Lets a client submit a request and poll for its result, and lets a
//! worker pull the next queued item and report back. Every response is a
//! JSON [`Item`](crate::model::Item); failures travel in its `error`
//! field with status 200.
//!
//! | Route | Method | Action |
//! |---|---|---|
//! | `/{bucket}` | POST | add a request (or cancel one) |
//! | `/{bucket}` | GET | long-poll a request by `Request-Id` header |
//! | `/{bucket}/queue` | GET | pop the next item |
//! | `/{bucket}/queue` | POST | record a worker's result |

pub mod handler;
pub mod status;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::queue::Queue;
use status::StatusBoard;

/// Header carrying the request id on client polls and cancels.
pub const REQUEST_ID_HEADER: &str = "Request-Id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: Queue,
    pub board: Arc<StatusBoard>,
    /// TTL applied to submitted requests.
    pub default_ttl: Option<Duration>,
    /// Flips to `true` when the server starts shutting down.
    pub closing: watch::Receiver<bool>,
}

/// Build the router for `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/:bucket",
            get(handler::fetch_request).post(handler::create_request),
        )
        .route(
            "/:bucket/queue",
            get(handler::fetch_queue).post(handler::post_queue),
        )
        .with_state(state)
}

/// A running HTTP server.
pub struct WebServer {
    addr: SocketAddr,
    closing: watch::Sender<bool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    done: watch::Receiver<bool>,
}

impl WebServer {
    /// Bind `listen` and serve in the background.
    pub async fn start(
        listen: &str,
        queue: Queue,
        default_ttl: Option<Duration>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;

        // Track a request at least as long as its queue item can live.
        let retention = default_ttl
            .map_or(status::DEFAULT_RETENTION, |ttl| ttl + handler::LONG_POLL)
            .max(status::DEFAULT_RETENTION);

        let (closing, closing_rx) = watch::channel(false);
        let app = router(AppState {
            queue,
            board: Arc::new(StatusBoard::new(retention)),
            default_ttl,
            closing: closing_rx,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("web server error: {e}");
            }
            done_tx.send_replace(true);
        });

        info!(%addr, "web server started");
        Ok(Self {
            addr,
            closing,
            shutdown: Mutex::new(Some(shutdown_tx)),
            done: done_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:42200`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shut the server down and wait for it to exit.
    ///
    /// Pending long-polls are answered with an error item first.
    pub async fn stop(&self) -> Result<()> {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Other("web server already stopped".to_string()))?;

        info!(addr = %self.addr, "stopping web server");
        self.closing.send_replace(true);
        let _ = shutdown.send(());
        self.stop_notify().await;
        info!(addr = %self.addr, "web server stopped");
        Ok(())
    }

    /// Resolves once the server task has exited.
    pub async fn stop_notify(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}
