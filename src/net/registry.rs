//! Listening server that tracks its live connections.
//!
//! One accept loop owns the listener and the set of per-connection tasks.
//! Each task runs the server handshake, hands the connection to the caller's
//! handler and closes it once the handler returns.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::Result;
use crate::net::connection::WebSocket;
use crate::net::tcp_opt;
use crate::net::ws_server::ServerHandshake;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Inner {
    handshake: ServerHandshake,
    serving: AtomicBool,
    live: Mutex<HashMap<usize, WebSocket>>,
}

pub struct Server {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<JoinSet<()>>>>,
}

impl Server {
    /// Binds `addr` and starts accepting. `handler` runs once per opened
    /// connection; the connection is closed with 1000 when it returns.
    pub async fn bind<H, Fut>(addr: SocketAddr, handshake: ServerHandshake, handler: H) -> Result<Server>
    where
        H: Fn(WebSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = tcp_opt::create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");

        let inner = Arc::new(Inner {
            handshake,
            serving: AtomicBool::new(true),
            live: Mutex::new(HashMap::new()),
        });
        let (stop, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, inner.clone(), Arc::new(handler), stop_rx));

        Ok(Server { inner, local_addr, stop, accept_task: Mutex::new(Some(accept_task)) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once `shutdown` has started.
    pub fn is_serving(&self) -> bool {
        self.inner.serving.load(Ordering::Acquire)
    }

    /// Connections that completed the handshake and have not been torn down yet.
    pub fn live_connections(&self) -> Vec<WebSocket> {
        self.inner.live.lock().values().cloned().collect()
    }

    /// Stops accepting, closes every live connection with 1001 and waits for
    /// the connection tasks. Connections still busy after `close_timeout` are
    /// left to finish their teardown in the background.
    pub async fn shutdown(&self) {
        if !self.inner.serving.swap(false, Ordering::AcqRel) {
            debug!("shutdown already in progress");
        }
        info!("shutting down {}", self.local_addr);
        let _ = self.stop.send(true);

        let deadline = Instant::now() + self.inner.handshake.get_config().close_timeout;
        let accept_task = self.accept_task.lock().take();
        let mut tasks = match accept_task {
            Some(handle) => match handle.await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!("accept loop failed: {e}");
                    JoinSet::new()
                }
            },
            None => JoinSet::new(),
        };

        let mut closing = JoinSet::new();
        for ws in self.live_connections() {
            closing.spawn(async move {
                if let Err(e) = ws.close(1001, "going away").await {
                    debug!("close during shutdown failed: {e}");
                }
            });
        }

        let drained = timeout_at(deadline, async {
            while let Some(finished) = tasks.join_next().await {
                log_task_result(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} connection tasks still running at shutdown deadline, aborting", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        if timeout_at(deadline, async { while closing.join_next().await.is_some() {} }).await.is_err() {
            debug!("{} connections still closing after shutdown", closing.len());
            closing.detach_all();
        }
        info!("server {} stopped", self.local_addr);
    }
}

fn log_task_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("connection task panicked: {e}");
        }
    }
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    inner: Arc<Inner>,
    handler: Arc<H>,
    mut stop: watch::Receiver<bool>,
) -> JoinSet<()>
where
    H: Fn(WebSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted {peer}");
                    tasks.spawn(serve_connection(stream, inner.clone(), handler.clone()));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => log_task_result(finished),
        }
    }
    tasks
}

async fn serve_connection<H, Fut>(stream: TcpStream, inner: Arc<Inner>, handler: Arc<H>)
where
    H: Fn(WebSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tcp_opt::apply_optimizations(&stream) {
        debug!("failed to tune accepted socket: {e}");
    }
    let serving = inner.clone();
    let accepted = inner
        .handshake
        .accept_when(stream, move || serving.serving.load(Ordering::Acquire))
        .await;
    let Some(ws) = accepted else {
        return;
    };

    let _registered = Registration::new(inner.clone(), &ws);
    // Registered after shutdown took its snapshot.
    if !inner.serving.load(Ordering::Acquire) {
        let _ = ws.close(1001, "going away").await;
        return;
    }

    // A separate task keeps a handler panic from taking the teardown with it.
    let outcome = tokio::spawn(handler(ws.clone())).await;
    if let Err(e) = outcome {
        if e.is_panic() {
            error!("connection handler panicked for {:?}: {e}", ws.peer_addr());
        }
    }
    if let Err(e) = ws.close(1000, "").await {
        debug!("close after handler failed: {e}");
    }
}

/// Live map entry, removed when the connection task ends or is aborted.
struct Registration {
    inner: Arc<Inner>,
    id: usize,
}

impl Registration {
    fn new(inner: Arc<Inner>, ws: &WebSocket) -> Self {
        let id = ws.id();
        inner.live.lock().insert(id, ws.clone());
        Self { inner, id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.live.lock().remove(&self.id);
    }
}
