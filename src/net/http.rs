//! Web server initialization and shutdown.
//!
//! One listener (TCP or Unix socket), optionally TLS-wrapped, serving the
//! axum router over per-connection hyper tasks. Receiving the stop signal
//! runs the full ordered teardown of every subsystem.

use crate::core::config::{is_unix_addr, Config};
use crate::core::registry::Globals;
use crate::media::endpoints;
use crate::net::middleware;
use crate::net::status;
use crate::net::tls::{build_server_config, spawn_tls_hot_reload, TlsReloader};
use crate::ops::StatsHandle;
use crate::users::UserCacheHandle;
use anyhow::{Context as AnyhowContext, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Maximum time to read a request's header section.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
/// Connections with no traffic for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-request deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(90);
/// Cap on buffered header bytes per connection.
const MAX_HEADER_BYTES: usize = 16 << 10;
/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Subsystem handles the teardown sequence consumes.
pub struct Teardown {
    pub users: UserCacheHandle,
    pub stats: StatsHandle,
}

/// Install signal traps and return a channel that yields once on the first
/// interrupt, terminate, or hangup.
pub fn signal_handler() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(()).await;
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let term = signal(SignalKind::terminate());
    let hup = signal(SignalKind::hangup());
    match (term, hup) {
        (Ok(mut term), Ok(mut hup)) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("signal received: interrupt, shutting down"),
                _ = term.recv() => tracing::info!("signal received: terminate, shutting down"),
                _ = hup.recv() => tracing::info!("signal received: hangup, shutting down"),
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("signal received: interrupt, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("signal received: interrupt, shutting down");
}

/// Assemble the HTTP surface: media endpoints, status dump, middleware.
pub fn build_router(globals: Arc<Globals>) -> Router {
    let body_limit = if globals.max_file_upload_size > 0 {
        DefaultBodyLimit::max(globals.max_file_upload_size as usize)
    } else {
        DefaultBodyLimit::disable()
    };
    let media = Router::new()
        .route("/v0/file/u", any(endpoints::large_file_receive))
        .route("/v0/file/u/", any(endpoints::large_file_receive))
        .route("/v0/file/s/{*rest}", any(endpoints::large_file_serve))
        .layer(body_limit);
    Router::new()
        .route(
            "/v0/status",
            get(status::serve_status).layer(axum::middleware::from_fn(middleware::error_envelope)),
        )
        .merge(media)
        .fallback(middleware::serve_404)
        .layer(axum::middleware::from_fn_with_state(
            globals.clone(),
            middleware::cache_control,
        ))
        .layer(axum::middleware::from_fn_with_state(
            globals.clone(),
            middleware::hsts,
        ))
        .layer(TimeoutLayer::new(WRITE_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(globals)
}

/// Serve `app` on the configured address and run the ordered teardown once
/// `stop` fires.
pub async fn listen_and_serve(
    globals: Arc<Globals>,
    app: Router,
    cfg: &Config,
    mut stop: mpsc::Receiver<()>,
    teardown: Teardown,
) -> Result<()> {
    let tls = match &cfg.http.tls {
        Some(tls_cfg) => {
            let server_config = build_server_config(&tls_cfg.cert_file, &tls_cfg.key_file)?;
            let acceptor = Arc::new(RwLock::new(TlsAcceptor::from(Arc::new(server_config))));
            spawn_tls_hot_reload(
                acceptor.clone(),
                TlsReloader::new(tls_cfg.cert_file.clone(), tls_cfg.key_file.clone()),
            );
            Some(acceptor)
        }
        None => None,
    };

    let mut addr = cfg.http.listen.clone();
    if tls.is_some() && addr.is_empty() {
        // Default to the standard https port when TLS is on and no address
        // was configured.
        addr = "0.0.0.0:443".to_string();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if tls.is_some() {
        if let Some(redirect_addr) = globals.tls_redirect_http.clone() {
            if is_unix_addr(&redirect_addr) || is_unix_addr(&addr) {
                anyhow::bail!("HTTP to HTTPS redirect: unix sockets not supported");
            }
            tracing::info!(
                "redirecting connections from HTTP at [{}] to HTTPS at [{}]",
                redirect_addr,
                addr
            );
            let redirect_app = middleware::tls_redirect_app(&addr);
            let mut redirect_shutdown = shutdown_rx.clone();
            let listener = TcpListener::bind(&redirect_addr)
                .await
                .with_context(|| format!("bind HTTP redirect listener on {redirect_addr}"))?;
            tokio::spawn(async move {
                let serve = axum::serve(listener, redirect_app).with_graceful_shutdown(
                    async move {
                        let _ = redirect_shutdown.changed().await;
                    },
                );
                if let Err(err) = serve.await {
                    tracing::info!("HTTP redirect failed: {err}");
                }
            });
        }
    }

    let listener = Listener::bind(&addr).await?;
    if tls.is_some() {
        tracing::info!("listening for client HTTPS connections on [{}]", addr);
    } else {
        tracing::info!("listening for client HTTP connections on [{}]", addr);
    }

    let active = Arc::new(ConnTracker::default());
    let mut server_task = tokio::spawn(serve_loop(
        listener,
        app,
        tls,
        active.clone(),
        shutdown_rx,
    ));

    tokio::select! {
        _ = stop.recv() => {
            // Flip the flag and close the accepting socket so no new
            // connections are possible.
            globals.set_shutting_down();
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(SHUTDOWN_GRACE, active.wait_idle())
                .await
                .is_err()
            {
                tracing::error!("HTTP server failed to terminate gracefully");
            }

            // While the server shuts down, terminate all sessions.
            globals.sessions.shutdown();

            // Wait for the accept loop to stop.
            let _ = (&mut server_task).await;

            // Shut the local cluster node down.
            globals.cluster.shutdown();

            // Terminate plugin connections.
            globals.plugins_shutdown();

            // gRPC streams never end gracefully; stop hard.
            globals.grpc_shutdown();

            // Stop publishing statistics.
            teardown.stats.shutdown().await;

            // The hub shuts every topic down and reports completion.
            globals.hub.shutdown().await;

            // Stop updating the users cache.
            teardown.users.shutdown().await;
        }
        res = &mut server_task => {
            match res {
                Ok(()) if globals.shutting_down() => tracing::info!("HTTP server: stopped"),
                Ok(()) => tracing::error!("HTTP server: failed, accept loop ended"),
                Err(err) => tracing::error!("HTTP server: failed - {err}"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn bind(addr: &str) -> Result<Listener> {
        if let Some(path) = addr.strip_prefix("unix:") {
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("failed to bind unix listener on {path}"))?;
            Ok(Listener::Unix(listener))
        } else {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            Ok(Listener::Tcp(listener))
        }
    }

    async fn accept(&self) -> io::Result<(Box<dyn IoStream>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

async fn serve_loop(
    listener: Listener,
    app: Router,
    tls: Option<Arc<RwLock<TlsAcceptor>>>,
    active: Arc<ConnTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!("accept error: {err:?}");
                continue;
            }
        };
        let app = app.clone();
        let tls = tls.clone();
        let guard = active.guard();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = handle_connection(stream, tls, app).await {
                tracing::debug!("connection {peer}: {err}");
            }
        });
    }
}

async fn handle_connection(
    stream: Box<dyn IoStream>,
    tls: Option<Arc<RwLock<TlsAcceptor>>>,
    app: Router,
) -> Result<()> {
    let stream: Box<dyn IoStream> = match tls {
        Some(acceptor) => {
            let acceptor = acceptor.read().await.clone();
            Box::new(acceptor.accept(stream).await.context("TLS handshake")?)
        }
        None => stream,
    };
    let io = TokioIo::new(IdleTimeout::new(stream, IDLE_TIMEOUT));
    let service = TowerToHyperService::new(app);
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .max_buf_size(MAX_HEADER_BYTES);
    builder.http2().timer(TokioTimer::new());
    builder
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("serve connection: {err}"))
}

/// Counts live connections so shutdown can wait for them to drain.
#[derive(Default)]
struct ConnTracker {
    count: AtomicUsize,
    drained: Notify,
}

struct ConnGuard(Arc<ConnTracker>);

impl ConnTracker {
    fn guard(self: &Arc<Self>) -> ConnGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Idle timeout IO wrapper
// ---------------------------------------------------------------------------

/// Stream wrapper that errors with `TimedOut` when no bytes move in either
/// direction for the configured duration.
struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn bump(&mut self) {
        let timeout = self.timeout;
        self.deadline
            .as_mut()
            .reset(tokio::time::Instant::now() + timeout);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.bump();
                Poll::Ready(res)
            }
            Poll::Pending => match this.poll_expired(cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.bump();
                Poll::Ready(res)
            }
            Poll::Pending => match this.poll_expired(cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires() {
        let (client, server) = tokio::io::duplex(64);
        let mut timed = IdleTimeout::new(server, Duration::from_millis(100));
        // Nothing arrives; the read must fail with TimedOut.
        let mut buf = [0u8; 8];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(client);
    }

    #[tokio::test]
    async fn test_idle_timeout_resets_on_traffic() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut timed = IdleTimeout::new(server, Duration::from_secs(5));
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        timed.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_conn_tracker_wait_idle() {
        let tracker = Arc::new(ConnTracker::default());
        let g1 = tracker.guard();
        let g2 = tracker.guard();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(g1);
        assert!(!waiter.is_finished());
        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle never returned")
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_bind_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.sock");
        let addr = format!("unix:{}", path.display());
        let listener = Listener::bind(&addr).await.unwrap();
        match listener {
            Listener::Unix(_) => {}
            Listener::Tcp(_) => panic!("expected unix listener"),
        }
        // Rebinding over the stale socket file works.
        drop(listener);
        let _listener = Listener::bind(&addr).await.unwrap();
    }
}
