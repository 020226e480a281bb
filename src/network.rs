use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, atomic::Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::ServerMetrics;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::manager::{TaskOutcome, TasksManager};
use crate::progress;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Pause before handing out more work after a result could not be saved.
pub const SAVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Why the listener stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Every task reached `Done`.
    Completed,
    /// The shutdown token was cancelled before the work was finished.
    Interrupted,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Completed => write!(f, "all tasks done"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Resolves the configured address and listens on the first address that
/// binds, with `SO_REUSEADDR` set.
pub async fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let address = config.address();
    let candidates = lookup_host(&address)
        .await
        .map_err(|source| ServerError::Resolve {
            address: address.clone(),
            source,
        })?;

    let mut last_error = None;
    for addr in candidates {
        match bind_reusable(addr, config.backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }

    Err(ServerError::Bind {
        address,
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }),
    })
}

fn bind_reusable(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Bind to the configured address and hand out `manager`'s tasks until they
/// are all done or `shutdown` is cancelled.
///
/// When enabled in `config`, a progress bar is drawn on stderr for the
/// duration of the run.
pub async fn run_server(
    config: &ServerConfig,
    manager: Arc<TasksManager>,
    shutdown: CancellationToken,
) -> Result<ShutdownReason, ServerError> {
    let listener = bind_listener(config).await?;
    if let Ok(local) = listener.local_addr() {
        info!(address = %local, tasks = manager.len(), "server listening");
    }

    let observer_stop = shutdown.child_token();
    let observer = config.progress.then(|| {
        tokio::spawn(progress::observe(
            Arc::clone(&manager),
            progress::REDRAW_INTERVAL,
            observer_stop.clone(),
        ))
    });

    let reason = run_server_on(listener, manager, shutdown).await;

    observer_stop.cancel();
    if let Some(observer) = observer {
        let _ = observer.await;
    }
    Ok(reason)
}

/// Run the accept loop on an existing listener.
///
/// Every accepted connection gets its own handler task. The loop stops when
/// the manager reports every task done or when `shutdown` is cancelled; the
/// listening socket is then closed and every handler still running is
/// aborted, which closes its connection. There is no draining of in-flight
/// exchanges.
pub async fn run_server_on(
    listener: TcpListener,
    manager: Arc<TasksManager>,
    shutdown: CancellationToken,
) -> ShutdownReason {
    let metrics = Arc::new(ServerMetrics::new());
    let mut handlers = JoinSet::new();

    info!("waiting for workers");
    let reason = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break ShutdownReason::Interrupted,
            _ = manager.wait_all_done() => break ShutdownReason::Completed,

            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let manager = Arc::clone(&manager);
                    let metrics = Arc::clone(&metrics);
                    handlers.spawn(
                        handle_connection(socket, manager, metrics)
                            .instrument(info_span!("connection", peer = %addr)),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept a connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "connection handler panicked");
                    }
                }
            }
        }
    };

    drop(listener);
    let live = handlers.len();
    handlers.shutdown().await;

    info!(
        %reason,
        closed_connections = live,
        processed = metrics.processed_tasks.load(Ordering::SeqCst),
        failed_exchanges = metrics.failed_exchanges.load(Ordering::SeqCst),
        "server stopped"
    );
    reason
}

/// Keeps the active connection count right even when the handler is aborted.
struct ConnectionGuard(Arc<ServerMetrics>);

impl ConnectionGuard {
    fn new(metrics: Arc<ServerMetrics>) -> Self {
        let active = metrics.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!(active, "worker connected");
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.0.active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(active, "worker disconnected");
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    manager: Arc<TasksManager>,
    metrics: Arc<ServerMetrics>,
) {
    let _guard = ConnectionGuard::new(Arc::clone(&metrics));
    serve_connection(&mut socket, &manager, &metrics).await;
}

/// Feed one worker connection until the tasks run out or the exchange fails.
///
/// Each round claims a task, sends it, waits for the result and reports it.
/// A failed send or receive hands the task back to the pool and ends the
/// loop; nothing escapes this function. A result that cannot be persisted
/// is logged, and the worker is served again after [`SAVE_RETRY_DELAY`].
pub async fn serve_connection<S>(stream: &mut S, manager: &TasksManager, metrics: &ServerMetrics)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some((index, task)) = manager.next_claim().await {
        debug!(task = index, command = task.command(), kind = %task.kind(), "dispatching");

        if let Err(e) = task.dispatch_to(stream).await {
            warn!(task = index, error = %e, "failed to send task");
            give_back(manager, metrics, index).await;
            return;
        }

        let result = match task.await_result(stream).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task = index, error = %e, "no result from worker");
                give_back(manager, metrics, index).await;
                return;
            }
        };

        match manager.report(index, TaskOutcome::Succeeded(result)).await {
            Ok(()) => {
                let total = metrics.processed_tasks.fetch_add(1, Ordering::SeqCst) + 1;
                let active = metrics.active_connections.load(Ordering::SeqCst);
                debug!(task = index, total, active, "task complete");
            }
            Err(e) => {
                metrics.failed_exchanges.fetch_add(1, Ordering::SeqCst);
                error!(task = index, error = %e, "result could not be saved, task returned to the pool");
                tokio::time::sleep(SAVE_RETRY_DELAY).await;
            }
        }
    }
    debug!("no tasks left, closing connection");
}

async fn give_back(manager: &TasksManager, metrics: &ServerMetrics, index: usize) {
    metrics.failed_exchanges.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = manager.report(index, TaskOutcome::Failed).await {
        error!(task = index, error = %e, "failed to return task to the pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    use crate::manager::TaskStatus;
    use crate::protocol::{recv_typed, send_sized};
    use crate::task::{Task, TaskKind, TaskResult};

    fn stdout_tasks(n: usize) -> TasksManager {
        TasksManager::new(
            (0..n)
                .map(|i| Task::new(format!("echo {i}"), TaskKind::StandardOutput))
                .collect(),
        )
    }

    #[tokio::test]
    async fn serves_until_tasks_run_out() {
        let manager = stdout_tasks(2);
        let metrics = ServerMetrics::new();
        let (mut server, mut worker) = duplex(1024);

        let fake_worker = async {
            for expected in ["echo 0", "echo 1"] {
                let (tag, payload) = recv_typed(&mut worker).await.unwrap();
                assert_eq!(tag, 1);
                assert_eq!(payload, expected.as_bytes());
                let answer = format!("{}\n", &expected[5..]);
                send_sized(&mut worker, answer.as_bytes()).await.unwrap();
            }
        };

        tokio::join!(serve_connection(&mut server, &manager, &metrics), fake_worker);

        assert!(manager.all_done());
        assert_eq!(manager.result(1), Some(TaskResult::Text("1\n".into())));
        assert_eq!(metrics.processed_tasks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_worker_returns_task() {
        let manager = stdout_tasks(1);
        let metrics = ServerMetrics::new();
        let (mut server, mut worker) = duplex(1024);

        let fake_worker = async move {
            recv_typed(&mut worker).await.unwrap();
            drop(worker);
        };

        tokio::join!(serve_connection(&mut server, &manager, &metrics), fake_worker);

        assert_eq!(manager.status_snapshot(), [TaskStatus::Pending]);
        assert_eq!(manager.result(0), None);
        assert_eq!(metrics.failed_exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsaved_result_delays_the_next_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("missing").join("out.txt");
        let manager = TasksManager::new(vec![
            Task::new("echo 0", TaskKind::StandardOutput).with_destination(&destination),
        ]);
        let metrics = ServerMetrics::new();
        let (mut server, mut worker) = duplex(1024);

        let fake_worker = async move {
            recv_typed(&mut worker).await.unwrap();
            send_sized(&mut worker, b"0\n").await.unwrap();
            let answered = tokio::time::Instant::now();

            let (_, payload) = recv_typed(&mut worker).await.unwrap();
            assert_eq!(payload, b"echo 0");
            assert!(answered.elapsed() >= SAVE_RETRY_DELAY);
            drop(worker);
        };

        tokio::join!(serve_connection(&mut server, &manager, &metrics), fake_worker);

        assert_eq!(manager.status_snapshot(), [TaskStatus::Pending]);
        assert!(!destination.exists());
        assert_eq!(metrics.failed_exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listener_stops_at_once_without_tasks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = Arc::new(stdout_tasks(0));
        let reason = tokio::time::timeout(
            Duration::from_secs(5),
            run_server_on(listener, manager, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(reason, ShutdownReason::Completed);
    }

    #[tokio::test]
    async fn listener_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = Arc::new(stdout_tasks(1));
        let token = CancellationToken::new();
        token.cancel();

        let reason = run_server_on(listener, manager, token).await;
        assert_eq!(reason, ShutdownReason::Interrupted);
    }

    #[tokio::test]
    async fn bind_listener_reuses_address() {
        let config = ServerConfig::new("127.0.0.1", 0).with_progress(false);
        let listener = bind_listener(&config).await.unwrap();
        assert!(listener.local_addr().unwrap().port() != 0);
    }
}
