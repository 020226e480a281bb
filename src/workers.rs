use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{ProtocolError, TaskError, WorkerError};
use crate::protocol::{recv_typed, send_sized};
use crate::task::Task;

/// How a connection to the server came to an end.
#[derive(Debug)]
pub enum SessionEnd {
    /// The server closed the connection between tasks: no more work.
    Closed,
    /// A task could not be run. The connection must be dropped so the
    /// server hands the task to someone else.
    ExecutionFailed(TaskError),
}

#[derive(Debug)]
pub struct Session {
    pub completed: u64,
    pub end: SessionEnd,
}

/// Totals over a whole worker run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub sessions: u32,
}

/// Serve one connection: receive a task, run it, send the result back,
/// until the server closes the connection or a task fails to run.
///
/// Protocol failures are returned as errors; the caller closes the stream.
pub async fn work_on<S>(stream: &mut S) -> Result<Session, WorkerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut completed = 0;
    loop {
        debug!("waiting for work");
        let (tag, payload) = match recv_typed(stream).await {
            Ok(message) => message,
            Err(ProtocolError::ConnectionClosed) => {
                return Ok(Session {
                    completed,
                    end: SessionEnd::Closed,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let task = Task::from_wire(tag, payload)?;
        info!(command = task.command(), kind = %task.kind(), "working");

        let output = match task.execute().await {
            Ok(output) => output,
            Err(e) if e.is_execution() => {
                return Ok(Session {
                    completed,
                    end: SessionEnd::ExecutionFailed(e),
                });
            }
            Err(e) => return Err(e.into()),
        };

        debug!(bytes = output.len(), "sending back result");
        send_sized(stream, &output).await?;
        completed += 1;
    }
}

async fn connect(config: &WorkerConfig) -> Result<TcpStream, WorkerError> {
    let address = config.address();
    let mut attempt = 1;
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                info!(%address, "connected to server");
                return Ok(stream);
            }
            Err(source) if attempt >= config.connect_attempts => {
                return Err(WorkerError::Connect { address, source });
            }
            Err(e) => {
                warn!(%address, attempt, error = %e, "connection failed, retrying");
                tokio::time::sleep(config.retry_delay).await;
                attempt += 1;
            }
        }
    }
}

/// Connect to the server and work until it has nothing left to give.
///
/// When a task cannot be executed the connection is dropped, which returns
/// the task to the server's pool, and the worker reconnects. After
/// `max_consecutive_failures` such failures without a completed task in
/// between, the worker gives up.
pub async fn run_worker(config: &WorkerConfig) -> Result<WorkerSummary, WorkerError> {
    let mut summary = WorkerSummary::default();
    let mut failures = 0;

    loop {
        let mut stream = connect(config).await?;
        summary.sessions += 1;
        let session = work_on(&mut stream).await;
        drop(stream);

        let Session { completed, end } = session?;
        summary.completed += completed;

        match end {
            SessionEnd::Closed => {
                info!(completed = summary.completed, "server closed the connection, no more work");
                return Ok(summary);
            }
            SessionEnd::ExecutionFailed(e) => {
                if completed > 0 {
                    failures = 0;
                }
                failures += 1;
                error!(error = %e, failures, "task execution failed, dropping the connection");
                if failures >= config.max_consecutive_failures {
                    return Err(WorkerError::TooManyFailures(failures));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::protocol::{recv_sized, send_typed};
    use crate::task::TaskKind;

    const DEADLINE: Duration = Duration::from_secs(10);
    const FAILING: (TaskKind, &str) = (TaskKind::FileOutput, "true");
    const GOOD: (TaskKind, &str) = (TaskKind::StandardOutput, "echo ok");

    /// Accepts one connection per script and plays it: each task is sent and
    /// its answer awaited; the connection closes once the script is over or
    /// the worker hangs up.
    async fn scripted_server(
        scripts: Vec<Vec<(TaskKind, &'static str)>>,
    ) -> (WorkerConfig, Arc<AtomicUsize>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let server = tokio::spawn(async move {
            for script in scripts {
                let (mut stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                for (kind, command) in script {
                    send_typed(&mut stream, kind.as_byte(), command.as_bytes())
                        .await
                        .unwrap();
                    if recv_sized(&mut stream).await.is_err() {
                        break;
                    }
                }
            }
        });

        (WorkerConfig::new("127.0.0.1", port), accepted, server)
    }

    #[tokio::test]
    async fn runs_tasks_until_server_closes() {
        let (mut worker, mut server) = duplex(1024);

        let fake_server = async move {
            let mut answers = Vec::new();
            for i in 0..3 {
                send_typed(&mut server, TaskKind::StandardOutput.as_byte(), format!("echo {i}").as_bytes())
                    .await
                    .unwrap();
                answers.push(recv_sized(&mut server).await.unwrap());
            }
            drop(server);
            answers
        };

        let (session, answers) = tokio::join!(work_on(&mut worker), fake_server);
        let session = session.unwrap();

        assert_eq!(session.completed, 3);
        assert!(matches!(session.end, SessionEnd::Closed));
        assert_eq!(answers, [b"0\n".to_vec(), b"1\n".to_vec(), b"2\n".to_vec()]);
    }

    #[tokio::test]
    async fn no_output_task_answers_empty() {
        let (mut worker, mut server) = duplex(1024);

        let fake_server = async move {
            send_typed(&mut server, TaskKind::NoOutput.as_byte(), b"echo ignored")
                .await
                .unwrap();
            recv_sized(&mut server).await.unwrap()
        };

        let (session, answer) = tokio::join!(work_on(&mut worker), fake_server);
        assert!(answer.is_empty());
        assert_eq!(session.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn missing_result_file_ends_session() {
        let (mut worker, mut server) = duplex(1024);
        send_typed(&mut server, TaskKind::FileOutput.as_byte(), b"true")
            .await
            .unwrap();

        let session = work_on(&mut worker).await.unwrap();
        assert_eq!(session.completed, 0);
        assert!(matches!(
            session.end,
            SessionEnd::ExecutionFailed(TaskError::MissingResultPath)
        ));
    }

    #[tokio::test]
    async fn unknown_task_kind_is_an_error() {
        let (mut worker, mut server) = duplex(1024);
        send_typed(&mut server, 9, b"echo 9").await.unwrap();

        let err = work_on(&mut worker).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol(ProtocolError::UnknownTaskKind(9))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = WorkerConfig::new("127.0.0.1", port);
        let err = run_worker(&config).await.unwrap_err();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }

    #[tokio::test]
    async fn gives_up_after_consecutive_failures() {
        let (config, accepted, server) = scripted_server(vec![vec![FAILING]; 3]).await;
        let config = config.with_max_consecutive_failures(3);

        let err = timeout(DEADLINE, run_worker(&config)).await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::TooManyFailures(3)));

        timeout(DEADLINE, server).await.unwrap().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completed_task_resets_failure_count() {
        let (config, accepted, server) =
            scripted_server(vec![vec![FAILING], vec![GOOD, FAILING], vec![GOOD]]).await;
        let config = config.with_max_consecutive_failures(2);

        let summary = timeout(DEADLINE, run_worker(&config)).await.unwrap().unwrap();
        assert_eq!(
            summary,
            WorkerSummary {
                completed: 2,
                sessions: 3
            }
        );

        timeout(DEADLINE, server).await.unwrap().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connect_retries_until_server_listens() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let config =
            WorkerConfig::new("127.0.0.1", port).with_connect_attempts(5, Duration::from_millis(100));
        let summary = timeout(DEADLINE, run_worker(&config)).await.unwrap().unwrap();
        assert_eq!(
            summary,
            WorkerSummary {
                completed: 0,
                sessions: 1
            }
        );
        timeout(DEADLINE, server).await.unwrap().unwrap();
    }
}
