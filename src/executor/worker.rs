//! Host-side worker handles and the isolation backends that create them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::protocol::{read_frame_async, write_frame_async, HostMessage, WorkerMessage};
use super::runner::{serve, ChannelLink};
use super::ExecutionError;

enum KillSwitch {
    Flag(Arc<AtomicBool>),
    Child(Child),
}

/// The host's end of one live worker.
///
/// Dropping a handle severs both channels; [`WorkerHandle::kill`] also
/// terminates the underlying thread's script or child process at once.
pub struct WorkerHandle {
    id: u64,
    outbound: UnboundedSender<HostMessage>,
    inbound: UnboundedReceiver<WorkerMessage>,
    kill: KillSwitch,
}

impl WorkerHandle {
    /// Worker id, unique per pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a message for the worker.
    pub fn send(&self, message: HostMessage) -> Result<(), ExecutionError> {
        self.outbound
            .send(message)
            .map_err(|_| ExecutionError::Transport(format!("worker {} is gone", self.id)))
    }

    /// Next message from the worker; a closed channel is a transport error.
    pub async fn recv(&mut self) -> Result<WorkerMessage, ExecutionError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| ExecutionError::Transport(format!("worker {} exited", self.id)))
    }

    /// Terminates the worker unconditionally.
    pub fn kill(self) {
        debug!(worker = self.id, "killing worker");
        match self.kill {
            KillSwitch::Flag(flag) => flag.store(true, Ordering::Relaxed),
            KillSwitch::Child(mut child) => {
                if let Err(err) = child.start_kill() {
                    debug!(worker = self.id, error = %err, "worker process already gone");
                }
            }
        }
    }
}

/// Creates isolated workers for a pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Starts worker `id`. The handle is returned before the worker's
    /// `ready` message has been read.
    async fn spawn(&self, id: u64) -> Result<WorkerHandle, ExecutionError>;
}

/// Runs each worker on a dedicated OS thread inside this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSpawner;

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    async fn spawn(&self, id: u64) -> Result<WorkerHandle, ExecutionError> {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let flag = Arc::new(AtomicBool::new(false));
        let worker_flag = Arc::clone(&flag);
        std::thread::Builder::new()
            .name(format!("dyncore-worker-{id}"))
            .spawn(move || {
                let link = ChannelLink::new(host_rx, worker_tx);
                if let Err(err) = serve(Box::new(link), Some(worker_flag)) {
                    debug!(worker = id, error = %err, "worker thread stopped");
                }
            })
            .map_err(|err| ExecutionError::Spawn(err.to_string()))?;
        debug!(worker = id, "spawned thread worker");
        Ok(WorkerHandle {
            id,
            outbound: host_tx,
            inbound: worker_rx,
            kill: KillSwitch::Flag(flag),
        })
    }
}

/// Runs each worker as a child process speaking the framed protocol on its
/// stdin and stdout.
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// Spawns `program worker`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Spawns the running executable as the worker program.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Replaces the worker arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, id: u64) -> Result<WorkerHandle, ExecutionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ExecutionError::Spawn(format!("{}: {err}", self.program.display()))
            })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdout unavailable".into()))?;

        let (host_tx, mut host_rx) = mpsc::unbounded_channel::<HostMessage>();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = host_rx.recv().await {
                let bytes = match serde_json::to_vec(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(worker = id, error = %err, "failed to encode host message");
                        break;
                    }
                };
                if let Err(err) = write_frame_async(&mut stdin, &bytes).await {
                    debug!(worker = id, error = %err, "worker stdin closed");
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_frame_async(&mut reader).await {
                    Ok(Some(bytes)) => match serde_json::from_slice::<WorkerMessage>(&bytes) {
                        Ok(message) => {
                            if worker_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(worker = id, error = %err, "malformed worker frame");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(worker = id, error = %err, "worker stdout failed");
                        break;
                    }
                }
            }
        });
        debug!(worker = id, pid = child.id(), "spawned process worker");
        Ok(WorkerHandle {
            id,
            outbound: host_tx,
            inbound: worker_rx,
            kill: KillSwitch::Child(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn thread_workers_handshake_and_stop() {
        let mut worker = ThreadSpawner.spawn(3).await.expect("spawn");
        assert_eq!(worker.id(), 3);
        assert!(matches!(
            worker.recv().await.expect("ready"),
            WorkerMessage::Ready { .. }
        ));
        worker.send(HostMessage::Shutdown).expect("send");
        let err = worker.recv().await.expect_err("closed");
        assert!(matches!(err, ExecutionError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_worker_programs_fail_to_spawn() {
        let spawner = ProcessSpawner::new("/nonexistent/dyncore-worker");
        assert!(matches!(
            spawner.spawn(1).await,
            Err(ExecutionError::Spawn(_))
        ));
    }
}
