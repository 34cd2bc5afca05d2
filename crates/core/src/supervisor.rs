use crate::error::SupervisorError;
use crate::protocol::{LineCodec, Request, Response};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub max_restarts: u32,
    pub restart_backoff_initial: Duration,
    pub restart_backoff_max: Duration,
}

impl SupervisorConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            max_restarts: 3,
            restart_backoff_initial: Duration::from_millis(250),
            restart_backoff_max: Duration::from_secs(5),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.restart_backoff_initial = initial;
        self.restart_backoff_max = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Idle,
    Running,
    Stopped,
    Failed,
}

// A respawn happens only after wait() on the previous child has returned, so
// two workers never race on the same persistence directory.
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    stdin: Mutex<Option<ChildStdin>>,
    status: Mutex<SupervisorStatus>,
    responses: broadcast::Sender<Response>,
    diagnostics: broadcast::Sender<String>,
    shutdown: watch::Sender<bool>,
    // keeps the watch channel open when no monitor task is subscribed
    _shutdown_rx: watch::Receiver<bool>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (responses, _) = broadcast::channel(256);
        let (diagnostics, _) = broadcast::channel(256);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                stdin: Mutex::new(None),
                status: Mutex::new(SupervisorStatus::Idle),
                responses,
                diagnostics,
                shutdown,
                _shutdown_rx: shutdown_rx,
            }),
        }
    }

    // A spawn failure is surfaced here, synchronously, and is not retried.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        {
            let mut status = self.inner.status.lock().await;
            if *status == SupervisorStatus::Running {
                return Err(SupervisorError::AlreadyRunning);
            }
            *status = SupervisorStatus::Running;
        }
        self.inner.shutdown.send_replace(false);

        let child = match self.inner.spawn_worker().await {
            Ok(child) => child,
            Err(spawn_error) => {
                *self.inner.status.lock().await = SupervisorStatus::Failed;
                return Err(spawn_error);
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.monitor(child).await });
        Ok(())
    }

    // Between a crash and the completed restart there is no open pipe; the
    // request is rejected with NotReady rather than silently dropped.
    pub async fn submit(&self, request: &Request) -> Result<(), SupervisorError> {
        let line = LineCodec::encode(request)?;

        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SupervisorError::NotReady("worker stdin is not open".to_string()))?;

        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;

        if let Err(io_error) = written {
            guard.take();
            return Err(SupervisorError::NotReady(format!(
                "worker pipe closed: {io_error}"
            )));
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Response> {
        self.inner.responses.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<String> {
        self.inner.diagnostics.subscribe()
    }

    pub async fn status(&self) -> SupervisorStatus {
        *self.inner.status.lock().await
    }

    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        loop {
            if *self.inner.status.lock().await != SupervisorStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

enum ExitEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Shutdown,
}

impl Inner {
    async fn spawn_worker(self: &Arc<Self>) -> Result<Child, SupervisorError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        info!(command = %self.config.command, "worker spawned");

        *self.stdin.lock().await = child.stdin.take();

        if let Some(stdout) = child.stdout.take() {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.pump_responses(stdout).await });
        }
        if let Some(stderr) = child.stderr.take() {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.pump_diagnostics(stderr).await });
        }

        Ok(child)
    }

    // Undecodable stdout lines are logged and dropped, never fatal.
    async fn pump_responses(&self, mut stdout: ChildStdout) {
        let mut codec = LineCodec::new();
        let mut buffer = [0u8; 8192];
        loop {
            match stdout.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    for item in codec.feed::<Response>(&buffer[..read]) {
                        match item {
                            Ok(response) => {
                                let _ = self.responses.send(response);
                            }
                            Err(decode_error) => {
                                warn!(error = %decode_error, "dropping undecodable worker line");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn pump_diagnostics(&self, mut stderr: ChildStderr) {
        let mut buffer = [0u8; 4096];
        loop {
            match stderr.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let _ = self
                        .diagnostics
                        .send(String::from_utf8_lossy(&buffer[..read]).into_owned());
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>, mut child: Child) {
        let mut shutdown = self.shutdown.subscribe();
        let mut restarts: u32 = 0;
        let mut backoff = self.config.restart_backoff_initial;

        loop {
            // stop() may have raced ahead of this task subscribing
            let event = if *shutdown.borrow() {
                ExitEvent::Shutdown
            } else {
                tokio::select! {
                    status = child.wait() => ExitEvent::Exited(status),
                    changed = shutdown.changed() => {
                        let _ = changed;
                        ExitEvent::Shutdown
                    }
                }
            };

            self.stdin.lock().await.take();

            match event {
                ExitEvent::Shutdown => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    info!("worker stopped by host");
                    *self.status.lock().await = SupervisorStatus::Stopped;
                    return;
                }
                ExitEvent::Exited(status) => {
                    let clean = matches!(&status, Ok(exit) if exit.success());
                    if clean {
                        info!("worker exited cleanly, not restarting");
                        *self.status.lock().await = SupervisorStatus::Stopped;
                        return;
                    }

                    if restarts >= self.config.max_restarts {
                        error!(restarts, "worker keeps exiting abnormally, giving up");
                        *self.status.lock().await = SupervisorStatus::Failed;
                        return;
                    }

                    restarts += 1;
                    warn!(
                        status = ?status,
                        attempt = restarts,
                        delay = ?backoff,
                        "worker exited abnormally, restarting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            let _ = changed;
                            *self.status.lock().await = SupervisorStatus::Stopped;
                            return;
                        }
                    }
                    backoff = (backoff * 2).min(self.config.restart_backoff_max);

                    child = match self.spawn_worker().await {
                        Ok(child) => child,
                        Err(spawn_error) => {
                            error!(error = %spawn_error, "respawn failed, giving up");
                            *self.status.lock().await = SupervisorStatus::Failed;
                            return;
                        }
                    };
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const FINAL_ANSWER_LINE: &str = r#"{"type":"final_answer","answer":"ok","sources":[]}"#;

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("worker.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path.to_string_lossy().to_string()
    }

    fn shell_config(script: &str) -> SupervisorConfig {
        SupervisorConfig::new("/bin/sh")
            .arg(script)
            .with_max_restarts(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
    }

    async fn wait_for_status(supervisor: &WorkerSupervisor, wanted: SupervisorStatus) {
        for _ in 0..200 {
            if supervisor.status().await == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervisor never reached {wanted:?}");
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected_not_dropped() {
        let supervisor = WorkerSupervisor::new(SupervisorConfig::new("/bin/true"));
        let result = supervisor
            .submit(&Request::Query {
                question: "q".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SupervisorError::NotReady(_))));
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced_synchronously() {
        let supervisor =
            WorkerSupervisor::new(SupervisorConfig::new("/nonexistent/worker-binary"));
        let result = supervisor.start().await;
        assert!(matches!(result, Err(SupervisorError::Spawn(_))));
        assert_eq!(supervisor.status().await, SupervisorStatus::Failed);
    }

    #[tokio::test]
    async fn responses_are_decoded_and_dispatched() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            &format!("while read line; do echo '{FINAL_ANSWER_LINE}'; done"),
        );

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        supervisor.start().await.unwrap();
        let mut responses = supervisor.subscribe();

        supervisor
            .submit(&Request::Query {
                question: "q".to_string(),
            })
            .await
            .unwrap();

        let response = timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(response, Response::FinalAnswer { .. }));

        supervisor.stop().await;
        assert_eq!(supervisor.status().await, SupervisorStatus::Stopped);
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "while read line; do :; done");

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning)
        ));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        supervisor.start().await.unwrap();
        wait_for_status(&supervisor, SupervisorStatus::Stopped).await;
    }

    #[tokio::test]
    async fn crash_triggers_restart_and_queries_succeed_after_recovery() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        let script = write_script(
            dir.path(),
            &format!(
                "if [ -f \"{marker}\" ]; then\n\
                 while read line; do echo '{FINAL_ANSWER_LINE}'; done\n\
                 else\n\
                 : > \"{marker}\"\n\
                 exit 1\n\
                 fi",
                marker = marker.display()
            ),
        );

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        supervisor.start().await.unwrap();
        let mut responses = supervisor.subscribe();

        // the first incarnation crashes; submits hit NotReady until the
        // restarted worker's pipe is live, then the query completes
        let mut answered = false;
        for _ in 0..100 {
            if supervisor
                .submit(&Request::Query {
                    question: "q".to_string(),
                })
                .await
                .is_ok()
            {
                if let Ok(Ok(Response::FinalAnswer { answer, .. })) =
                    timeout(Duration::from_millis(200), responses.recv()).await
                {
                    assert_eq!(answer, "ok");
                    answered = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(answered, "query after restart never completed");
        assert!(marker.exists());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn persistent_crashes_are_bounded_by_restart_cap() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3");

        let supervisor = WorkerSupervisor::new(
            shell_config(&script).with_max_restarts(1),
        );
        supervisor.start().await.unwrap();
        wait_for_status(&supervisor, SupervisorStatus::Failed).await;
    }

    #[tokio::test]
    async fn stderr_is_forwarded_as_diagnostics_verbatim() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo 'loading model weights' >&2\nwhile read line; do :; done",
        );

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        let mut diagnostics = supervisor.subscribe_diagnostics();
        supervisor.start().await.unwrap();

        let chunk = timeout(Duration::from_secs(5), diagnostics.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(chunk.contains("loading model weights"));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn undecodable_stdout_lines_are_dropped_not_dispatched() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            &format!("echo 'HELLO THERE'\necho '{FINAL_ANSWER_LINE}'\nwhile read line; do :; done"),
        );

        let supervisor = WorkerSupervisor::new(shell_config(&script));
        let mut responses = supervisor.subscribe();
        supervisor.start().await.unwrap();

        // the noise line is swallowed; the first dispatched message is typed
        let response = timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(response, Response::FinalAnswer { .. }));

        supervisor.stop().await;
    }
}
