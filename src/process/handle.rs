//! Process handles - spawned children supervised by a waiter task
//!
//! The waiter task owns the `Child`. Termination requests travel to it over a
//! control channel, so a signal is only ever delivered while the child has
//! not yet been reaped and its pid cannot have been recycled. On unix each
//! child leads its own process group and signals go to the whole group, so
//! grandchildren holding the output pipes die with it.

use crate::config::{SlotCommand, StopSignal};
use crate::error::{LauncherError, Result};
use crate::process::capture::{self, CaptureLimits, OutputReceiver};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[derive(Debug)]
enum Control {
    Terminate {
        signal: StopSignal,
        reply: oneshot::Sender<io::Result<()>>,
    },
}

/// A running child process
#[derive(Debug)]
pub struct ProcessHandle {
    launch_id: Uuid,
    pid: Option<u32>,
    command_line: String,
    started_at: DateTime<Utc>,
    control: mpsc::Sender<Control>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Spawn `command` with piped output and start capturing it.
    ///
    /// `on_exit` runs on the waiter task once the child has been reaped,
    /// with this handle's launch id and the exit status if one was read.
    pub fn spawn<F>(
        command: &SlotCommand,
        limits: CaptureLimits,
        on_exit: F,
    ) -> Result<(Self, OutputReceiver)>
    where
        F: FnOnce(Uuid, Option<ExitStatus>) + Send + 'static,
    {
        let launch_id = Uuid::new_v4();

        let mut std_cmd = std::process::Command::new(&command.program);
        std_cmd
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        std_cmd.process_group(0);

        if let Some(cwd) = &command.cwd {
            std_cmd.current_dir(cwd);
        }

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LauncherError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let output = capture::attach(child.stdout.take(), child.stderr.take(), limits);
        let pid = child.id();

        let (control_tx, control_rx) = mpsc::channel(4);
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(supervise(launch_id, child, control_rx, exited_tx, on_exit));

        let handle = Self {
            launch_id,
            pid,
            command_line: command.display(),
            started_at: Utc::now(),
            control: control_tx,
            exited: exited_rx,
        };

        Ok((handle, output))
    }

    pub fn launch_id(&self) -> Uuid {
        self.launch_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Ask the waiter to signal the child. Resolves once the signal has been
    /// handed to the OS; it does not wait for the exit.
    pub fn terminate(
        &self,
        signal: StopSignal,
    ) -> impl Future<Output = io::Result<()>> + Send + 'static {
        let control = self.control.clone();
        async move {
            let (reply, response) = oneshot::channel();
            control
                .send(Control::Terminate { signal, reply })
                .await
                .map_err(|_| already_exited())?;
            response.await.map_err(|_| already_exited())?
        }
    }

    /// Resolves once the child has exited and been reaped
    pub fn exited(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut exited = self.exited.clone();
        async move {
            // A dropped sender also means the waiter is gone
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    /// A handle with no child behind it whose terminate requests always fail
    #[cfg(all(test, unix))]
    pub(crate) fn unsignalable(command_line: &str) -> Self {
        let (control, mut requests) = mpsc::channel::<Control>(4);
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            let _exited_tx = exited_tx;
            while let Some(Control::Terminate { reply, .. }) = requests.recv().await {
                let _ = reply.send(Err(io::Error::from(io::ErrorKind::PermissionDenied)));
            }
        });

        Self {
            launch_id: Uuid::new_v4(),
            pid: None,
            command_line: command_line.to_string(),
            started_at: Utc::now(),
            control,
            exited,
        }
    }
}

async fn supervise<F>(
    launch_id: Uuid,
    mut child: Child,
    mut control: mpsc::Receiver<Control>,
    exited: watch::Sender<bool>,
    on_exit: F,
) where
    F: FnOnce(Uuid, Option<ExitStatus>),
{
    let mut orphaned = false;
    let mut signalled = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = control.recv(), if !orphaned => match request {
                Some(Control::Terminate { signal, reply }) => {
                    let result = deliver(&mut child, signal);
                    signalled |= result.is_ok();
                    let _ = reply.send(result);
                }
                None => {
                    orphaned = true;
                    // Dropped after a stop: let the delivered signal take its course
                    if !signalled {
                        debug!(%launch_id, "Process handle dropped, killing child");
                        if let Err(e) = deliver(&mut child, StopSignal::Kill) {
                            warn!(%launch_id, "Failed to kill orphaned child: {e}");
                        }
                    }
                }
            },
        }
    };

    let status = match status {
        Ok(status) => {
            info!(%launch_id, %status, "Process exited");
            Some(status)
        }
        Err(e) => {
            warn!(%launch_id, "Failed to wait for process: {e}");
            None
        }
    };

    on_exit(launch_id, status);
    exited.send_replace(true);
}

#[cfg(unix)]
fn deliver(child: &mut Child, signal: StopSignal) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pid = child.id().ok_or_else(already_exited)?;
    let signal = match signal {
        StopSignal::Kill => Signal::SIGKILL,
        StopSignal::Terminate => Signal::SIGTERM,
    };
    killpg(Pid::from_raw(pid as i32), signal)?;
    Ok(())
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _signal: StopSignal) -> io::Result<()> {
    child.start_kill()
}

fn already_exited() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "process already exited")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn sh(script: &str) -> SlotCommand {
        SlotCommand::new("sh", &["-c", script])
    }

    fn limits() -> CaptureLimits {
        CaptureLimits::with_capacity(8)
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let command = SlotCommand::new("./definitely-not-a-real-program", &[]);
        let err = ProcessHandle::spawn(&command, limits(), |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            LauncherError::Spawn { ref program, .. } if program == "./definitely-not-a-real-program"
        ));
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let on_exit = move |id: Uuid, status: Option<ExitStatus>| {
            *record.lock().unwrap() = Some((id, status.and_then(|s| s.code())));
        };
        let (handle, output) =
            ProcessHandle::spawn(&sh("echo hi; exit 3"), limits(), on_exit).unwrap();

        assert_eq!(output.collect().await, vec!["hi"]);
        tokio::time::timeout(Duration::from_secs(5), handle.exited())
            .await
            .expect("exit should be observed");

        assert_eq!(*seen.lock().unwrap(), Some((handle.launch_id(), Some(3))));
    }

    #[tokio::test]
    async fn test_terminate_kills_child() {
        let (handle, mut output) =
            ProcessHandle::spawn(&sh("echo ready; sleep 30"), limits(), |_, _| {}).unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.command_line(), "sh -c echo ready; sleep 30");
        assert_eq!(output.recv().await.as_deref(), Some("ready"));

        // The group signal also reaches the `sleep` holding the pipes
        handle.terminate(StopSignal::Kill).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.exited())
            .await
            .expect("killed child should exit");
        let rest = tokio::time::timeout(Duration::from_secs(5), output.collect())
            .await
            .expect("output should close once the group is dead");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_sigterm_stops_child() {
        let (handle, _output) = ProcessHandle::spawn(&sh("sleep 30"), limits(), |_, _| {}).unwrap();
        handle.terminate(StopSignal::Terminate).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.exited())
            .await
            .expect("SIGTERM should end sleep");
    }

    #[tokio::test]
    async fn test_terminate_after_exit_fails() {
        let (handle, output) = ProcessHandle::spawn(&sh("true"), limits(), |_, _| {}).unwrap();
        output.collect().await;
        handle.exited().await;
        assert!(handle.terminate(StopSignal::Kill).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_handle_kills_child() {
        let (handle, output) = ProcessHandle::spawn(&sh("sleep 30"), limits(), |_, _| {}).unwrap();
        let exited = handle.exited();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), exited)
            .await
            .expect("orphaned child should be killed");
        assert!(output.collect().await.is_empty());
    }
}
