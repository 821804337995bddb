use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{JudgeError, Result};

use super::landlock::{FilesystemPolicy, Ruleset, restrict_self};
use super::{
    Artifact, InteractiveIo, OutputBuffer, ResourceLimits, RunResult, RunStatus, SandboxRunner,
    SpawnHook,
};

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
// How long pipe readers may keep draining once the process group is gone
const READER_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8192;

/// Runs programs as plain child processes confined by OS primitives
///
/// Every child gets its own process group (killed as a whole), a cleared
/// environment, the workspace as working and home directory, rlimits on
/// memory, CPU, stack, file size and descriptors. Optionally it also gets
/// fresh user + network namespaces so it has no network access, and a
/// Landlock ruleset so the only writable place it can see is its workspace.
pub struct ProcessRunner {
    isolate_network: bool,
    filesystem: Option<FilesystemPolicy>,
}

impl ProcessRunner {
    pub fn new(isolate_network: bool) -> Self {
        Self {
            isolate_network,
            filesystem: None,
        }
    }

    /// Restricts every child's view of the filesystem to its workspace plus `policy`
    pub fn confine_filesystem(mut self, policy: FilesystemPolicy) -> Self {
        self.filesystem = Some(policy);
        self
    }

    pub fn isolates_network(&self) -> bool {
        self.isolate_network
    }

    pub fn confines_filesystem(&self) -> bool {
        self.filesystem.is_some()
    }

    /// Checks whether this host lets an unprivileged process enter new namespaces
    pub fn supports_network_isolation() -> bool {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(enter_namespaces);
        }

        match cmd.status() {
            Ok(status) => status.success(),
            Err(e) => {
                log::debug!("Namespace check failed: {e}");
                false
            }
        }
    }

    fn spawn(&self, artifact: &Artifact, limits: &ResourceLimits) -> Result<Child> {
        let spawn_failed = |source: io::Error| {
            log::error!("Failed to spawn `{}`: {source}", artifact.program);
            JudgeError::SpawnFailed {
                program: artifact.program.clone(),
                source,
            }
        };
        // Kept open until the child has exec'd
        let ruleset = self
            .filesystem
            .as_ref()
            .map(|policy| policy.ruleset(&artifact.workdir))
            .transpose()
            .map_err(spawn_failed)?;
        let ruleset_fd = ruleset.as_ref().map(Ruleset::raw_fd);

        let mut cmd = Command::new(&artifact.program);
        cmd.args(&artifact.args)
            .current_dir(&artifact.workdir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &artifact.workdir)
            .env("TMPDIR", &artifact.workdir)
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rlimits = limits.rlimits();
        let isolate_network = self.isolate_network;
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if isolate_network {
                    enter_namespaces()?;
                }
                rlimits.apply()?;
                match ruleset_fd {
                    Some(fd) => restrict_self(fd),
                    None => Ok(()),
                }
            });
        }

        let child = cmd.spawn().map_err(spawn_failed)?;
        drop(ruleset);
        Ok(child)
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    async fn run_observed(
        &self,
        artifact: &Artifact,
        limits: &ResourceLimits,
        stdin: Option<String>,
        on_spawn: SpawnHook<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let mut child = self.spawn(artifact, limits)?;
        let started = Instant::now();
        let mut group = ProcessGroup::of(&child);
        log::debug!("Spawned `{}` as pid {:?}", artifact.program, child.id());
        if let Some(pid) = child.id() {
            on_spawn(pid);
        }

        let stdout = Arc::new(OutputBuffer::new(limits.output));
        let stderr = Arc::new(OutputBuffer::new(limits.output));
        let readers = attach_readers(&mut child, &stdout, &stderr, None);
        let writer = child.stdin.take().map(|mut pipe| {
            tokio::spawn(async move {
                if let Some(text) = stdin
                    && let Err(e) = pipe.write_all(text.as_bytes()).await
                {
                    log::debug!("Process closed stdin before reading all input: {e}");
                }
                // Dropping the pipe delivers EOF
            })
        });

        let status = supervise(
            &mut child,
            &mut group,
            started + limits.wall_time,
            None,
            cancel,
        )
        .await;
        let wall_time = started.elapsed();

        if let Some(writer) = writer {
            writer.abort();
        }
        drain_readers(readers).await;
        let status = status?;

        Ok(RunResult {
            status,
            stdout: stdout.contents(),
            stderr: stderr.contents(),
            wall_time,
            output_truncated: stdout.is_truncated() || stderr.is_truncated(),
        })
    }

    async fn run_interactive(
        &self,
        artifact: &Artifact,
        limits: &ResourceLimits,
        io: InteractiveIo,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let InteractiveIo {
            input,
            output,
            idle_timeout,
            on_spawn,
        } = io;

        let mut child = self.spawn(artifact, limits)?;
        let started = Instant::now();
        let mut group = ProcessGroup::of(&child);
        if let Some(pid) = child.id() {
            on_spawn(pid);
        }

        let activity = Arc::new(Activity::new());
        let readers = attach_readers(&mut child, &output, &output, Some(&activity));
        let writer = child
            .stdin
            .take()
            .map(|pipe| tokio::spawn(pump_input(pipe, input, activity.clone())));

        let status = supervise(
            &mut child,
            &mut group,
            started + limits.wall_time,
            Some((&activity, idle_timeout)),
            cancel,
        )
        .await;
        let wall_time = started.elapsed();

        if let Some(writer) = writer {
            writer.abort();
        }
        drain_readers(readers).await;
        let status = status?;

        Ok(RunResult {
            status,
            stdout: String::new(),
            stderr: String::new(),
            wall_time,
            output_truncated: output.is_truncated(),
        })
    }
}

/// Races process exit against the deadlines and cancellation
///
/// Whatever fires first wins; on anything but a normal exit the whole process
/// group is killed and the child reaped before returning. Stragglers left in
/// the group after a normal exit are killed too.
async fn supervise(
    child: &mut Child,
    group: &mut ProcessGroup,
    deadline: Instant,
    idle: Option<(&Activity, Duration)>,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    let stopped = loop {
        let idle_deadline = idle.map(|(activity, limit)| activity.idle_deadline(limit));

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                group.kill();
                return Ok(classify(status));
            }
            _ = sleep_until(deadline.into()) => break RunStatus::TimedOut,
            _ = sleep_until_some(idle_deadline) => {
                // Activity may have happened while we slept
                if let Some((activity, limit)) = idle
                    && Instant::now() >= activity.idle_deadline(limit)
                {
                    break RunStatus::IdleTimeout;
                }
            }
            _ = cancel.cancelled() => break RunStatus::Cancelled,
        }
    };

    group.kill();
    child.wait().await?;
    Ok(stopped)
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn classify(status: ExitStatus) -> RunStatus {
    if let Some(code) = status.code() {
        RunStatus::Exited(code)
    } else if let Some(signal) = status.signal() {
        if signal == libc::SIGXCPU {
            RunStatus::TimedOut
        } else {
            RunStatus::Signaled(signal)
        }
    } else {
        RunStatus::Exited(-1)
    }
}

fn enter_namespaces() -> io::Result<()> {
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The child's process group; killing it reaches every descendant that stayed in it
struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().map(|pid| pid as libc::pid_t),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // ESRCH only means the group is already empty
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Last time an interactive process produced output or received input
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn idle_deadline(&self, limit: Duration) -> Instant {
        *self.last.lock() + limit
    }
}

fn attach_readers(
    child: &mut Child,
    stdout: &Arc<OutputBuffer>,
    stderr: &Arc<OutputBuffer>,
    activity: Option<&Arc<Activity>>,
) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(spawn_reader(pipe, stdout.clone(), activity.cloned()));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(spawn_reader(pipe, stderr.clone(), activity.cloned()));
    }
    readers
}

/// Copies a pipe into a buffer until EOF; keeps draining past the buffer limit
fn spawn_reader<R>(
    mut pipe: R,
    sink: Arc<OutputBuffer>,
    activity: Option<Arc<Activity>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    sink.append(&chunk[..n]);
                    if let Some(activity) = &activity {
                        activity.touch();
                    }
                }
                Err(e) => {
                    log::debug!("Output pipe read failed: {e}");
                    break;
                }
            }
        }
    })
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if timeout(READER_GRACE, &mut reader).await.is_err() {
            // A descendant escaped the process group and still holds the pipe
            log::warn!("Output reader still busy after process teardown, aborting it");
            reader.abort();
        }
    }
}

/// Writes queued lines to the child's stdin in order, each terminated by `\n`
async fn pump_input(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<String>,
    activity: Arc<Activity>,
) {
    while let Some(mut line) = input.recv().await {
        activity.touch();
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            log::debug!("Process stdin closed: {e}");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit_code() {
        assert_eq!(classify(ExitStatus::from_raw(0)), RunStatus::Exited(0));
        assert_eq!(classify(ExitStatus::from_raw(3 << 8)), RunStatus::Exited(3));
    }

    #[test]
    fn test_classify_signals() {
        assert_eq!(
            classify(ExitStatus::from_raw(libc::SIGSEGV)),
            RunStatus::Signaled(libc::SIGSEGV)
        );
        assert_eq!(
            classify(ExitStatus::from_raw(libc::SIGXCPU)),
            RunStatus::TimedOut
        );
    }

    #[test]
    fn test_idle_deadline_moves_with_activity() {
        let activity = Activity::new();
        let first = activity.idle_deadline(Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(5));
        activity.touch();
        assert!(activity.idle_deadline(Duration::from_secs(1)) > first);
    }
}
