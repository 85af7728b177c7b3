/// Terminate a spawned process together with everything it spawned.
///
/// On Unix the child is started as the leader of a new process group
/// (`process_group(0)`), so its pid doubles as the group id and a single
/// `killpg` reaches every descendant that did not deliberately leave the
/// group. Elsewhere only the direct child can be killed.
use tokio::process::{Child, Command};

/// Configure `command` so its whole tree can later be killed as one unit.
pub fn isolate(command: &mut Command) {
    #[cfg(unix)]
    command.process_group(0);
    command.kill_on_drop(true);
}

/// Send SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Whole group already gone
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn kill_tree(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Kills the process tree on drop unless disarmed.
///
/// Held by the runner from spawn until the child is reaped, so an error
/// propagating mid-run or a dropped run future never leaves the build tool
/// and its workers behind.
pub struct TreeGuard {
    pid: Option<u32>,
}

impl TreeGuard {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// Kill the tree now (and the direct child through its handle as a
    /// fallback for platforms without process groups).
    pub fn kill(&mut self, child: &mut Child) {
        if let Some(pid) = self.pid.take() {
            if let Err(e) = kill_tree(pid) {
                tracing::warn!(pid, error = %e, "failed to kill process group");
            }
        }
        if let Err(e) = child.start_kill() {
            // Already reaped or exited
            tracing::debug!(error = %e, "start_kill on child failed");
        }
    }

    /// The child exited on its own; nothing left to clean up.
    pub fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            tracing::warn!(pid, "run abandoned before child exited, killing process group");
            let _ = kill_tree(pid);
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::testing::{is_alive, wait_until_dead};
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_kill_tree_reaches_grandchild() {
        let mut cmd = sh("sleep 30 & echo $!; wait");
        cmd.stdout(Stdio::piped());
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let stdout = child.stdout.take().unwrap();
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();
        assert!(is_alive(grandchild));

        kill_tree(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(wait_until_dead(grandchild, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_kill_tree_on_exited_group_is_ok() {
        let mut cmd = sh("exit 0");
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(kill_tree(pid).is_ok());
    }

    #[tokio::test]
    async fn test_guard_drop_kills_tree() {
        let mut cmd = sh("sleep 30");
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        {
            let _guard = TreeGuard::new(Some(pid));
        }
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should die once the guard drops")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_process_alone() {
        let mut cmd = sh("sleep 0.3");
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        {
            let mut guard = TreeGuard::new(child.id());
            guard.disarm();
        }
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
