/// Signal handling for the CLI.
///
/// Build-tool children run in their own process group, so a terminal Ctrl-C
/// never reaches them directly. The CLI races its work against
/// [`shutdown`]; dropping the in-flight run fires the runner's process-tree
/// guard.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl Shutdown {
    /// Conventional exit status for a process stopped by this signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Shutdown::Interrupt => 130,
            Shutdown::Terminate => 143,
        }
    }
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shutdown::Interrupt => f.write_str("SIGINT"),
            Shutdown::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown() -> std::io::Result<Shutdown> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|()| Shutdown::Interrupt),
        _ = terminate.recv() => Ok(Shutdown::Terminate),
    }
}

#[cfg(not(unix))]
pub async fn shutdown() -> std::io::Result<Shutdown> {
    tokio::signal::ctrl_c().await?;
    Ok(Shutdown::Interrupt)
}
