//! Port reclamation for force-listen.
//!
//! When a forced `listen` finds its port taken, the router asks a
//! [`PortReclaimer`] who is listening there and requests that process to
//! terminate. The request is not awaited: the occupant may still hold the
//! port when the router retries its bind.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on the whole lookup-and-terminate procedure.
pub const DEFAULT_PORT_FREE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while freeing a port.
#[derive(Debug, Error)]
pub enum ReclaimError {
    /// The process lookup could not be run.
    #[error("failed to look up the process listening on the port: {0}")]
    Lookup(#[source] io::Error),

    /// The termination signal could not be delivered.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Lookup and termination did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Process signalling is not available on this platform.
    #[error("process signalling is unsupported on this platform")]
    UnsupportedPlatform,
}

/// OS operations used to evict the occupant of a port.
#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// PID of the process listening on `port`, if any.
    async fn find_listener(&self, port: u16) -> Result<Option<u32>, ReclaimError>;

    /// Request graceful termination of `pid`. Does not wait for exit.
    async fn terminate(&self, pid: u32) -> Result<(), ReclaimError>;
}

/// Reclaimer backed by `lsof` and `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemReclaimer;

#[async_trait]
impl PortReclaimer for SystemReclaimer {
    async fn find_listener(&self, port: u16) -> Result<Option<u32>, ReclaimError> {
        // lsof exits non-zero when nothing matches, so only stdout matters
        let output = Command::new("lsof")
            .arg("-t")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ReclaimError::Lookup)?;

        Ok(parse_pids(&output.stdout).into_iter().next())
    }

    async fn terminate(&self, pid: u32) -> Result<(), ReclaimError> {
        if pid == std::process::id() {
            warn!(pid, "Port is held by this process, not signalling");
            return Ok(());
        }
        signal_terminate(pid)
    }
}

/// Parse the one-PID-per-line output of `lsof -t`.
fn parse_pids(stdout: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Send SIGTERM to `pid`.
fn signal_terminate(pid: u32) -> Result<(), ReclaimError> {
    #[cfg(unix)]
    {
        let raw = libc::pid_t::try_from(pid).map_err(|_| ReclaimError::Signal {
            pid,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
        // SAFETY: kill(2) is memory-safe for any PID; an invalid one only
        // yields an error return.
        let result = unsafe { libc::kill(raw, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(ReclaimError::Signal {
                pid,
                source: io::Error::last_os_error(),
            })
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(ReclaimError::UnsupportedPlatform)
    }
}

/// Evict whoever listens on `port`, giving up after `limit`.
///
/// Succeeds as soon as the termination request is issued, or immediately
/// if no listener is found.
pub async fn free_port(
    reclaimer: &dyn PortReclaimer,
    port: u16,
    limit: Duration,
) -> Result<(), ReclaimError> {
    let procedure = async {
        match reclaimer.find_listener(port).await? {
            None => {
                debug!(port, "No listening process found, treating port as free");
                Ok(())
            }
            Some(pid) => {
                info!(port, pid, "Requesting termination of port occupant");
                reclaimer.terminate(pid).await
            }
        }
    };

    timeout(limit, procedure)
        .await
        .map_err(|_| ReclaimError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeReclaimer {
        occupant: Option<u32>,
        terminated: Mutex<Vec<u32>>,
        hang: bool,
    }

    #[async_trait]
    impl PortReclaimer for FakeReclaimer {
        async fn find_listener(&self, _port: u16) -> Result<Option<u32>, ReclaimError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.occupant)
        }

        async fn terminate(&self, pid: u32) -> Result<(), ReclaimError> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids(b"1234\n5678\n"), vec![1234, 5678]);
        assert_eq!(parse_pids(b""), Vec::<u32>::new());
        assert_eq!(parse_pids(b"garbage\n42\n"), vec![42]);
    }

    #[tokio::test]
    async fn test_free_port_terminates_occupant() {
        let reclaimer = FakeReclaimer {
            occupant: Some(4242),
            ..Default::default()
        };
        free_port(&reclaimer, 4441, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(*reclaimer.terminated.lock().unwrap(), vec![4242]);
    }

    #[tokio::test]
    async fn test_free_port_without_occupant() {
        let reclaimer = FakeReclaimer::default();
        free_port(&reclaimer, 4441, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reclaimer.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_free_port_times_out() {
        let reclaimer = FakeReclaimer {
            hang: true,
            ..Default::default()
        };
        let result = free_port(&reclaimer, 4441, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ReclaimError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_system_reclaimer_never_signals_itself() {
        SystemReclaimer
            .terminate(std::process::id())
            .await
            .unwrap();
    }
}
