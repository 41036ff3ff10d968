//! Contains the plumbing for the status channel between the spawner
//! and the loader processes it starts: a UNIX domain socket pair, one
//! end of which gets inherited by the loader.

use crate::preloader::logging;
use crate::protocol::StatusMessage;
use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::UnixStream;

/// The environment variable that tells the loader how to behave. It
/// is `$ZWILLING_MODE`, either `direct` or `preload`.
pub const MODE_ENV: &str = "ZWILLING_MODE";

/// The environment variable used to pass the status channel's FD
/// number. It is `$ZWILLING_STATUS_FD`.
pub const STATUS_FD_ENV: &str = "ZWILLING_STATUS_FD";

/// The environment variable used to pass the worker ID to a directly
/// spawned worker. It is `$ZWILLING_WORKER_ID`.
pub const WORKER_ID_ENV: &str = "ZWILLING_WORKER_ID";

/// The environment variable used to pass the endpoint path to a
/// directly spawned worker. It is `$ZWILLING_SOCKET`.
pub const SOCKET_ENV: &str = "ZWILLING_SOCKET";

/// The environment variable used to pass the application name. It is
/// `$ZWILLING_APP`.
pub const APP_ENV: &str = "ZWILLING_APP";

/// How a loader process was asked to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Load the application and become a worker.
    Direct,

    /// Load the application and duplicate it into workers on request.
    Preload,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Preload => "preload",
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Mode> {
        match s {
            "direct" => Ok(Mode::Direct),
            "preload" => Ok(Mode::Preload),
            other => anyhow::bail!("Unknown loader mode {:?}", other),
        }
    }
}

/// The loader's end of a status channel. It stays open in the spawner
/// until the loader process has been started, and gets closed when
/// this is dropped.
#[derive(Debug)]
pub struct InheritableFd(std::os::unix::net::UnixStream);

impl InheritableFd {
    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Returns a base-10 representation of the FD number.
    pub fn to_env_value(&self) -> String {
        self.as_raw_fd().to_string()
    }
}

/// Opens a streaming UNIX domain socket pair. Returns the end that a
/// loader process should inherit, and our end.
///
/// Both ends are close-on-exec; the loader's end only loses that flag
/// inside the child that is meant to inherit it (see
/// [`clear_cloexec`]), so concurrently started programs never see it.
pub fn status_channel() -> Result<(InheritableFd, UnixStream)> {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair()
        .context("Could not initialize status channel socket pair")?;
    ours.set_nonblocking(true)
        .context("Could not make the status channel non-blocking")?;
    let ours = UnixStream::from_std(ours).context("unable to setup UNIX stream")?;
    Ok((InheritableFd(theirs), ours))
}

/// Lets `fd` survive `exec`. Meant to run between fork and exec.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Keeps programs that `fd`'s owner execs from inheriting it.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Reads the next message off a status channel. Log messages get
/// logged here and are never returned. Returns `None` once the other
/// side has closed the channel.
pub async fn read_status<R>(reader: &mut R) -> Result<Option<StatusMessage>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        let count = reader.read_line(&mut line).await?;
        if count == 0 {
            return Ok(None);
        }
        let msg: StatusMessage = serde_json::from_str(&line)
            .with_context(|| format!("Could not parse status message {:?}", line.trim_end()))?;
        if let Some(msg) = logging::translate_message(msg) {
            return Ok(Some(msg));
        }
    }
}
