use crate::protocol::{PreloaderRequest, StatusMessage};
use crate::worker_ack;
use anyhow::{Context, Result};
use slog_scope::warn;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// The application's end of the status channel.
#[derive(Debug)]
pub(crate) struct Channel {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Channel {
    /// Takes over the status channel inherited from the supervisor.
    ///
    /// # Safety
    /// `fd` must be an open UNIX domain socket that nothing else in
    /// this process owns.
    pub(crate) unsafe fn from_raw_fd(fd: RawFd) -> Result<Channel> {
        // Programs that the application runs don't get to see it.
        worker_ack::set_cloexec(fd).context("Status FD is not usable")?;
        let writer = UnixStream::from_raw_fd(fd);
        let reader = writer
            .try_clone()
            .context("Could not clone the status channel")?;
        Ok(Channel {
            writer,
            reader: BufReader::new(reader),
        })
    }

    /// Sends a message. Each message goes out in a single write, so
    /// messages from processes sharing the channel don't interleave.
    pub(crate) fn send(&mut self, msg: &StatusMessage) -> Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .context("Could not write to the status channel")?;
        Ok(())
    }

    /// Reads the next request from the supervisor, or `None` once it
    /// has closed the channel. Unintelligible requests get answered
    /// with an error and skipped.
    pub(crate) fn next_request(&mut self) -> Result<Option<PreloaderRequest>> {
        loop {
            let mut line = String::new();
            let count = self
                .reader
                .read_line(&mut line)
                .context("Could not read from the status channel")?;
            if count == 0 {
                return Ok(None);
            }
            match serde_json::from_str(&line) {
                Ok(request) => return Ok(Some(request)),
                Err(e) => {
                    warn!("could not parse request"; "line" => line.trim_end(), "error" => %e);
                    self.send(&StatusMessage::Error {
                        message: format!("could not parse request {:?}: {}", line.trim_end(), e),
                    })?;
                }
            }
        }
    }
}
