use std::fs::{File, OpenOptions};
use std::io::Read;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::config::{Config, TransportKind};
use crate::error::DecoderError;

const READ_BUF_SIZE: usize = 16384;

/// One transport-level read unit. Ephemeral: handed to the parser and dropped.
pub struct RawChunk {
    pub bytes: Vec<u8>,
    pub captured_at: Instant,
}

/// Supplies a continuous byte stream from the metadata source, absorbing
/// transport failure.
///
/// The FIFO is reopened transparently after the writer closes it, and a
/// missing or inaccessible transport is retried on a fixed backoff, so the
/// owning loop never observes a persistent closed state. Every read is
/// guarded by a bounded readiness wait; nothing here blocks indefinitely.
pub struct FrameReader {
    config: Config,
    conn: Conn,
    retry_at: Option<Instant>,
    retries: u64,
    last_error: Option<String>,
}

enum Conn {
    Closed,
    Fifo(File),
    Udp(UdpSocket),
}

enum ReadOutcome {
    Data(Vec<u8>),
    Empty,
    Eof,
    Failed(String),
}

impl FrameReader {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            conn: Conn::Closed,
            retry_at: None,
            retries: 0,
            last_error: None,
        }
    }

    /// Number of recoverable transport failures seen so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Most recent recoverable transport error, for diagnostics.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Idempotently ensure the transport exists and is open for reading.
    ///
    /// `Configuration` (path exists but is not a FIFO) is fatal and should
    /// prevent startup; `TransportUnavailable` is recoverable and will be
    /// retried from `poll_chunk` on a backoff.
    pub fn open(&mut self) -> Result<(), DecoderError> {
        if !matches!(self.conn, Conn::Closed) {
            return Ok(());
        }
        self.conn = match self.config.transport {
            TransportKind::Fifo => {
                ensure_fifo(&self.config.pipe_path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .custom_flags(OFlag::O_NONBLOCK.bits())
                    .open(&self.config.pipe_path)
                    .map_err(|e| {
                        DecoderError::TransportUnavailable(format!(
                            "cannot open {:?}: {}",
                            self.config.pipe_path, e
                        ))
                    })?;
                log::debug!("Opened metadata pipe {:?}", self.config.pipe_path);
                Conn::Fifo(file)
            }
            TransportKind::Multicast => {
                let socket =
                    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.multicast_port))
                        .and_then(|socket| {
                            socket.join_multicast_v4(
                                &self.config.multicast_group,
                                &Ipv4Addr::UNSPECIFIED,
                            )?;
                            Ok(socket)
                        })
                        .map_err(|e| {
                            DecoderError::TransportUnavailable(format!(
                                "cannot join {}:{}: {}",
                                self.config.multicast_group, self.config.multicast_port, e
                            ))
                        })?;
                log::debug!(
                    "Joined metadata multicast group {}:{}",
                    self.config.multicast_group,
                    self.config.multicast_port
                );
                Conn::Udp(socket)
            }
        };
        Ok(())
    }

    /// Wait up to `timeout` for readability and return whatever bytes are
    /// available. `None` means no data this round, never an error: transport
    /// failures are absorbed here and retried with backoff.
    pub fn poll_chunk(&mut self, timeout: Duration) -> Option<RawChunk> {
        if matches!(self.conn, Conn::Closed) {
            if let Some(at) = self.retry_at {
                let now = Instant::now();
                if now < at {
                    // Not yet due for a reopen attempt; keep the loop paced.
                    std::thread::sleep((at - now).min(timeout));
                    return None;
                }
            }
            if let Err(e) = self.open() {
                self.note_failure(e.to_string());
                return None;
            }
            self.retry_at = None;
        }

        let outcome = match &mut self.conn {
            Conn::Closed => return None,
            Conn::Fifo(file) => read_fifo(file, timeout),
            Conn::Udp(socket) => read_datagram(socket, timeout),
        };

        match outcome {
            ReadOutcome::Data(bytes) => Some(RawChunk {
                bytes,
                captured_at: Instant::now(),
            }),
            ReadOutcome::Empty => None,
            ReadOutcome::Eof => {
                // Writer closed its end; reopen shortly. A fresh open with no
                // writer attached hits EOF immediately, so the short delay
                // keeps this from spinning.
                log::debug!("Metadata pipe closed by writer, reopening");
                self.conn = Conn::Closed;
                self.retry_at = Some(Instant::now() + self.config.reopen_delay);
                None
            }
            ReadOutcome::Failed(reason) => {
                log::warn!("Transport read failed: {}", reason);
                self.conn = Conn::Closed;
                self.note_failure(reason);
                None
            }
        }
    }

    fn note_failure(&mut self, reason: String) {
        self.retries += 1;
        self.last_error = Some(reason);
        self.retry_at = Some(Instant::now() + self.config.retry_backoff);
    }
}

/// Create the FIFO if missing (world-readable/writable, so the streaming
/// process can write into it) and reject paths that exist as something else.
fn ensure_fifo(path: &Path) -> Result<(), DecoderError> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_fifo() {
                return Err(DecoderError::Configuration(format!(
                    "{:?} exists but is not a FIFO",
                    path
                )));
            }
            Ok(())
        }
        Err(_) => {
            log::info!("Creating metadata pipe at {:?}", path);
            match mkfifo(path, Mode::from_bits_truncate(0o666)) {
                Ok(()) => {
                    // mkfifo is subject to the umask; force the intended mode.
                    let perms = std::fs::Permissions::from_mode(0o666);
                    if let Err(e) = std::fs::set_permissions(path, perms) {
                        log::warn!("Could not set pipe permissions on {:?}: {}", path, e);
                    }
                    Ok(())
                }
                Err(Errno::EEXIST) => Ok(()),
                Err(e) => Err(DecoderError::TransportUnavailable(format!(
                    "cannot create FIFO {:?}: {}",
                    path, e
                ))),
            }
        }
    }
}

fn read_fifo(file: &mut File, timeout: Duration) -> ReadOutcome {
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) => return ReadOutcome::Empty,
        Ok(_) => {}
        Err(Errno::EINTR) => return ReadOutcome::Empty,
        Err(e) => return ReadOutcome::Failed(format!("poll failed: {}", e)),
    }

    // Readable or hung up; either way a read tells us which. POLLHUP with
    // buffered data still yields the data first.
    let mut buf = vec![0u8; READ_BUF_SIZE];
    match file.read(&mut buf) {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => {
            buf.truncate(n);
            ReadOutcome::Data(buf)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::Empty,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadOutcome::Empty,
        Err(e) => ReadOutcome::Failed(format!("read failed: {}", e)),
    }
}

fn read_datagram(socket: &mut UdpSocket, timeout: Duration) -> ReadOutcome {
    if let Err(e) = socket.set_read_timeout(Some(timeout)) {
        return ReadOutcome::Failed(format!("set_read_timeout failed: {}", e));
    }
    let mut buf = vec![0u8; READ_BUF_SIZE];
    match socket.recv(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            ReadOutcome::Data(buf)
        }
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            ReadOutcome::Empty
        }
        Err(e) => ReadOutcome::Failed(format!("recv failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("airpipe-transport-{}-{}", name, std::process::id()))
    }

    fn fifo_config(path: &Path) -> Config {
        Config {
            pipe_path: path.to_path_buf(),
            reopen_delay: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(50),
            ..Config::default()
        }
    }

    #[test]
    fn regular_file_is_a_configuration_error() {
        let path = temp_path("regular");
        std::fs::write(&path, b"not a fifo").unwrap();
        let mut reader = FrameReader::new(&fifo_config(&path));
        match reader.open() {
            Err(DecoderError::Configuration(_)) => {}
            other => panic!("expected Configuration error, got {:?}", other.err()),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_parent_is_recoverable() {
        let path = temp_path("no-parent").join("nested").join("pipe");
        let mut reader = FrameReader::new(&fifo_config(&path));
        match reader.open() {
            Err(DecoderError::TransportUnavailable(_)) => {}
            other => panic!("expected TransportUnavailable, got {:?}", other.err()),
        }
        // poll_chunk absorbs the failure and surfaces it via the counters.
        assert!(reader.poll_chunk(Duration::from_millis(10)).is_none());
        assert_eq!(reader.retries(), 1);
        assert!(reader.last_error().is_some());
    }

    #[test]
    fn creates_fifo_and_times_out_without_data() {
        let path = temp_path("empty");
        std::fs::remove_file(&path).ok();
        let mut reader = FrameReader::new(&fifo_config(&path));
        reader.open().unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        assert!(reader.poll_chunk(Duration::from_millis(20)).is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn yields_bytes_and_recovers_after_writer_closes() {
        let path = temp_path("reopen");
        std::fs::remove_file(&path).ok();
        let mut reader = FrameReader::new(&fifo_config(&path));
        reader.open().unwrap();

        let write = |bytes: &'static [u8]| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut pipe = OpenOptions::new().write(true).open(&path).unwrap();
                pipe.write_all(bytes).unwrap();
            })
        };

        write(b"first").join().unwrap();
        let mut got = Vec::new();
        for _ in 0..50 {
            if let Some(chunk) = reader.poll_chunk(Duration::from_millis(20)) {
                got.extend_from_slice(&chunk.bytes);
                if got == b"first" {
                    break;
                }
            }
        }
        assert_eq!(got, b"first");

        // Writer has dropped its end; the reader must reopen and see the
        // next writer's bytes without intervention. The writer's open blocks
        // until the reader has reopened, so poll before joining.
        let second = write(b"second");
        let mut got = Vec::new();
        for _ in 0..100 {
            if let Some(chunk) = reader.poll_chunk(Duration::from_millis(20)) {
                got.extend_from_slice(&chunk.bytes);
                if got == b"second" {
                    break;
                }
            }
        }
        second.join().unwrap();
        assert_eq!(got, b"second");
        std::fs::remove_file(&path).ok();
    }
}
