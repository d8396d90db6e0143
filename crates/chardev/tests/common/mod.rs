//! Reusable test harness for chardev-host integration tests.
//!
//! Provides helpers for spawning the binary, connecting to the backend it
//! serves over TCP or a Unix socket, and reading replies with timeouts.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};

pub const CTRL_A: u8 = 0x01;

// ── HostHandle ──────────────────────────────────────────────────────

/// Handle to a running chardev-host process. Kills it on drop.
pub struct HostHandle {
    pub child: Child,
    /// Scratch directory for socket files and configs, removed on drop.
    pub dir: tempfile::TempDir,
}

impl HostHandle {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Wait for the process to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => return None,
            }
        }
        None
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ── LineClient ──────────────────────────────────────────────────────

/// Byte-level client for either socket flavor.
pub struct LineClient<S> {
    stream: S,
    pub received: Vec<u8>,
}

pub trait TimedStream: Read + Write {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()>;
}

impl TimedStream for TcpStream {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }
}

impl TimedStream for UnixStream {
    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }
}

impl<S: TimedStream> LineClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            received: Vec::new(),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read until `needle` shows up in everything received so far. Returns
    /// false on timeout or disconnect.
    pub fn read_until(&mut self, needle: &[u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if contains(&self.received, needle) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.stream
                .set_timeout(remaining.max(Duration::from_millis(50)))
                .ok();
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => return contains(&self.received, needle),
                Ok(n) => self.received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return false,
            }
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

// ── Spawn helpers ───────────────────────────────────────────────────

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chardev-host"))
}

/// Spawn chardev-host with the given arguments. `{dir}` in any argument
/// is replaced with the handle's scratch directory.
pub fn spawn_host(args: &[&str]) -> io::Result<HostHandle> {
    let dir = tempfile::tempdir()?;
    let dir_str = dir.path().to_string_lossy().into_owned();
    let mut cmd = Command::new(binary_path());
    for arg in args {
        cmd.arg(arg.replace("{dir}", &dir_str));
    }
    cmd.env("CHARDEV_LOG", "debug")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn()?;
    Ok(HostHandle { child, dir })
}

/// Run chardev-host to completion, capturing its output.
pub fn run_host(args: &[&str]) -> io::Result<Output> {
    Command::new(binary_path())
        .args(args)
        .stdin(Stdio::null())
        .output()
}

/// A TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind spare port");
    listener.local_addr().expect("spare port addr").port()
}

/// Connect, retrying while the host is still starting up.
pub fn connect_tcp(port: u16) -> io::Result<LineClient<TcpStream>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return Ok(LineClient::new(stream)),
            Err(e) if Instant::now() > deadline => return Err(e),
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}

/// Wait for the socket file, then connect.
pub fn connect_unix(path: &Path) -> io::Result<LineClient<UnixStream>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(LineClient::new(stream)),
            Err(e) if Instant::now() > deadline => return Err(e),
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}
