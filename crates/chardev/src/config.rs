//! Backend addresses: the string syntax, its serde form, and the
//! constructor that turns either into a live backend.
//!
//! | Address | Backend |
//! |---|---|
//! | `null` | discard everything |
//! | `stdio` | process stdin/stdout |
//! | `pty` | fresh pseudo-terminal |
//! | `file:PATH` | write-only file, truncated |
//! | `pipe:NAME` | `NAME.in`/`NAME.out` or `NAME` |
//! | `udp:[HOST]:PORT[@[LHOST]:LPORT]` | datagrams to a fixed peer |
//! | `tcp:[HOST]:PORT[,server][,nowait][,telnet][,nodelay]` | TCP stream |
//! | `telnet:[HOST]:PORT[,...]` | TCP with Telnet negotiation |
//! | `unix:PATH[,server][,nowait][,telnet]` | Unix stream socket |
//! | `/dev/parportN` | parallel port |
//! | `/dev/...` | serial device |
//! | `mon:ADDRESS` | any of the above behind a multiplexer |

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chardev::Chardev;
use crate::error::{ChardevError, Result};
use crate::fd::FdChardev;
use crate::mux::{Mux, MuxOptions};
use crate::null::NullChardev;
use crate::parallel::ParallelChardev;
use crate::pty::PtyChardev;
use crate::serial::SerialChardev;
use crate::socket::{SocketAddress, SocketChardev, SocketOptions};
use crate::stdio::StdioChardev;
use crate::udp::UdpChardev;

const UDP_DEFAULT_HOST: &str = "localhost";
const UDP_DEFAULT_LOCAL: &str = "0.0.0.0:0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChardevSpec {
    Null,
    Stdio,
    Pty,
    File {
        path: PathBuf,
    },
    Pipe {
        name: String,
    },
    Udp {
        /// `host:port` of the peer.
        remote: String,
        /// `host:port` to bind.
        #[serde(default = "default_udp_local")]
        local: String,
    },
    Socket {
        addr: SocketAddress,
        #[serde(default)]
        opts: SocketOptions,
    },
    Parallel {
        path: PathBuf,
    },
    Serial {
        path: PathBuf,
    },
    Mux {
        inner: Box<ChardevSpec>,
        #[serde(default)]
        opts: MuxOptions,
    },
}

fn default_udp_local() -> String {
    UDP_DEFAULT_LOCAL.to_string()
}

/// Settings file for the `chardev-host` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub backend: ChardevSpec,
    /// Wrap the backend in a multiplexer with these options.
    #[serde(default)]
    pub mux: Option<MuxOptions>,
    /// Names of the line-echo consumers to attach.
    #[serde(default = "default_consumers")]
    pub consumers: Vec<String>,
}

fn default_consumers() -> Vec<String> {
    vec!["console".to_string()]
}

impl HostConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ChardevError::InvalidOptions(format!("bad host config: {e}")))
    }
}

// ── Parsing ────────────────────────────────────────────────────────────

/// Split `[HOST]:PORT`, validating the port.
fn split_host_port<'a>(spec: &str, hostport: &'a str) -> Result<(&'a str, u16)> {
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| ChardevError::invalid(spec, "expected [HOST]:PORT"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ChardevError::invalid(spec, format!("bad port '{port}'")))?;
    Ok((host, port))
}

fn parse_udp(spec: &str, rest: &str) -> Result<ChardevSpec> {
    let (remote, local) = match rest.split_once('@') {
        Some((remote, local)) => (remote, Some(local)),
        None => (rest, None),
    };
    let (host, port) = split_host_port(spec, remote)?;
    let host = if host.is_empty() { UDP_DEFAULT_HOST } else { host };
    let local = match local {
        Some(local) => {
            let (lhost, lport) = split_host_port(spec, local)?;
            let lhost = if lhost.is_empty() { "0.0.0.0" } else { lhost };
            format!("{lhost}:{lport}")
        }
        None => UDP_DEFAULT_LOCAL.to_string(),
    };
    Ok(ChardevSpec::Udp {
        remote: format!("{host}:{port}"),
        local,
    })
}

/// Parse the `,flag` list shared by tcp, telnet and unix addresses.
fn parse_flags<'a>(
    spec: &str,
    flags: impl Iterator<Item = &'a str>,
    allowed: &[&str],
) -> Result<SocketOptions> {
    let mut opts = SocketOptions::default();
    let mut nowait = false;
    for flag in flags {
        if !allowed.contains(&flag) {
            return Err(ChardevError::invalid(spec, format!("unknown option '{flag}'")));
        }
        match flag {
            "server" => opts.server = true,
            "nowait" => nowait = true,
            "telnet" => opts.telnet = true,
            "nodelay" => opts.nodelay = true,
            _ => {}
        }
    }
    opts.wait = opts.server && !nowait;
    Ok(opts)
}

fn parse_tcp(spec: &str, rest: &str, force_telnet: bool) -> Result<ChardevSpec> {
    let mut parts = rest.split(',');
    let hostport = parts.next().unwrap_or_default();
    let (host, port) = split_host_port(spec, hostport)?;
    let mut opts = parse_flags(spec, parts, &["server", "nowait", "telnet", "nodelay"])?;
    opts.telnet |= force_telnet;
    let host = match (host.is_empty(), opts.server) {
        (true, true) => "0.0.0.0",
        (true, false) => "localhost",
        (false, _) => host,
    };
    Ok(ChardevSpec::Socket {
        addr: SocketAddress::Tcp(format!("{host}:{port}")),
        opts,
    })
}

fn parse_unix(spec: &str, rest: &str) -> Result<ChardevSpec> {
    let mut parts = rest.split(',');
    let path = parts.next().unwrap_or_default();
    if path.is_empty() {
        return Err(ChardevError::invalid(spec, "missing socket path"));
    }
    let opts = parse_flags(spec, parts, &["server", "nowait", "telnet"])?;
    Ok(ChardevSpec::Socket {
        addr: SocketAddress::Unix(PathBuf::from(path)),
        opts,
    })
}

fn non_empty<'a>(spec: &str, value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() {
        return Err(ChardevError::invalid(spec, format!("missing {what}")));
    }
    Ok(value)
}

impl FromStr for ChardevSpec {
    type Err = ChardevError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("mon:") {
            let inner: ChardevSpec = rest.parse()?;
            if matches!(inner, ChardevSpec::Mux { .. }) {
                return Err(ChardevError::invalid(s, "multiplexers do not nest"));
            }
            return Ok(ChardevSpec::Mux {
                inner: Box::new(inner),
                opts: MuxOptions::default(),
            });
        }
        match s {
            "null" => return Ok(ChardevSpec::Null),
            "stdio" => return Ok(ChardevSpec::Stdio),
            "pty" => return Ok(ChardevSpec::Pty),
            _ => {}
        }
        if let Some(path) = s.strip_prefix("file:") {
            return Ok(ChardevSpec::File {
                path: PathBuf::from(non_empty(s, path, "file path")?),
            });
        }
        if let Some(name) = s.strip_prefix("pipe:") {
            return Ok(ChardevSpec::Pipe {
                name: non_empty(s, name, "pipe name")?.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("udp:") {
            return parse_udp(s, rest);
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            return parse_tcp(s, rest, false);
        }
        if let Some(rest) = s.strip_prefix("telnet:") {
            return parse_tcp(s, rest, true);
        }
        if let Some(rest) = s.strip_prefix("unix:") {
            return parse_unix(s, rest);
        }
        if s.starts_with("/dev/parport") {
            return Ok(ChardevSpec::Parallel { path: PathBuf::from(s) });
        }
        if s.starts_with("/dev/") {
            return Ok(ChardevSpec::Serial { path: PathBuf::from(s) });
        }
        Err(ChardevError::invalid(s, "unknown backend type"))
    }
}

impl fmt::Display for ChardevSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChardevSpec::Null => f.write_str("null"),
            ChardevSpec::Stdio => f.write_str("stdio"),
            ChardevSpec::Pty => f.write_str("pty"),
            ChardevSpec::File { path } => write!(f, "file:{}", path.display()),
            ChardevSpec::Pipe { name } => write!(f, "pipe:{name}"),
            ChardevSpec::Udp { remote, local } => write!(f, "udp:{remote}@{local}"),
            ChardevSpec::Socket { addr, opts } => {
                write!(f, "{addr}")?;
                if opts.server {
                    f.write_str(",server")?;
                    if !opts.wait {
                        f.write_str(",nowait")?;
                    }
                }
                if opts.telnet {
                    f.write_str(",telnet")?;
                }
                if opts.nodelay {
                    f.write_str(",nodelay")?;
                }
                Ok(())
            }
            ChardevSpec::Parallel { path } | ChardevSpec::Serial { path } => {
                write!(f, "{}", path.display())
            }
            ChardevSpec::Mux { inner, .. } => write!(f, "mon:{inner}"),
        }
    }
}

// ── Construction ───────────────────────────────────────────────────────

fn resolve(hostport: &str, want_v4: Option<bool>) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = hostport
        .to_socket_addrs()
        .map_err(|e| ChardevError::invalid(hostport, format!("cannot resolve: {e}")))?
        .collect();
    let same_family = want_v4.and_then(|v4| addrs.iter().find(|a| a.is_ipv4() == v4));
    same_family
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ChardevError::invalid(hostport, "no addresses"))
}

/// Build the backend an address describes.
pub fn open(spec: &ChardevSpec) -> Result<Box<dyn Chardev>> {
    let dev: Box<dyn Chardev> = match spec {
        ChardevSpec::Null => Box::new(NullChardev::new()),
        ChardevSpec::Stdio => Box::new(StdioChardev::new()?),
        ChardevSpec::Pty => Box::new(PtyChardev::open()?),
        ChardevSpec::File { path } => Box::new(FdChardev::open_file_out(path)?),
        ChardevSpec::Pipe { name } => Box::new(FdChardev::open_pipe(name)?),
        ChardevSpec::Udp { remote, local } => {
            let local = resolve(local, None)?;
            let remote = resolve(remote, Some(local.is_ipv4()))?;
            Box::new(UdpChardev::new(local, remote)?)
        }
        ChardevSpec::Socket { addr, opts } => Box::new(SocketChardev::open(addr, *opts)?),
        ChardevSpec::Parallel { path } => Box::new(ParallelChardev::open(path)?),
        ChardevSpec::Serial { path } => Box::new(SerialChardev::open(path)?),
        ChardevSpec::Mux { inner, opts } => Box::new(Mux::new(open(inner)?, *opts)?),
    };
    tracing::debug!(backend = %spec, "backend opened");
    Ok(dev)
}
