//! Standalone process that opens one character backend and answers every
//! line it receives. Handy for poking at a transport by hand, and the
//! process the integration tests drive.
//!
//! Usage: chardev-host <ADDRESS> [--mux] [--escape HEX] [--config FILE]

use std::cell::RefCell;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use chardev::{
    ChardevError, ChardevSpec, ChrEvent, Chardev, EventLoop, Frontend, HostConfig, Mux, MuxOptions,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: chardev-host <ADDRESS> [--mux] [--escape HEX] [--config FILE]";

/// Replies not yet accepted by the backend. Consumers stop taking input
/// once this much is queued.
const OUTBOX_LIMIT: usize = 16 * 1024;
const LINE_MAX: usize = 1024;

// ── Arguments ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Args {
    address: Option<String>,
    mux: bool,
    escape: Option<u8>,
    config: Option<PathBuf>,
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = argv.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--mux" => args.mux = true,
            "--escape" => {
                let hex = it.next().ok_or("--escape needs a value")?;
                let digits = hex.trim_start_matches("0x");
                let byte = u8::from_str_radix(digits, 16).map_err(|_| format!("bad escape '{hex}'"))?;
                args.escape = Some(byte);
            }
            "--config" => {
                let path = it.next().ok_or("--config needs a file")?;
                args.config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag '{flag}'")),
            address => {
                if args.address.replace(address.to_string()).is_some() {
                    return Err("only one address may be given".to_string());
                }
            }
        }
    }
    if args.address.is_none() && args.config.is_none() {
        return Err("missing address".to_string());
    }
    Ok(args)
}

/// Merge the config file (if any) with the command line. A `mon:` address
/// is unwrapped into the plain backend plus multiplexer options.
fn host_config(args: &Args) -> Result<HostConfig, ChardevError> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| ChardevError::Open {
                path: path.clone(),
                source: e,
            })?;
            HostConfig::from_json(&text)?
        }
        None => HostConfig {
            backend: ChardevSpec::Null,
            mux: None,
            consumers: Vec::new(),
        },
    };
    if let Some(address) = &args.address {
        cfg.backend = address.parse()?;
    }
    if let ChardevSpec::Mux { inner, opts } = cfg.backend.clone() {
        cfg.backend = *inner;
        cfg.mux.get_or_insert(opts);
    }
    if args.mux || args.escape.is_some() {
        let opts = cfg.mux.get_or_insert_with(MuxOptions::default);
        if let Some(escape) = args.escape {
            opts.escape_char = escape;
        }
    }
    if cfg.consumers.is_empty() {
        cfg.consumers.push("console".to_string());
        if cfg.mux.is_some() {
            cfg.consumers.push("monitor".to_string());
        }
    }
    Ok(cfg)
}

// ── Line-echo consumer ───────────────────────────────────────────────

/// Collects input into lines and queues `NAME: LINE\r\n` for each one.
struct LineEcho {
    name: String,
    line: Vec<u8>,
    outbox: Rc<RefCell<Vec<u8>>>,
}

impl LineEcho {
    fn new(name: &str, outbox: &Rc<RefCell<Vec<u8>>>) -> Self {
        LineEcho {
            name: name.to_string(),
            line: Vec::new(),
            outbox: Rc::clone(outbox),
        }
    }
}

impl Frontend for LineEcho {
    fn can_receive(&mut self) -> usize {
        OUTBOX_LIMIT.saturating_sub(self.outbox.borrow().len())
    }

    fn receive(&mut self, buf: &[u8]) {
        for &byte in buf {
            match byte {
                b'\r' | b'\n' => {
                    if self.line.is_empty() {
                        continue;
                    }
                    let mut outbox = self.outbox.borrow_mut();
                    outbox.extend_from_slice(self.name.as_bytes());
                    outbox.extend_from_slice(b": ");
                    outbox.append(&mut self.line);
                    outbox.extend_from_slice(b"\r\n");
                }
                _ if self.line.len() < LINE_MAX => self.line.push(byte),
                _ => {}
            }
        }
    }

    fn event(&mut self, event: ChrEvent) {
        if matches!(event, ChrEvent::Reset | ChrEvent::Closed) {
            self.line.clear();
        }
        tracing::info!(consumer = %self.name, ?event, "event");
    }
}

fn flush_outbox(dev: &mut dyn Chardev, outbox: &RefCell<Vec<u8>>) -> io::Result<()> {
    let mut outbox = outbox.borrow_mut();
    while !outbox.is_empty() {
        let n = dev.write(&outbox)?;
        if n == 0 {
            break;
        }
        outbox.drain(..n);
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────────

fn run(cfg: HostConfig) -> chardev::Result<()> {
    let outbox = Rc::new(RefCell::new(Vec::new()));
    let mut backend = chardev::open(&cfg.backend)?;

    let dev: Box<dyn Chardev> = match cfg.mux {
        Some(opts) => {
            let mut mux = Mux::new(backend, opts)?;
            for name in &cfg.consumers {
                mux.set_frontend(Box::new(LineEcho::new(name, &outbox)))?;
            }
            Box::new(mux)
        }
        None => {
            if cfg.consumers.len() > 1 {
                tracing::warn!(
                    extra = cfg.consumers.len() - 1,
                    "without a multiplexer only the first consumer is attached"
                );
            }
            backend.set_frontend(Box::new(LineEcho::new(&cfg.consumers[0], &outbox)))?;
            backend
        }
    };
    let dev = Rc::new(RefCell::new(dev));

    let mut ev = EventLoop::new()?;
    ev.register(&dev);
    tracing::info!(backend = %cfg.backend, mux = cfg.mux.is_some(), consumers = ?cfg.consumers, "chardev host ready");

    loop {
        ev.turn(Duration::from_secs(1))?;
        let mut dev = dev.borrow_mut();
        if let Err(e) = flush_outbox(&mut **dev, &outbox) {
            tracing::warn!(error = %e, "reply not written");
            outbox.borrow_mut().clear();
        }
        dev.accept_input();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CHARDEV_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("chardev-host: {msg}");
            eprintln!("{USAGE}");
            process::exit(1);
        }
    };

    let result = host_config(&args).and_then(run);
    if let Err(e) = result {
        tracing::error!(error = %e, "chardev host failed");
        eprintln!("chardev-host: {e}");
        process::exit(1);
    }
}
