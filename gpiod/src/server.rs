//! Listener loop: one OS thread per accepted connection, matching the
//! thread-per-chip pattern `gpio_core::tx` and `gpio_core::sampler` use
//! for their own background work (§5, §7).

use std::{
    io::{self, Read, Write},
    net::TcpListener,
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::Arc,
};

use gpio_core::Engine;

use crate::{
    commands::dispatch,
    permit::PermitSet,
    protocol::{write_response, RequestHeader, ResponseHeader},
    session::Session,
};

/// No wire payload this protocol defines (wave steps, script source,
/// file paths) legitimately approaches this; caps a misbehaving or
/// malicious client's `ext_len` before it drives an allocation.
const MAX_EXT_LEN: u32 = 1 << 20;

pub struct ServerConfig {
    pub bind_unix: Option<PathBuf>,
    pub bind_tcp: Option<String>,
    pub notifier_dir: PathBuf,
    pub script_dir: PathBuf,
    pub sbc_name: String,
}

/// Blocks the calling thread accepting connections on every configured
/// listener. Each connection gets its own reader thread; the daemon
/// itself stays single-process, with all real state living in `Engine`.
pub fn run(config: ServerConfig, engine: Arc<Engine>, permits: Arc<PermitSet>) -> io::Result<()> {
    let mut handles = Vec::new();

    if let Some(path) = &config.bind_unix {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "listening on unix socket");
        let engine = engine.clone();
        let permits = permits.clone();
        let config = Arc::new(clone_config(&config));
        handles.push(std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                spawn_client(stream, engine.clone(), permits.clone(), config.clone());
            }
        }));
    }

    if let Some(addr) = &config.bind_tcp {
        let listener = TcpListener::bind(addr)?;
        tracing::info!(addr = %addr, "listening on tcp");
        let engine = engine.clone();
        let permits = permits.clone();
        let config = Arc::new(clone_config(&config));
        handles.push(std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let _ = stream.set_nodelay(true);
                spawn_client(stream, engine.clone(), permits.clone(), config.clone());
            }
        }));
    }

    if handles.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no listener configured"));
    }

    for h in handles {
        let _ = h.join();
    }
    Ok(())
}

fn clone_config(c: &ServerConfig) -> ServerConfig {
    ServerConfig {
        bind_unix: c.bind_unix.clone(),
        bind_tcp: c.bind_tcp.clone(),
        notifier_dir: c.notifier_dir.clone(),
        script_dir: c.script_dir.clone(),
        sbc_name: c.sbc_name.clone(),
    }
}

fn spawn_client<S>(stream: S, engine: Arc<Engine>, permits: Arc<PermitSet>, config: Arc<ServerConfig>)
where
    S: Read + Write + Send + 'static,
{
    std::thread::spawn(move || {
        if let Err(e) = serve_client(stream, &engine, &permits, &config) {
            tracing::debug!(error = %e, "client connection closed");
        }
    });
}

fn serve_client<S: Read + Write>(
    mut stream: S,
    engine: &Arc<Engine>,
    permits: &PermitSet,
    config: &ServerConfig,
) -> io::Result<()> {
    let mut session = Session::new(
        engine.clone(),
        config.notifier_dir.clone(),
        config.script_dir.clone(),
        config.sbc_name.clone(),
    );

    loop {
        let header = match RequestHeader::read_from(&mut stream) {
            Ok(h) => h,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if header.ext_len > MAX_EXT_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ext_len too large"));
        }
        let mut ext = vec![0u8; header.ext_len as usize];
        stream.read_exact(&mut ext)?;

        let result = dispatch(&mut session, permits, &header, &ext);
        let response = if result.status == 0 {
            ResponseHeader::ok(header.cmd, result.payload.len() as u32)
        } else {
            ResponseHeader::error(header.cmd, result.status)
        };
        write_response(&mut stream, response, &result.payload)?;
    }
}

