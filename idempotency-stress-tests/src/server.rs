use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

pub struct ServerProcess {
    child: Child,
    pub addr: SocketAddr,
    // Kept alive so the config file remains on disk until the process exits.
    _config_file: NamedTempFile,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.child.kill().ok();
    }
}

impl ServerProcess {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Reserve a free TCP port by binding to port 0 and releasing it immediately.
pub fn pick_free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();
    drop(listeners);
    ports
}

/// Return the path to the `idempotency-server` binary that sits alongside this
/// executable in `target/debug/` (or `target/debug/deps/` when run as a test).
fn server_binary_path() -> PathBuf {
    let mut path = std::env::current_exe().expect("cannot determine own executable path");
    path.pop(); // remove own filename
    if path.file_name().map(|n| n == "deps").unwrap_or(false) {
        path.pop(); // step out of target/debug/deps → target/debug/
    }
    path.push("idempotency-server");
    path
}

const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the `idempotency-server` binary, spawn it against an in-memory backend,
/// wait until it is accepting connections, and return the live process.
///
/// Returns `Err` if the build fails, the process cannot be spawned, or the
/// readiness deadline elapses. The caller should map this error to exit code 3.
pub fn spawn_server() -> Result<ServerProcess, String> {
    let status = Command::new("cargo")
        .args(["build", "-p", "idempotency-server"])
        .status()
        .map_err(|e| format!("Failed to invoke cargo build: {e}"))?;
    if !status.success() {
        return Err(format!("cargo build -p idempotency-server failed: {status}"));
    }

    let port = pick_free_ports(1)[0];
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let config_file = NamedTempFile::new().map_err(|e| format!("Failed to create config tmpfile: {e}"))?;
    let config = serde_json::json!({
        "backend": { "backend": "memory", "max_records": null },
        "middleware": {},
    });
    serde_json::to_writer(&config_file, &config).map_err(|e| format!("Failed to write config JSON: {e}"))?;

    let server_bin = server_binary_path();
    let config_path = config_file.path().to_str().unwrap().to_string();

    let child = Command::new(&server_bin)
        .args(["--bind", &addr.to_string(), "--config", &config_path])
        .spawn()
        .map_err(|e| format!("Failed to spawn idempotency-server: {e}"))?;

    let deadline = Instant::now() + READY_TIMEOUT;
    poll_until_ready(addr, deadline).map_err(|e| format!("Server not ready within timeout: {e}"))?;

    Ok(ServerProcess { child, addr, _config_file: config_file })
}

/// Poll `addr` with a TCP connect attempt until the connection succeeds
/// (server is accepting connections) or `deadline` is reached.
fn poll_until_ready(addr: SocketAddr, deadline: Instant) -> Result<(), String> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("timed out waiting for {addr}"));
        }
        let probe = Duration::min(remaining, Duration::from_millis(200));
        if TcpStream::connect_timeout(&addr, probe).is_ok() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
