use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use agent_gateway::sandbox::REFUSAL_EXIT_CODE;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

fn daemon() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_agent-gatewayd"));
    command
        .env_clear()
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .env("GATEWAY_SHARED_SECRET", "daemon-test-secret")
        .env("GATEWAY_LISTEN_ADDR", "127.0.0.1:0")
        .env("GATEWAY_EXECUTION_MODE", "container");
    command
}

fn run_to_exit(command: &mut Command) -> Output {
    let started = Instant::now();
    let output = command.output().expect("run agent-gatewayd");
    assert!(
        started.elapsed() < STARTUP_TIMEOUT,
        "refusal took {:?}",
        started.elapsed()
    );
    output
}

fn assert_refused(output: &Output, needle: &str) {
    assert_eq!(output.status.code(), Some(REFUSAL_EXIT_CODE), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("refusing to start"), "{stderr}");
    assert!(stderr.contains(needle), "{stderr}");
}

#[test]
fn container_without_isolation_or_override_exits() {
    let output = run_to_exit(daemon().env("GATEWAY_NETWORK_ISOLATION", "false"));
    assert_refused(&output, "GATEWAY_ALLOW_UNISOLATED");
}

#[test]
fn missing_sentinel_exits_even_with_override() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = dir.path().join("network-isolation.ready");
    let output = run_to_exit(
        daemon()
            .env("GATEWAY_NETWORK_ISOLATION", "true")
            .env("GATEWAY_ALLOW_UNISOLATED", "true")
            .env("GATEWAY_SANDBOX_SENTINEL", &sentinel),
    );
    assert_refused(&output, &sentinel.display().to_string());
}

struct Running {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl Running {
    fn spawn(command: &mut Command) -> Self {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn agent-gatewayd");
        let stdout = child.stdout.take().expect("piped stdout");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { child, lines }
    }

    /// Collects log lines until one contains `needle`.
    fn wait_for(&mut self, needle: &str) -> Vec<String> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let mut seen = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.lines.recv_timeout(left) {
                Ok(line) => {
                    let done = line.contains(needle);
                    seen.push(line);
                    if done {
                        return seen;
                    }
                }
                Err(_) => break,
            }
        }
        if let Some(status) = self.child.try_wait().expect("poll agent-gatewayd") {
            panic!("agent-gatewayd exited with {status} before `{needle}`: {seen:#?}");
        }
        panic!("agent-gatewayd never logged `{needle}`: {seen:#?}");
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn override_starts_and_warns() {
    let mut running = Running::spawn(
        daemon()
            .env("GATEWAY_NETWORK_ISOLATION", "false")
            .env("GATEWAY_ALLOW_UNISOLATED", "true"),
    );
    let logs = running.wait_for("execution rpc listening");

    let warning = logs
        .iter()
        .find(|line| line.contains("WITHOUT network isolation"))
        .unwrap_or_else(|| panic!("no isolation warning in {logs:#?}"));
    assert!(warning.contains("WARN"), "{warning}");
    assert!(running.child.try_wait().unwrap().is_none());
}

#[test]
fn verified_sentinel_starts_without_warning() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = dir.path().join("network-isolation.ready");
    std::fs::write(&sentinel, b"ok").unwrap();

    let mut running = Running::spawn(
        daemon()
            .env("GATEWAY_NETWORK_ISOLATION", "true")
            .env("GATEWAY_SANDBOX_SENTINEL", &sentinel),
    );
    let logs = running.wait_for("execution rpc listening");
    assert!(logs.iter().any(|line| line.contains("network isolation verified")));
    assert!(!logs.iter().any(|line| line.contains("WITHOUT network isolation")));
}
