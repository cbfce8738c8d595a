//! Scanner adapter.
//!
//! Runs exactly one host scan per invocation: build the argv, spawn the
//! scanner binary, capture its output and keep it on a leash. The leash is
//! two layered timers. The scanner gets `--host-timeout` as its own budget,
//! and the adapter waits with an outer deadline of that budget plus a grace
//! period, so a scanner that ignores its own timeout still cannot wedge a
//! worker. On deadline or external abort the child gets SIGTERM, a short
//! grace to exit, then SIGKILL.
//!
//! The scanner is swappable behind the [`HostScanner`] trait as long as it
//! honors the contract: XML on stdout, diagnostics on stderr, exit code 0
//! on success. Tests plug in mocks; production uses [`NmapScanner`].

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

pub mod parser;

/// Slack on top of the scanner's own host timeout before the adapter
/// intervenes.
pub const OUTER_DEADLINE_GRACE: Duration = Duration::from_secs(15);

/// How long a child may linger after SIGTERM before SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(3);

/// Result of one host scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Exit code zero and non-empty stdout.
    pub ok: bool,
    pub duration_ms: u64,
    /// Raw scanner XML, persisted verbatim.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ScanOutcome {
    fn failed(duration_ms: u64, stderr: Vec<u8>) -> Self {
        Self {
            ok: false,
            duration_ms,
            stdout: Vec::new(),
            stderr,
        }
    }
}

/// Builds the scanner argv for a single host scan.
///
/// Token order is part of the contract: discovery and DNS off, scan mode,
/// host timeout, XML to stdout, timing preset, ports, extra args, target.
pub fn build_argv(address: &str, settings: &Settings) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "-Pn".to_string(),
        "-n".to_string(),
        format!("-{}", settings.scan_type),
        "--host-timeout".to_string(),
        format!("{}s", settings.host_timeout_sec),
        "-oX".to_string(),
        "-".to_string(),
    ];
    argv.extend(
        settings
            .profile
            .timing_args()
            .iter()
            .map(|t| t.to_string()),
    );
    match settings.ports.strip_prefix("top-") {
        Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            argv.push("--top-ports".to_string());
            argv.push(n.to_string());
        }
        _ => {
            if !settings.ports.is_empty() {
                argv.push("-p".to_string());
                argv.push(settings.ports.clone());
            }
        }
    }
    if !settings.extra_args.trim().is_empty() {
        argv.extend(shlex::split(&settings.extra_args).unwrap_or_default());
    }
    argv.push(address.to_string());
    argv
}

/// One host scan. Implementations must return promptly once `cancel`
/// fires and must never panic on scanner misbehavior.
#[async_trait]
pub trait HostScanner: Send + Sync + 'static {
    async fn scan(
        &self,
        address: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> ScanOutcome;

    /// Label for health reporting.
    fn describe(&self) -> String {
        "scanner".to_string()
    }
}

/// Adapter around the real scanner binary.
#[derive(Debug, Clone)]
pub struct NmapScanner {
    program: String,
}

impl NmapScanner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program plus argv that [`HostScanner::scan`] would execute.
    pub fn command_preview(&self, address: &str, settings: &Settings) -> Vec<String> {
        let mut preview = vec![self.program.clone()];
        preview.extend(build_argv(address, settings));
        preview
    }
}

#[async_trait]
impl HostScanner for NmapScanner {
    async fn scan(
        &self,
        address: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let started = Instant::now();
        let argv = build_argv(address, settings);

        let spawned = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return ScanOutcome::failed(
                    started.elapsed().as_millis() as u64,
                    format!("spawn failed: {err}").into_bytes(),
                );
            }
        };

        let (Some(mut stdout_pipe), Some(mut stderr_pipe)) =
            (child.stdout.take(), child.stderr.take())
        else {
            return ScanOutcome::failed(
                started.elapsed().as_millis() as u64,
                b"scanner pipes unavailable".to_vec(),
            );
        };

        // Drain both pipes while waiting, otherwise a chatty scanner can
        // fill the pipe buffer and deadlock against its own exit.
        let io_task = tokio::spawn(async move {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let _ = tokio::join!(
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
            );
            (stdout, stderr)
        });

        let outer = Duration::from_secs(settings.host_timeout_sec) + OUTER_DEADLINE_GRACE;
        enum End {
            Exited(std::io::Result<std::process::ExitStatus>),
            Deadline,
            Aborted,
        }
        let end = tokio::select! {
            waited = timeout(outer, child.wait()) => match waited {
                Ok(result) => End::Exited(result),
                Err(_) => End::Deadline,
            },
            _ = cancel.cancelled() => End::Aborted,
        };

        match end {
            End::Exited(Ok(status)) => {
                let (stdout, stderr) = io_task.await.unwrap_or_default();
                ScanOutcome {
                    ok: status.success() && !stdout.is_empty(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    stdout,
                    stderr,
                }
            }
            End::Exited(Err(err)) => {
                let _ = io_task.await;
                ScanOutcome::failed(
                    started.elapsed().as_millis() as u64,
                    format!("wait failed: {err}").into_bytes(),
                )
            }
            End::Deadline => {
                tracing::warn!(address, "scanner ignored its host timeout, escalating");
                escalate(&mut child).await;
                // The output is discarded on this path; do not wait for
                // pipe EOF, which an orphaned grandchild could hold open.
                io_task.abort();
                ScanOutcome::failed(started.elapsed().as_millis() as u64, b"timeout".to_vec())
            }
            End::Aborted => {
                escalate(&mut child).await;
                io_task.abort();
                ScanOutcome::failed(started.elapsed().as_millis() as u64, b"aborted".to_vec())
            }
        }
    }

    fn describe(&self) -> String {
        self.program.clone()
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn escalate(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already exited; reap it.
        let _ = child.wait().await;
        return;
    };
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    if timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ScanProfile, SettingsPatch};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn argv_matches_the_contract_for_defaults() {
        let argv = build_argv("10.0.0.1", &Settings::default());
        assert_eq!(
            argv,
            vec![
                "-Pn",
                "-n",
                "-sT",
                "--host-timeout",
                "60s",
                "-oX",
                "-",
                "-T4",
                "--max-retries",
                "1",
                "--top-ports",
                "1000",
                "10.0.0.1",
            ]
        );
    }

    #[test]
    fn argv_for_thorough_profile_with_port_list_and_extra_args() {
        let mut settings = Settings::default();
        settings
            .apply(SettingsPatch {
                profile: Some(ScanProfile::Thorough),
                scan_type: Some("sS".to_string()),
                host_timeout_sec: Some(120),
                ports: Some("1-1024,3389".to_string()),
                extra_args: Some("--script \"default safe\"".to_string()),
                ..SettingsPatch::default()
            })
            .unwrap();
        let argv = build_argv("2001:db8::1", &settings);
        assert_eq!(
            argv,
            vec![
                "-Pn",
                "-n",
                "-sS",
                "--host-timeout",
                "120s",
                "-oX",
                "-",
                "-T3",
                "--max-retries",
                "2",
                "-p",
                "1-1024,3389",
                "--script",
                "default safe",
                "2001:db8::1",
            ]
        );
    }

    #[test]
    fn non_numeric_top_ports_falls_back_to_a_literal() {
        let mut settings = Settings::default();
        settings.ports = "top-abc".to_string();
        let argv = build_argv("10.0.0.1", &settings);
        let idx = argv.iter().position(|t| t == "-p").unwrap();
        assert_eq!(argv[idx + 1], "top-abc");
        assert!(!argv.contains(&"--top-ports".to_string()));

        settings.ports = String::new();
        let argv = build_argv("10.0.0.1", &settings);
        assert!(!argv.contains(&"-p".to_string()));
    }

    #[test]
    fn command_preview_leads_with_the_program() {
        let scanner = NmapScanner::new("/usr/bin/nmap");
        let preview = scanner.command_preview("10.0.0.1", &Settings::default());
        assert_eq!(preview[0], "/usr/bin/nmap");
        assert_eq!(preview[1], "-Pn");
        assert_eq!(preview.last().unwrap(), "10.0.0.1");
        assert_eq!(scanner.describe(), "/usr/bin/nmap");
    }

    fn script_scanner(dir: &Path, body: &str) -> NmapScanner {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-scanner.sh");
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        NmapScanner::new(path.to_string_lossy())
    }

    #[tokio::test]
    async fn successful_scan_captures_stdout_verbatim() {
        let dir = tempdir().unwrap();
        let scanner = script_scanner(
            dir.path(),
            "#!/bin/sh\nprintf '<nmaprun><host/></nmaprun>'\n",
        );
        let outcome = scanner
            .scan("10.0.0.1", &Settings::default(), &CancellationToken::new())
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.stdout, b"<nmaprun><host/></nmaprun>");
    }

    #[tokio::test]
    async fn nonzero_exit_or_empty_stdout_is_not_ok() {
        let dir = tempdir().unwrap();

        let scanner = script_scanner(dir.path(), "#!/bin/sh\nprintf '<nmaprun/>'\nexit 3\n");
        let outcome = scanner
            .scan("10.0.0.1", &Settings::default(), &CancellationToken::new())
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.stdout, b"<nmaprun/>");

        let scanner = script_scanner(dir.path(), "#!/bin/sh\nexit 0\n");
        let outcome = scanner
            .scan("10.0.0.1", &Settings::default(), &CancellationToken::new())
            .await;
        assert!(!outcome.ok);
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_panicked() {
        let scanner = NmapScanner::new("/definitely/not/a/real/scanner");
        let outcome = scanner
            .scan("10.0.0.1", &Settings::default(), &CancellationToken::new())
            .await;
        assert!(!outcome.ok);
        assert!(String::from_utf8_lossy(&outcome.stderr).contains("spawn failed"));
    }

    #[tokio::test]
    async fn abort_terminates_a_cooperative_child_promptly() {
        let dir = tempdir().unwrap();
        let scanner = script_scanner(dir.path(), "#!/bin/sh\nsleep 30\n");
        let cancel = CancellationToken::new();

        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            aborter.cancel();
        });

        let started = Instant::now();
        let outcome = scanner.scan("10.0.0.1", &Settings::default(), &cancel).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.stderr, b"aborted");
        // SIGTERM alone should have been enough.
        assert!(started.elapsed() < TERM_GRACE);
    }

    #[tokio::test]
    async fn sigkill_escalation_when_sigterm_is_ignored() {
        let dir = tempdir().unwrap();
        let scanner = script_scanner(
            dir.path(),
            "#!/bin/sh\ntrap '' TERM\nsleep 30 >/dev/null 2>&1\n",
        );
        let cancel = CancellationToken::new();

        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            aborter.cancel();
        });

        let started = Instant::now();
        let outcome = scanner.scan("10.0.0.1", &Settings::default(), &cancel).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.stderr, b"aborted");
        let elapsed = started.elapsed();
        assert!(elapsed >= TERM_GRACE, "SIGKILL must wait out the grace");
        assert!(elapsed < Duration::from_secs(10));
    }
}
