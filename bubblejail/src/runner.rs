//! Sandbox startup, supervision, and teardown.
//!
//! The [`Runner`] owns every per-run resource: the runtime directory, the
//! helper control socket, staged file descriptors, and the bwrap,
//! xdg-dbus-proxy, and network-helper child processes. Startup is a
//! strictly sequenced state machine; any failure tears everything down
//! before the error is reported. There is deliberately no partial-start
//! state.

use std::io::{Seek, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use bubblejail_proto::{Frame, PROTOCOL_VERSION};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use tokio::io::{AsyncReadExt, BufStream};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::compose::{self, BwrapConfig, RunPaths};
use crate::dbus::{DbusLogMode, DbusLogParser, DbusProxy};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::namespaces;
use crate::paths;
use crate::services::{HostEnv, PastaOptions, ServiceContext, Slirp4netnsOptions, StartupHook};

/// Startup phases, strictly forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Building and validating the BwrapConfig.
    Composing,
    /// Waiting for xdg-dbus-proxy readiness.
    DbusProxyStarting,
    /// Helper control socket bound and listening.
    HelperSocketListening,
    /// bwrap spawned, waiting for its info JSON.
    BwrapLaunched,
    /// Waiting for the helper HELLO.
    HelperHandshake,
    /// Running per-service startup hooks.
    PostInitHooks,
    /// Sandboxed program is running.
    Running,
    /// Teardown in progress.
    Terminating,
    /// All resources released.
    Terminated,
}

/// Timeout for the helper HELLO exchange.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for bwrap's info JSON.
const INFO_TIMEOUT: Duration = Duration::from_secs(3);
/// Grace period for bwrap to exit after the helper SHUTDOWN.
const BWRAP_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for slirp4netns / pasta network setup.
const NETWORK_TIMEOUT: Duration = Duration::from_secs(3);

/// Options for one `run` invocation.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Command argv; empty means the instance's `executable_name`.
    pub argv: Vec<String>,
    /// Print the expanded bwrap argv instead of launching.
    pub dry_run: bool,
    /// Start `/bin/sh` attached to the terminal.
    pub debug_shell: bool,
    /// xdg-dbus-proxy logging mode.
    pub log_dbus: DbusLogMode,
    /// Extra raw bwrap arguments from the command line.
    pub extra_bwrap_args: Vec<String>,
    /// Summarize blocked D-Bus names after the run.
    pub wizard: bool,
}

/// Removes the per-run runtime directory on every exit path.
#[derive(Debug)]
struct RuntimeDirGuard {
    path: PathBuf,
}

impl Drop for RuntimeDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Orchestrates one sandbox lifetime.
pub struct Runner {
    instance: Instance,
    run_paths: RunPaths,
    config: BwrapConfig,
    options: RunOptions,
    phase: Phase,

    runtime_dir_guard: Option<RuntimeDirGuard>,
    dbus_proxy: Option<DbusProxy>,
    log_parser: Option<DbusLogParser>,
    bwrap: Option<tokio::process::Child>,
    network_helper: Option<tokio::process::Child>,
    sandbox_pid: Option<i32>,
    helper_conn: Option<BufStream<UnixStream>>,
}

impl Runner {
    /// Composes the configuration for `instance`. Phase: `Composing`.
    pub fn prepare(instance: Instance, options: RunOptions) -> Result<Self> {
        // Snapshot the config under the instance lock so a concurrent
        // `edit` can never hand us a half-written file.
        let services = {
            let _lock = instance.lock()?;
            instance.load_config()?.instantiate()?
        };
        let run_paths = instance.run_paths()?;
        let ctx = ServiceContext {
            env: HostEnv::capture()?,
            home_bind_src: instance.home_dir(),
            debug_shell: options.debug_shell,
        };
        let config = compose::compose(&services, &ctx, &run_paths)?;

        Ok(Self {
            instance,
            run_paths,
            config,
            options,
            phase: Phase::Composing,
            runtime_dir_guard: None,
            dbus_proxy: None,
            log_parser: None,
            bwrap: None,
            network_helper: None,
            sandbox_pid: None,
            helper_conn: None,
        })
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(self.phase <= next, "phase must move forward");
        debug!(from = ?self.phase, to = ?next, "runner phase");
        self.phase = next;
    }

    /// The argv the initial RUN frame will carry.
    fn initial_argv(&self) -> Result<Vec<String>> {
        let argv = if self.options.argv.is_empty() {
            self.config.launch_argv.clone()
        } else {
            self.options.argv.clone()
        };
        if argv.is_empty() {
            return Err(Error::ConfigParse(
                "no arguments given and no executable_name configured".into(),
            ));
        }
        Ok(argv)
    }

    /// Launches the sandbox and supervises it to exit.
    ///
    /// Returns the sandboxed program's exit code. All side resources are
    /// released before this returns, on success and on error alike.
    /// SIGINT / SIGTERM in any phase move straight to `Terminating`, so
    /// the runtime directory and the children never outlive the run.
    pub async fn launch(mut self) -> Result<i32> {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let result = tokio::select! {
            result = self.launch_inner() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, terminating sandbox");
                Err(Error::Cancelled)
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, terminating sandbox");
                Err(Error::Cancelled)
            }
        };
        self.terminate().await;
        result
    }

    async fn launch_inner(&mut self) -> Result<i32> {
        let initial_argv = self.initial_argv()?;

        // Startup is serialized against `edit` on the instance lock.
        let lock = self.instance.lock()?;

        // Runtime directory, mode 0700, exclusively ours.
        let runtime_dir = self.run_paths.runtime_dir.clone();
        if runtime_dir.exists() {
            // CLI re-entry already ran; an existing dir here is a stale
            // leftover from an unclean shutdown.
            warn!(dir = %runtime_dir.display(), "removing stale runtime directory");
            std::fs::remove_dir_all(&runtime_dir)?;
        }
        if let Some(parent) = runtime_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = std::fs::DirBuilder::new();
        std::os::unix::fs::DirBuilderExt::mode(&mut builder, 0o700);
        builder.create(&runtime_dir)?;
        self.runtime_dir_guard = Some(RuntimeDirGuard { path: runtime_dir });

        // D-Bus proxy, only when some service asked for the bus.
        self.advance(Phase::DbusProxyStarting);
        if self.config.has_dbus() {
            let mut proxy = DbusProxy::new(
                self.run_paths.dbus_session_socket.clone(),
                self.run_paths.dbus_system_socket.clone(),
                self.options.log_dbus,
            );
            for rule in &self.config.session_rules {
                proxy.add_session_rule(rule.clone());
            }
            for rule in &self.config.system_rules {
                proxy.add_system_rule(rule.clone());
            }
            if !self.options.dry_run {
                let mut parser = (self.options.log_dbus == DbusLogMode::Parse)
                    .then(DbusLogParser::new);
                proxy.start(parser.as_mut()).await?;
                self.log_parser = parser;
            }
            self.dbus_proxy = Some(proxy);
        }

        // Helper control socket: bound here, served by the helper.
        self.advance(Phase::HelperSocketListening);
        let listener = std::os::unix::net::UnixListener::bind(&self.run_paths.helper_socket)?;
        std::fs::set_permissions(
            &self.run_paths.helper_socket,
            std::os::unix::fs::PermissionsExt::from_mode(0o600),
        )?;
        clear_cloexec(&listener)?;

        // Stage FileWrite bytes and the seccomp program on anonymous FDs.
        let mut staged: Vec<(std::fs::File, PathBuf)> = Vec::new();
        for (dst, bytes) in &self.config.file_writes {
            staged.push((stage_bytes(bytes)?, dst.clone()));
        }
        let seccomp_file = if self.config.seccomp.is_empty() {
            None
        } else {
            Some(stage_bytes(&self.config.seccomp.compile())?)
        };

        // Info pipe: bwrap reports the sandboxed init PID over it.
        let (info_rx, info_tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        fcntl(info_tx.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;

        // Ready pipe gates the helper until startup hooks finished.
        let ready_pipe = if self.config.hooks.is_empty() {
            None
        } else {
            let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
            fcntl(rx.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
            Some((rx, tx))
        };

        // Full bwrap argv, in fixed order.
        let bwrap_bin =
            paths::which("bwrap").ok_or_else(|| Error::DependencyMissing("bwrap".into()))?;
        let mut argv = self.config.base_argv();
        argv.extend(self.options.extra_bwrap_args.iter().cloned());
        for (file, dst) in &staged {
            argv.push("--ro-bind-data".into());
            argv.push(file.as_raw_fd().to_string());
            argv.push(dst.to_string_lossy().into_owned());
        }
        if let Some(file) = &seccomp_file {
            argv.push("--seccomp".into());
            argv.push(file.as_raw_fd().to_string());
        }
        argv.push("--info-fd".into());
        argv.push(info_tx.as_raw_fd().to_string());
        argv.push("--".into());

        let helper_bin = helper_executable()?;
        argv.push(helper_bin.to_string_lossy().into_owned());
        argv.extend(helper_args(
            listener.as_raw_fd(),
            ready_pipe.as_ref().map(|(rx, _)| rx.as_raw_fd()),
            self.options.debug_shell,
            &initial_argv,
        ));

        if self.options.dry_run {
            println!("bwrap argv:");
            println!("{} {}", bwrap_bin.display(), argv.join(" "));
            if let Some(proxy) = &self.dbus_proxy {
                let session_bus =
                    std::env::var("DBUS_SESSION_BUS_ADDRESS").unwrap_or_default();
                println!("xdg-dbus-proxy argv:");
                println!("{}", proxy.proxy_args(&session_bus, -1).join(" "));
            }
            println!("run argv:");
            println!("{}", initial_argv.join(" "));
            return Ok(0);
        }

        debug!(?argv, "spawning bwrap");
        let mut bwrap = tokio::process::Command::new(&bwrap_bin)
            .args(&argv)
            .kill_on_drop(true)
            .spawn()?;
        self.advance(Phase::BwrapLaunched);

        // Parent-side copies of inherited FDs must close immediately so
        // EOFs propagate once the children are gone.
        drop(staged);
        drop(seccomp_file);
        drop(listener);
        drop(info_tx);
        let ready_tx = ready_pipe.map(|(rx, tx)| {
            drop(rx);
            tx
        });

        // Sandboxed init PID from bwrap's info JSON.
        let info = tokio::select! {
            json = read_to_end_fd(info_rx) => json?,
            status = bwrap.wait() => {
                let status = status?;
                return Err(Error::SandboxStartupFailed(format!(
                    "bwrap exited during startup: {status}"
                )));
            }
            _ = tokio::time::sleep(INFO_TIMEOUT) => {
                return Err(Error::SandboxStartupFailed(
                    "bwrap did not report the sandbox PID in time".into(),
                ));
            }
        };
        let info: serde_json::Value = serde_json::from_slice(&info)
            .map_err(|e| Error::SandboxStartupFailed(format!("bad bwrap info JSON: {e}")))?;
        let sandbox_pid = info["child-pid"]
            .as_i64()
            .ok_or_else(|| Error::SandboxStartupFailed("no child-pid in bwrap info".into()))?
            as i32;
        info!(sandbox_pid, "sandbox started");
        self.bwrap = Some(bwrap);
        self.sandbox_pid = Some(sandbox_pid);

        // Startup hooks need the live PID; failures abort startup.
        self.advance(Phase::PostInitHooks);
        let hooks = std::mem::take(&mut self.config.hooks);
        for hook in &hooks {
            match hook {
                StartupHook::NamespaceLimits(limits) => {
                    namespaces::apply_limits(sandbox_pid, limits)?;
                }
                StartupHook::Slirp4netns(opts) => {
                    self.network_helper = Some(spawn_slirp(sandbox_pid, opts).await?);
                }
                StartupHook::Pasta(opts) => {
                    spawn_pasta(sandbox_pid, opts).await?;
                }
            }
        }
        if let Some(tx) = ready_tx {
            let mut file = std::fs::File::from(tx);
            file.write_all(b"bubblejail-ready")?;
        }

        // HELLO over our own client connection.
        self.advance(Phase::HelperHandshake);
        let mut conn = BufStream::new(UnixStream::connect(&self.run_paths.helper_socket).await?);
        let handshake = async {
            bubblejail_proto::send(
                &mut conn,
                &Frame::Hello {
                    id: 0,
                    version: PROTOCOL_VERSION,
                },
            )
            .await?;
            bubblejail_proto::recv::<_, Frame>(&mut conn).await
        };
        match tokio::time::timeout(HELLO_TIMEOUT, handshake).await {
            Ok(Ok(Frame::Hello { version, .. })) => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        helper = version,
                        host = PROTOCOL_VERSION,
                        "helper protocol version differs"
                    );
                }
            }
            Ok(Ok(frame)) => {
                return Err(Error::SandboxStartupFailed(format!(
                    "expected HELLO from helper, got {frame:?}"
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::HelperHandshakeTimeout(HELLO_TIMEOUT.as_secs())),
        }

        // Initial RUN: the sandboxed program itself.
        bubblejail_proto::send(
            &mut conn,
            &Frame::Run {
                id: 1,
                argv: initial_argv,
                env: Default::default(),
                wait: true,
                attach_stdio: true,
            },
        )
        .await?;
        self.helper_conn = Some(conn);

        self.advance(Phase::Running);
        drop(lock);
        self.supervise().await
    }

    /// Waits for the first of: program exit, helper disconnect, or bwrap
    /// death. Signals are handled one level up in [`Runner::launch`].
    async fn supervise(&mut self) -> Result<i32> {
        let conn = self.helper_conn.as_mut().expect("Running implies a connection");
        let bwrap = self.bwrap.as_mut().expect("Running implies bwrap");

        loop {
            tokio::select! {
                frame = bubblejail_proto::recv::<_, Frame>(conn) => {
                    match frame {
                        Ok(Frame::Ready { id, pid }) => {
                            debug!(id, pid, "sandboxed program spawned");
                        }
                        Ok(Frame::Result { id: 1, code, .. }) => {
                            info!(code, "sandboxed program exited");
                            return Ok(code);
                        }
                        Ok(Frame::Error { msg, .. }) => {
                            return Err(Error::SandboxStartupFailed(format!(
                                "helper error: {msg}"
                            )));
                        }
                        Ok(frame) => debug!(?frame, "unexpected frame while running"),
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            warn!("helper disconnected");
                            return Ok(0);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                status = bwrap.wait() => {
                    let status = status?;
                    info!(%status, "bwrap exited");
                    return match status.code() {
                        Some(0) => Ok(0),
                        Some(code) => Err(Error::SandboxExit(code)),
                        // Killed by a signal: there is no exit code to
                        // pass through, but it was not a clean exit.
                        None => Err(Error::SandboxStartupFailed(format!(
                            "bwrap terminated abnormally: {status}"
                        ))),
                    };
                }
            }
        }
    }

    /// Releases every resource. Idempotent: a second call is a no-op.
    pub async fn terminate(&mut self) {
        if self.phase >= Phase::Terminated {
            return;
        }
        self.advance(Phase::Terminating);

        // Ask the helper to shut its children down; without a control
        // connection fall back to signaling the sandboxed init directly.
        match self.helper_conn.take() {
            Some(mut conn) => {
                let shutdown =
                    bubblejail_proto::send(&mut conn, &Frame::Shutdown { id: u64::MAX });
                let _ = tokio::time::timeout(Duration::from_secs(1), shutdown).await;
            }
            None => {
                if let Some(pid) = self.sandbox_pid.take() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::SIGTERM,
                    );
                }
            }
        }

        // Wait for bwrap, then escalate.
        if let Some(mut bwrap) = self.bwrap.take() {
            if tokio::time::timeout(BWRAP_STOP_TIMEOUT, bwrap.wait())
                .await
                .is_err()
            {
                if let Some(pid) = bwrap.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::SIGTERM,
                    );
                }
                if tokio::time::timeout(BWRAP_STOP_TIMEOUT, bwrap.wait())
                    .await
                    .is_err()
                {
                    let _ = bwrap.start_kill();
                    let _ = bwrap.wait().await;
                }
            }
        }

        // Network helper: SIGTERM, short grace, SIGKILL.
        if let Some(mut helper) = self.network_helper.take() {
            if let Some(pid) = helper.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::SIGTERM,
                );
            }
            if tokio::time::timeout(NETWORK_TIMEOUT, helper.wait())
                .await
                .is_err()
            {
                let _ = helper.start_kill();
                let _ = helper.wait().await;
            }
        }

        if let Some(mut proxy) = self.dbus_proxy.take() {
            proxy.shutdown().await;
        }

        if self.options.wizard {
            if let Some(parser) = &self.log_parser {
                print_wizard_summary(&parser.summary());
            }
        }

        // Unlink the runtime directory last; the guard also fires on
        // panic paths.
        self.runtime_dir_guard.take();
        self.advance(Phase::Terminated);
    }
}

/// Sends a RUN into an already-running instance.
///
/// Returns the RESULT when `wait` is set, `None` otherwise.
pub async fn send_run(
    instance: &Instance,
    argv: Vec<String>,
    wait: bool,
) -> Result<Option<(i32, String, String)>> {
    let run_paths = instance.run_paths()?;
    let mut conn = BufStream::new(UnixStream::connect(&run_paths.helper_socket).await?);

    bubblejail_proto::send(
        &mut conn,
        &Frame::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
        },
    )
    .await?;
    match tokio::time::timeout(HELLO_TIMEOUT, bubblejail_proto::recv::<_, Frame>(&mut conn)).await
    {
        Ok(Ok(Frame::Hello { .. })) => {}
        Ok(Ok(frame)) => {
            return Err(Error::SandboxStartupFailed(format!(
                "expected HELLO from helper, got {frame:?}"
            )));
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::HelperHandshakeTimeout(HELLO_TIMEOUT.as_secs())),
    }

    bubblejail_proto::send(
        &mut conn,
        &Frame::Run {
            id: 1,
            argv,
            env: Default::default(),
            wait,
            attach_stdio: false,
        },
    )
    .await?;

    loop {
        let frame = tokio::select! {
            frame = bubblejail_proto::recv::<_, Frame>(&mut conn) => frame?,
            _ = tokio::signal::ctrl_c() => return Err(Error::Cancelled),
        };
        match frame {
            Frame::Ready { .. } if !wait => return Ok(None),
            Frame::Ready { .. } => {}
            Frame::Result {
                id: 1,
                code,
                stdout,
                stderr,
            } => return Ok(Some((code, stdout, stderr))),
            Frame::Error { msg, .. } => {
                return Err(Error::SandboxStartupFailed(format!("helper error: {msg}")));
            }
            other => debug!(?other, "unexpected frame"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helper process plumbing
// ---------------------------------------------------------------------------

/// Locates the in-sandbox helper binary.
///
/// Search order: `BUBBLEJAIL_HELPER`, sibling of the current executable,
/// `$PATH`.
fn helper_executable() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("BUBBLEJAIL_HELPER") {
        return Ok(PathBuf::from(path));
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("bubblejail-helper");
        if sibling.is_file() {
            return Ok(sibling);
        }
    }
    paths::which("bubblejail-helper")
        .ok_or_else(|| Error::DependencyMissing("bubblejail-helper".into()))
}

/// Helper command line after the bwrap `--`.
fn helper_args(
    socket_fd: i32,
    ready_fd: Option<i32>,
    debug_shell: bool,
    argv: &[String],
) -> Vec<String> {
    let mut args = vec!["--helper-socket".to_owned(), socket_fd.to_string()];
    if let Some(fd) = ready_fd {
        args.push("--ready-fd".into());
        args.push(fd.to_string());
    }
    if debug_shell {
        args.push("--shell".into());
    }
    args.push("--".into());
    args.extend(argv.iter().cloned());
    args
}

/// Copies bytes to an anonymous file and clears its CLOEXEC flag so
/// bwrap inherits it.
fn stage_bytes(bytes: &[u8]) -> Result<std::fs::File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(bytes)?;
    file.rewind()?;
    clear_cloexec(&file)?;
    Ok(file)
}

fn clear_cloexec(fd: &impl AsFd) -> Result<()> {
    fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Drains an FD to EOF asynchronously.
async fn read_to_end_fd(fd: OwnedFd) -> Result<Vec<u8>> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    let mut pipe = tokio::net::unix::pipe::Receiver::from_owned_fd(fd)?;
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Spawns slirp4netns attached to the sandbox and waits for its ready
/// signal.
async fn spawn_slirp(
    sandbox_pid: i32,
    opts: &Slirp4netnsOptions,
) -> Result<tokio::process::Child> {
    let slirp_bin =
        paths::which("slirp4netns").ok_or_else(|| Error::DependencyMissing("slirp4netns".into()))?;

    // slirp must join the user namespace owning the sandbox netns.
    let userns = namespaces::userns_of_netns(sandbox_pid)?;
    let userns_path = format!("/proc/{}/fd/{}", std::process::id(), userns.as_raw_fd());

    let (ready_rx, ready_tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    fcntl(ready_tx.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;

    let mut args = vec![
        format!("--ready={}", ready_tx.as_raw_fd()),
        "--configure".to_owned(),
        format!("--userns-path={userns_path}"),
    ];
    if !opts.outbound_addr.is_empty() {
        args.push(format!("--outbound-addr={}", opts.outbound_addr));
    }
    if opts.disable_host_loopback {
        args.push("--disable-host-loopback".into());
    }
    args.push(sandbox_pid.to_string());
    args.push("tap0".into());

    debug!(?args, "spawning slirp4netns");
    let mut child = tokio::process::Command::new(slirp_bin)
        .args(&args)
        .kill_on_drop(true)
        .spawn()?;
    drop(ready_tx);

    let mut ready_pipe = tokio::net::unix::pipe::Receiver::from_owned_fd(ready_rx)?;
    let mut buf = [0u8; 16];
    tokio::select! {
        read = ready_pipe.read(&mut buf) => {
            if read? == 0 {
                let _ = child.start_kill();
                return Err(Error::NetworkStackFailed(
                    "slirp4netns closed its ready pipe without configuring".into(),
                ));
            }
        }
        status = child.wait() => {
            return Err(Error::NetworkStackFailed(format!(
                "slirp4netns exited during setup: {}", status?
            )));
        }
        _ = tokio::time::sleep(NETWORK_TIMEOUT) => {
            let _ = child.start_kill();
            return Err(Error::NetworkStackFailed(
                "slirp4netns initialization timed out".into(),
            ));
        }
    }

    drop(userns);
    Ok(child)
}

/// Spawns pasta attached to the sandbox network namespace.
///
/// pasta forks into the background once the network is configured, so a
/// clean exit of the foreground process is the ready signal.
async fn spawn_pasta(sandbox_pid: i32, opts: &PastaOptions) -> Result<()> {
    let pasta_bin =
        paths::which("pasta").ok_or_else(|| Error::DependencyMissing("pasta".into()))?;

    let mut args = vec!["--config-net".to_owned()];
    args.extend(opts.extra_args.iter().cloned());
    args.push(sandbox_pid.to_string());

    debug!(?args, "spawning pasta");
    let mut child = tokio::process::Command::new(pasta_bin).args(&args).spawn()?;

    let waited = tokio::time::timeout(NETWORK_TIMEOUT, child.wait()).await;
    let status = match waited {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.start_kill();
            return Err(Error::NetworkStackFailed("pasta setup timed out".into()));
        }
    };
    if !status.success() {
        return Err(Error::NetworkStackFailed(format!(
            "pasta exited during setup: {status}"
        )));
    }
    Ok(())
}

fn print_wizard_summary(summary: &crate::dbus::DbusLogSummary) {
    if summary.wants_own.is_empty() && summary.wants_talk.is_empty() {
        eprintln!("bubblejail: wizard: no blocked D-Bus names observed");
        return;
    }
    if !summary.wants_own.is_empty() {
        eprintln!("bubblejail: wizard: application tried to own these names;");
        eprintln!("bubblejail: wizard: consider adding them to [common] dbus_name:");
        for name in &summary.wants_own {
            eprintln!("bubblejail: wizard:   {name}");
        }
    }
    if !summary.wants_talk.is_empty() {
        eprintln!("bubblejail: wizard: application tried to talk to:");
        for name in &summary.wants_talk {
            eprintln!("bubblejail: wizard:   {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn phases_are_strictly_ordered() {
        let order = [
            Phase::Composing,
            Phase::DbusProxyStarting,
            Phase::HelperSocketListening,
            Phase::BwrapLaunched,
            Phase::HelperHandshake,
            Phase::PostInitHooks,
            Phase::Running,
            Phase::Terminating,
            Phase::Terminated,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn helper_args_layout() {
        let args = helper_args(5, Some(7), false, &["/bin/true".to_owned()]);
        assert_eq!(
            args,
            vec!["--helper-socket", "5", "--ready-fd", "7", "--", "/bin/true"]
        );

        let args = helper_args(5, None, true, &[]);
        assert_eq!(args, vec!["--helper-socket", "5", "--shell", "--"]);
    }

    #[test]
    fn runtime_dir_guard_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        std::fs::create_dir_all(path.join("nested")).unwrap();
        drop(RuntimeDirGuard { path: path.clone() });
        assert!(!path.exists());
    }

    #[test]
    fn staged_bytes_are_inheritable_and_rewound() {
        let mut file = stage_bytes(b"nameserver 10.0.2.3\n").unwrap();
        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert_eq!(flags & FdFlag::FD_CLOEXEC.bits(), 0);
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "nameserver 10.0.2.3\n");
    }
}
