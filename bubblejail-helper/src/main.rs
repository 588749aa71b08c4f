//! bubblejail helper — runs inside the sandbox as PID 1.
//!
//! Serves the framed JSON control protocol on a pre-bound UNIX socket
//! inherited from the runner, executes the sandboxed program and any
//! follow-up RUN commands, reaps orphans, and tears the sandbox down on
//! SHUTDOWN. Single-threaded cooperative scheduling throughout.

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("bubblejail-helper only runs inside a Linux sandbox");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> std::io::Result<()> {
    agent::main()
}

#[cfg(target_os = "linux")]
mod reaper;

#[cfg(target_os = "linux")]
mod agent {
    use std::io::Read;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::os::unix::net::UnixListener as StdUnixListener;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bubblejail_proto::{
        Frame, ERR_BAD_FRAME, ERR_SPAWN_FAILED, ERR_UNKNOWN_TYPE, PROTOCOL_VERSION,
    };
    use clap::Parser;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;
    use tracing::{debug, info, warn};

    use crate::reaper;

    /// Grace period between SIGTERM and SIGKILL at shutdown.
    const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

    #[derive(Debug, Parser)]
    #[command(name = "bubblejail-helper", disable_help_flag = true)]
    struct Args {
        /// Inherited FD of the bound control socket.
        #[arg(long)]
        helper_socket: i32,

        /// Inherited FD gating startup on the runner's hook completion.
        #[arg(long)]
        ready_fd: Option<i32>,

        /// Debug shell mode: default command is /bin/sh.
        #[arg(long)]
        shell: bool,

        /// Default argv for RUN frames that carry none.
        #[arg(last = true)]
        args_to_run: Vec<String>,
    }

    pub fn main() -> std::io::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("BUBBLEJAIL_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();

        // Block until the runner finished its startup hooks; nothing may
        // execute in the sandbox before namespace limits and the network
        // stack are in place.
        if let Some(fd) = args.ready_fd {
            let mut pipe = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) });
            let mut content = String::new();
            pipe.read_to_string(&mut content)?;
            if content != "bubblejail-ready" {
                eprintln!("bubblejail-helper: runner never signaled readiness");
                std::process::exit(1);
            }
        }

        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(run(args))
    }

    async fn run(args: Args) -> std::io::Result<()> {
        let std_listener = unsafe { StdUnixListener::from_raw_fd(args.helper_socket) };
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tokio::spawn(reaper::task());

        let default_argv = if args.shell {
            vec!["/bin/sh".to_owned()]
        } else {
            args.args_to_run.clone()
        };
        let default_argv = Arc::new(default_argv);
        let primary_taken = Arc::new(AtomicBool::new(false));

        info!("helper listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let default_argv = Arc::clone(&default_argv);
            let primary_taken = Arc::clone(&primary_taken);
            tokio::spawn(async move {
                if let Err(e) = session(stream, default_argv, primary_taken).await {
                    warn!("session error: {e}");
                }
            });
        }
    }

    /// Handles one control connection: HELLO exchange, then frames until
    /// EOF. EOF is a clean disconnect, never an error.
    async fn session(
        stream: tokio::net::UnixStream,
        default_argv: Arc<Vec<String>>,
        primary_taken: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut r = tokio::io::BufReader::new(read_half);

        // Responses from concurrent RUN waiters are serialized through
        // one writer task so frames never interleave.
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            let mut w = tokio::io::BufWriter::new(write_half);
            while let Some(frame) = rx.recv().await {
                if bubblejail_proto::send(&mut w, &frame).await.is_err() {
                    break;
                }
            }
        });

        // The first frame must be HELLO.
        match bubblejail_proto::recv::<_, Frame>(&mut r).await {
            Ok(Frame::Hello { id, version }) => {
                if version != PROTOCOL_VERSION {
                    warn!(peer = version, own = PROTOCOL_VERSION, "protocol version differs");
                }
                let _ = tx.send(Frame::Hello {
                    id,
                    version: PROTOCOL_VERSION,
                });
            }
            Ok(frame) => {
                let _ = tx.send(Frame::Error {
                    id: frame.id(),
                    code: ERR_BAD_FRAME,
                    msg: "expected HELLO as the first frame".into(),
                });
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        loop {
            let value = match bubblejail_proto::recv_value(&mut r).await {
                Ok(value) => value,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let id = value.get("id").and_then(|v| v.as_u64()).unwrap_or(0);

            let frame: Frame = match serde_json::from_value(value) {
                Ok(frame) => frame,
                Err(e) => {
                    // Unknown frame types are answered, not fatal.
                    let _ = tx.send(Frame::Error {
                        id,
                        code: ERR_UNKNOWN_TYPE,
                        msg: e.to_string(),
                    });
                    continue;
                }
            };

            match frame {
                Frame::Ping { id } => {
                    let _ = tx.send(Frame::Pong { id });
                }
                Frame::Run {
                    id,
                    argv,
                    env,
                    wait,
                    attach_stdio,
                } => {
                    let argv = if argv.is_empty() {
                        default_argv.as_ref().clone()
                    } else {
                        argv
                    };
                    let is_primary = !primary_taken.swap(true, Ordering::SeqCst);
                    handle_run(id, argv, env, wait, attach_stdio, is_primary, tx.clone());
                }
                Frame::Shutdown { .. } => {
                    info!("SHUTDOWN received");
                    graceful_shutdown();
                }
                other => {
                    let _ = tx.send(Frame::Error {
                        id: other.id(),
                        code: ERR_UNKNOWN_TYPE,
                        msg: "frame not valid in this direction".into(),
                    });
                }
            }
        }

        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    /// Spawns one RUN command and arranges its READY/RESULT frames.
    ///
    /// The first RUN ever received is the sandboxed program itself; when
    /// it exits the helper shuts the whole sandbox down.
    fn handle_run(
        id: u64,
        argv: Vec<String>,
        env: std::collections::BTreeMap<String, String>,
        wait: bool,
        attach_stdio: bool,
        is_primary: bool,
        tx: mpsc::UnboundedSender<Frame>,
    ) {
        if argv.is_empty() {
            let _ = tx.send(Frame::Error {
                id,
                code: ERR_SPAWN_FAILED,
                msg: "empty argv and no default command".into(),
            });
            return;
        }

        // Children are std processes: the reaper owns every wait status,
        // so PID 1 zombie collection cannot race a runtime-side waiter.
        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (key, value) in &env {
            cmd.env(key, value);
        }
        if attach_stdio {
            // Inherit the helper's stdio (the user's terminal).
        } else if wait {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tx.send(Frame::Error {
                    id,
                    code: ERR_SPAWN_FAILED,
                    msg: format!("{}: {e}", argv[0]),
                });
                return;
            }
        };

        let pid = child.id() as i32;
        let exit = reaper::subscribe(pid);
        debug!(id, pid, ?argv, "spawned");
        let _ = tx.send(Frame::Ready { id, pid });

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        // The std Child handle is no longer needed; the reaper reports
        // the exit status.
        drop(child);

        tokio::spawn(async move {
            let (stdout, stderr) = tokio::join!(
                drain_capture(stdout_pipe.map(OwnedFd::from)),
                drain_capture(stderr_pipe.map(OwnedFd::from)),
            );
            let code = exit.await.unwrap_or(-1);
            debug!(id, pid, code, "child exited");

            if wait {
                let _ = tx.send(Frame::Result {
                    id,
                    code,
                    stdout,
                    stderr,
                });
            }

            if is_primary {
                // Give the writer task a beat to flush the RESULT.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                info!("sandboxed program exited, shutting down");
                graceful_shutdown();
            }
        });
    }

    /// Reads a captured stream to EOF, lossily decoded.
    async fn drain_capture(pipe: Option<OwnedFd>) -> String {
        let Some(fd) = pipe else {
            return String::new();
        };
        let Ok(mut receiver) = tokio::net::unix::pipe::Receiver::from_owned_fd(fd) else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = receiver.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// SIGTERM everything, wait out the grace period, SIGKILL, exit.
    ///
    /// As PID 1 of the namespace, `kill(-1)` reaches every process but
    /// the helper itself.
    fn graceful_shutdown() -> ! {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let everyone = Pid::from_raw(-1);
        let _ = kill(everyone, Signal::SIGTERM);

        let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
        while std::time::Instant::now() < deadline {
            reaper::drain();
            // ESRCH means no process is left to signal.
            if kill(everyone, None).is_err() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        let _ = kill(everyone, Signal::SIGKILL);
        reaper::drain();
        std::process::exit(0);
    }
}
