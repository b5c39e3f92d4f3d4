//! The server loop.
//!
//! Startup order matters: runtime dir, lock, listening socket, signal
//! handlers, the internal tavernkeep client, then the barmaid spawn and
//! its init over the internal client. Steady state is an accept loop plus
//! per-client tasks, all on one thread; teardown unlinks the lock and the
//! socket.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use hyprtavern_core::WireConnection;

use crate::bridge;
use crate::dispatch::serve_client;
use crate::lock::LockFile;
use crate::security::mint_sentinel;
use crate::state::{lock, shared, SharedState};

/// Listening socket name under the runtime directory.
pub const SOCKET_FILE_NAME: &str = "ht.sock";
/// The tavern's directory under `$XDG_RUNTIME_DIR`.
pub const RUNTIME_DIR_NAME: &str = "hyprtavern";

/// How long the barmaid gets before its first liveness check.
const BARMAID_GRACE: Duration = Duration::from_millis(100);

/// The assembled server, ready to run.
pub struct ServerHandler {
    lock: LockFile,
    socket_path: PathBuf,
    listener: UnixListener,
    state: SharedState,
    /// Client half of the tavernkeep's internal socket pair; consumed by
    /// barmaid init.
    tavernkeep: Option<WireConnection>,
    barmaid: Child,
}

impl ServerHandler {
    /// Perform the whole startup sequence.
    ///
    /// # Errors
    ///
    /// Any startup-fatal condition: missing runtime dir, live lock,
    /// socket bind failure, barmaid spawn failure.
    pub fn new(verbose: bool) -> Result<Self> {
        let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") else {
            bail!("XDG_RUNTIME_DIR needs to be set");
        };
        let dir = PathBuf::from(runtime).join(RUNTIME_DIR_NAME);

        let lock = LockFile::acquire(&dir).context("refusing to run")?;

        let socket_path = dir.join(SOCKET_FILE_NAME);
        if socket_path.exists() {
            debug!("removing stale socket at {socket_path:?}");
            std::fs::remove_file(&socket_path).context("failed to remove stale socket")?;
        }

        let listener =
            UnixListener::bind(&socket_path).context("refusing to run: failed to open a socket")?;

        // SAFETY: installing SIG_IGN for SIGCHLD is async-signal trivial;
        // a barmaid dying mid-run is collected by the kernel instead of
        // lingering as a zombie.
        unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGCHLD,
                nix::sys::signal::SigHandler::SigIgn,
            )
        }
        .context("failed to ignore SIGCHLD")?;

        // The tavernkeep is a bus client like any other, just in-process,
        // with a sentinel token no outside client can guess.
        let sentinel = mint_sentinel();
        let state = shared(sentinel.clone());

        let (tavernkeep, internal) = WireConnection::pair()?;
        {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(internal, state, Some(sentinel)).await {
                    error!("tavernkeep client died: {e}");
                }
            });
        }

        let (barmaid, barmaid_half) = spawn_barmaid(verbose)?;
        {
            let state = state.clone();
            tokio::spawn(async move {
                let conn = match WireConnection::from_std(barmaid_half) {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to wrap barmaid socket: {e}");
                        return;
                    }
                };
                if let Err(e) = serve_client(conn, state, None).await {
                    error!("barmaid client died: {e}");
                }
            });
        }

        info!("hyprtavern listening on {socket_path:?}");

        Ok(Self {
            lock,
            socket_path,
            listener,
            state,
            tavernkeep: Some(tavernkeep),
            barmaid,
        })
    }

    /// Serve until SIGTERM/SIGINT or a fatal runtime error.
    ///
    /// # Errors
    ///
    /// Runtime-fatal conditions: the barmaid exiting early, its init
    /// failing, or the signal/socket machinery breaking.
    pub async fn run(mut self) -> Result<()> {
        tokio::time::sleep(BARMAID_GRACE).await;
        match self.barmaid.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                self.teardown();
                bail!("barmaid exited during startup with {status}");
            }
            // SIGCHLD is ignored, so a dead child may already be reaped.
            Err(e) => {
                self.teardown();
                bail!("barmaid vanished during startup: {e}");
            }
        }

        // Barmaid init: round-trips over the internal client until the kv
        // object is connectable. Failure there, or the tavernkeep
        // connection dying later, is fatal for the tavern.
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
        {
            let state = self.state.clone();
            let conn = self.tavernkeep.take().expect("tavernkeep consumed twice");
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                match bridge::init(conn, fatal.clone()).await {
                    Ok(kv) => {
                        lock(&state).bridge = Some(kv);
                        info!("barmaid init complete");
                    }
                    Err(e) => {
                        let _ = fatal.send(e.to_string());
                    }
                }
            });
        }
        drop(fatal_tx);

        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;

        let mut fatal_live = true;
        let result = loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, exiting");
                    break Ok(());
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, exiting");
                    break Ok(());
                }
                reason = fatal_rx.recv(), if fatal_live => {
                    if let Some(reason) = reason {
                        break Err(anyhow::anyhow!(reason));
                    }
                    // All fatal senders gone: init and the bridge actor
                    // completed without incident.
                    fatal_live = false;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept(stream),
                        // A hangup race on the listener is tolerable;
                        // anything persistent will hit us again next loop.
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        };

        let _ = self.barmaid.kill();
        let _ = self.barmaid.wait();
        self.teardown();
        result
    }

    fn accept(&self, stream: tokio::net::UnixStream) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let conn = match stream.into_std().map_err(Into::into).and_then(WireConnection::from_std) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("failed to set up client connection: {e}");
                    return;
                }
            };
            if let Err(e) = serve_client(conn, state, None).await {
                debug!("client connection ended: {e}");
            }
        });
    }

    fn teardown(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("failed to remove socket file: {e}");
        }
        self.lock.release();
    }
}

/// Resolve the barmaid binary: a sibling of our own executable, else
/// `$PATH`.
fn barmaid_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("hyprtavern-kv")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("hyprtavern-kv"))
}

/// Fork+exec the barmaid with its half of a fresh socket pair on `--fd`.
///
/// The parent-held half keeps close-on-exec so the barmaid inherits
/// nothing but its own descriptor.
fn spawn_barmaid(verbose: bool) -> Result<(Child, UnixStream)> {
    let (parent_half, child_half) = UnixStream::pair().context("barmaid socketpair")?;

    let child_raw = child_half.as_raw_fd();

    // SAFETY: plain fcntl on a descriptor we own; clearing FD_CLOEXEC so
    // exactly this one survives the exec below.
    unsafe {
        let flags = libc::fcntl(child_raw, libc::F_GETFD);
        if flags < 0
            || libc::fcntl(child_raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
        {
            bail!(
                "failed to clear close-on-exec on the barmaid fd: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    let exe = barmaid_executable();
    let mut cmd = Command::new(&exe);
    cmd.arg("--fd").arg(child_raw.to_string());
    if verbose {
        cmd.arg("--verbose");
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn barmaid at {exe:?}"))?;

    info!("spawned barmaid (pid {})", child.id());

    // Our copy of the child's half closes here; the barmaid holds the
    // inherited one.
    drop(child_half);

    Ok((child, parent_half))
}
