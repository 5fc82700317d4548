//! Launches the native media engine as a child process.
//!
//! The engine is started as `binary [args..] <socket>`, where `<socket>` is a
//! fresh path inside the socket directory that the engine listens on. Its
//! stdout and stderr are forwarded into the log line by line. The child is
//! killed when the handle is dropped.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub struct EngineProcess {
    child: Child,
    socket_path: PathBuf,
}

impl EngineProcess {
    pub fn spawn(binary: &Path, args: &[String], socket_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(socket_dir)?;
        let socket_path =
            socket_dir.join(format!("{:08x}.sock", rand::thread_rng().gen::<u32>()));

        let mut child = Command::new(binary)
            .args(args)
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            binary = %binary.display(),
            socket = %socket_path.display(),
            pid = ?child.id(),
            "Engine process started"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }
        Ok(Self { child, socket_path })
    }

    /// Where the engine was told to listen.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kills the engine if it is still running and removes its socket file.
    pub async fn shutdown(mut self) -> io::Result<ExitStatus> {
        let status = match self.child.try_wait()? {
            Some(status) => status,
            None => {
                self.child.kill().await?;
                self.child.wait().await?
            }
        };
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Engine socket not removed");
        }
        info!(?status, "Engine process stopped");
        Ok(status)
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "engine", stream, "{line}");
    }
}
