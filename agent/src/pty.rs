//! Portable PTY bridge: spawns the user's shell against a fresh
//! pseudo-terminal and exposes three handles — a writer for injected
//! keystrokes, a receiver of raw output chunks, and a resize sender.
//! Reads happen on a blocking thread because the PTY master is a plain
//! file descriptor; resizes run on their own thread so the master stays
//! owned in one place.

use anyhow::Result;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

/// Largest chunk handed to the async side per PTY read.
const READ_CHUNK_BYTES: usize = 8192;

/// Sender to request a PTY resize (rows, cols). Fed both by the server
/// loop (viewer-initiated resize) and the SIGWINCH handler.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// A running shell behind a PTY. The writer takes injected input; the
/// child handle is kept so the process can be killed and reaped.
pub struct PtyShell {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

impl PtyShell {
    /// Write keystrokes to the PTY master.
    pub fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        writer.write_all(data)?;
        writer.flush()
    }

    /// Kill the shell and reap it so no zombie is left behind.
    pub fn shutdown(&self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Spawn `shell` in a new PTY of the given size, with the environment a
/// modern terminal emulator expects. Returns the shell handle, the
/// output chunk receiver, and the resize sender.
pub fn spawn_shell(
    shell: &str,
    rows: u16,
    cols: u16,
) -> Result<(PtyShell, mpsc::Receiver<Vec<u8>>, ResizeSender)> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    let child = pair.slave.spawn_command(cmd)?;

    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();

    // Blocking thread: read PTY output and hand chunks to the async side.
    // EOF or EIO means the shell exited; the channel closing is the signal.
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resize requests to the master.
    std::thread::spawn(move || {
        while let Ok((rows, cols)) = resize_rx.recv() {
            let _ = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    });

    let handle = PtyShell {
        writer: Arc::new(Mutex::new(writer)),
        child: Arc::new(Mutex::new(child)),
    };
    Ok((handle, rx, resize_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shell_echoes_injected_input() {
        let (shell, mut rx, _resize) =
            spawn_shell("/bin/sh", 24, 80).unwrap_or_else(|e| panic!("pty spawn failed: {e}"));

        shell
            .write_input(b"echo pty_round_$((40+2))\n")
            .unwrap_or_else(|e| panic!("pty write failed: {e}"));

        // Collect output until the expansion shows up; the raw echo of the
        // typed command would match a literal marker, hence the arithmetic.
        let mut seen = String::new();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(chunk) = rx.recv().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains("pty_round_42") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        shell.shutdown();
        assert!(found, "expected echoed marker in PTY output, got: {seen:?}");
    }

    #[tokio::test]
    async fn shutdown_reaps_the_child() {
        let (shell, mut rx, _resize) =
            spawn_shell("/bin/sh", 24, 80).unwrap_or_else(|e| panic!("pty spawn failed: {e}"));
        shell.shutdown();

        // Once the child is gone the reader thread hits EOF and the
        // output channel closes.
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            while rx.recv().await.is_some() {}
            true
        })
        .await
        .unwrap_or(false);
        assert!(closed, "output channel never closed after shutdown");
    }
}
