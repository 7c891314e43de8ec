//! Thin wrappers around the platform PTY: spawn a child under a sized
//! pseudo-terminal and expose the pieces the pane broker pumps.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WinSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl WinSize {
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl std::fmt::Display for WinSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// The master side of a spawned PTY. Kept by the pane for writes, resizes
/// and kills; the blocking reader and the child handle move into the pump.
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// Open a PTY sized to `size` and start `command` on its slave side.
pub fn spawn(command: &[String], size: WinSize) -> Result<SpawnedPty> {
    let (program, args) = command
        .split_first()
        .context("empty command for new pane")?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(size.to_pty_size())
        .context("open PTY pair")?;

    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn {program:?} in PTY"))?;
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .context("clone PTY reader")?;
    let writer = pair.master.take_writer().context("take PTY writer")?;

    Ok(SpawnedPty {
        handle: PtyHandle {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        },
        reader,
        child,
    })
}

impl PtyHandle {
    /// Write all of `bytes` to the child's stdin, retrying short writes.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Set the PTY window size; the kernel delivers SIGWINCH to the child.
    pub fn resize(&self, size: WinSize) -> Result<()> {
        self.master
            .lock()
            .expect("pty master lock poisoned")
            .resize(size.to_pty_size())
            .context("resize PTY")
    }

    pub fn kill(&self) {
        let mut killer = self.killer.lock().expect("pty killer lock poisoned");
        if let Err(err) = killer.kill() {
            tracing::debug!(error = %err, "kill on exited child");
        }
    }
}
