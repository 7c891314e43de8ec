//! The pane registry: every child process the agent spawns lives here,
//! together with the pumps that move bytes between its PTY and whatever
//! data channels are currently bound to it.

pub mod buffer;
pub mod pty;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

pub use buffer::{MarkerBuffer, MarkerError};
pub use pty::WinSize;

const PUMP_CHUNK: usize = 4096;
const PUMP_QUEUE: usize = 32;

#[derive(Debug, Error)]
#[error("data channel closed")]
pub struct SinkClosed;

/// One side of a data channel, as seen by the registry. Production wraps a
/// WebRTC data channel; tests substitute a recording sink.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    fn label(&self) -> &str;
    async fn send(&self, bytes: &[u8]) -> Result<(), SinkClosed>;
    async fn close(&self);
}

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("unknown pane {0}")]
    Unknown(u32),
    #[error("pane {0} is not running")]
    NotRunning(u32),
    #[error("pane {0} is closed")]
    Closed(u32),
    #[error("failed to spawn {command:?}: {reason}")]
    SpawnFailed { command: String, reason: String },
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("pty error on pane {pane_id}: {reason}")]
    Io { pane_id: u32, reason: String },
}

/// What a freshly opened data channel's label asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// The distinguished `%` control channel.
    Control,
    /// `>17`: bind to an existing pane.
    Attach { pane_id: u32 },
    /// `12x34,cmd,args…` or `cmd,args…`: spawn a new pane.
    NewPane {
        winsize: Option<WinSize>,
        command: Vec<String>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad channel label {label:?}: {reason}")]
pub struct LabelError {
    pub label: String,
    pub reason: &'static str,
}

/// Parse a data-channel label: comma-separated, first field `%`, `>id`,
/// `<rows>x<cols>` or the command itself.
pub fn parse_label(label: &str) -> Result<ChannelTarget, LabelError> {
    let bad = |reason| LabelError {
        label: label.to_string(),
        reason,
    };
    if label == "%" {
        return Ok(ChannelTarget::Control);
    }
    if let Some(rest) = label.strip_prefix('>') {
        let pane_id = rest.parse().map_err(|_| bad("pane id is not a number"))?;
        return Ok(ChannelTarget::Attach { pane_id });
    }
    let mut fields = label.split(',').map(str::to_string);
    let first = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| bad("empty"))?;
    if let Some(winsize) = parse_winsize(&first) {
        let winsize = winsize.ok_or_else(|| bad("zero window dimension"))?;
        let command: Vec<String> = fields.collect();
        if command.is_empty() {
            return Err(bad("missing command"));
        }
        return Ok(ChannelTarget::NewPane {
            winsize: Some(winsize),
            command,
        });
    }
    let mut command = vec![first];
    command.extend(fields);
    Ok(ChannelTarget::NewPane {
        winsize: None,
        command,
    })
}

/// `Some(None)` means the field was shaped like a size but had a zero
/// dimension; `None` means it is not a size at all.
fn parse_winsize(field: &str) -> Option<Option<WinSize>> {
    let (rows, cols) = field.split_once('x')?;
    let rows: u16 = rows.parse().ok()?;
    let cols: u16 = cols.parse().ok()?;
    if rows == 0 || cols == 0 {
        return Some(None);
    }
    Some(Some(WinSize { rows, cols }))
}

struct Binding {
    id: u64,
    sink: Arc<dyn ChannelSink>,
}

/// Everything touched by the output path, behind one lock so replay-then-
/// bind and live fan-out cannot interleave on the same sink.
struct PaneOutput {
    buffer: MarkerBuffer,
    bindings: Vec<Binding>,
}

impl PaneOutput {
    async fn broadcast(&mut self, bytes: &[u8]) {
        self.buffer.append(bytes);
        let mut closed = Vec::new();
        for binding in &self.bindings {
            if binding.sink.send(bytes).await.is_err() {
                debug!(label = binding.sink.label(), "dropping closed binding");
                closed.push(binding.id);
            }
        }
        if !closed.is_empty() {
            self.bindings.retain(|b| !closed.contains(&b.id));
        }
    }
}

pub struct Pane {
    pub id: u32,
    pub command: Vec<String>,
    pub child_pid: Option<u32>,
    pub created_at: SystemTime,
    winsize: std::sync::Mutex<WinSize>,
    pty: pty::PtyHandle,
    out: AsyncMutex<PaneOutput>,
    is_running: AtomicBool,
}

impl Pane {
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn winsize(&self) -> WinSize {
        *self.winsize.lock().expect("winsize lock poisoned")
    }
}

/// Diagnostic snapshot of one pane.
#[derive(Debug, Clone)]
pub struct PaneSnapshot {
    pub id: u32,
    pub command: Vec<String>,
    pub child_pid: Option<u32>,
    pub winsize: WinSize,
    pub is_running: bool,
    pub created_at: SystemTime,
}

/// Owns every pane. The map lock is held only for lookup, insert and
/// remove; per-pane state sits behind pane-scoped locks.
pub struct PaneRegistry {
    panes: RwLock<HashMap<u32, Arc<Pane>>>,
    next_pane_id: AtomicU32,
    next_binding_id: AtomicU64,
    buffer_bytes: usize,
}

impl PaneRegistry {
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            panes: RwLock::new(HashMap::new()),
            next_pane_id: AtomicU32::new(1),
            next_binding_id: AtomicU64::new(1),
            buffer_bytes,
        }
    }

    async fn get(&self, pane_id: u32) -> Result<Arc<Pane>, PaneError> {
        self.panes
            .read()
            .await
            .get(&pane_id)
            .cloned()
            .ok_or(PaneError::Unknown(pane_id))
    }

    /// Spawn `command` under a PTY sized to `winsize`, register the pane and
    /// start its output pump.
    pub async fn add_pane(
        &self,
        command: Vec<String>,
        winsize: WinSize,
    ) -> Result<Arc<Pane>, PaneError> {
        let spawned = pty::spawn(&command, winsize).map_err(|err| PaneError::SpawnFailed {
            command: command.join(" "),
            reason: err.to_string(),
        })?;
        let id = self.next_pane_id.fetch_add(1, Ordering::Relaxed);
        let child_pid = spawned.child.process_id();
        let pane = Arc::new(Pane {
            id,
            command: command.clone(),
            child_pid,
            created_at: SystemTime::now(),
            winsize: std::sync::Mutex::new(winsize),
            pty: spawned.handle,
            out: AsyncMutex::new(PaneOutput {
                buffer: MarkerBuffer::new(self.buffer_bytes),
                bindings: Vec::new(),
            }),
            is_running: AtomicBool::new(true),
        });
        self.panes.write().await.insert(id, Arc::clone(&pane));
        start_pump(Arc::clone(&pane), spawned.reader, spawned.child);
        info!(pane_id = id, command = ?command, %winsize, "pane spawned");
        Ok(pane)
    }

    /// Fail fast with the error a later bind would hit.
    pub async fn ensure_running(&self, pane_id: u32) -> Result<(), PaneError> {
        let pane = self.get(pane_id).await?;
        if !pane.is_running() {
            return Err(PaneError::NotRunning(pane_id));
        }
        Ok(())
    }

    /// Bind `sink` to a pane, optionally replaying buffered output from
    /// `replay_from` first. A live-only bind (`replay_from = None`) requires
    /// a running pane; a bind with replay is also valid against a pane whose
    /// process already exited, in which case the buffered tail is delivered
    /// and the sink is closed. Returns the binding id.
    pub async fn attach(
        &self,
        pane_id: u32,
        sink: Arc<dyn ChannelSink>,
        replay_from: Option<u64>,
    ) -> Result<u64, PaneError> {
        let pane = self.get(pane_id).await?;
        let mut out = pane.out.lock().await;
        if !pane.is_running() && replay_from.is_none() {
            return Err(PaneError::NotRunning(pane_id));
        }
        if let Some(from) = replay_from {
            let bytes = out.buffer.replay(from)?;
            if !bytes.is_empty() && sink.send(&bytes).await.is_err() {
                return Err(PaneError::Closed(pane_id));
            }
        }
        let binding_id = self.next_binding_id.fetch_add(1, Ordering::Relaxed);
        if pane.is_running() {
            out.bindings.push(Binding {
                id: binding_id,
                sink,
            });
        } else {
            sink.close().await;
        }
        debug!(pane_id, binding_id, "binding attached");
        Ok(binding_id)
    }

    /// Drop one binding; the pane and its process keep running.
    pub async fn detach(&self, pane_id: u32, binding_id: u64) {
        let Ok(pane) = self.get(pane_id).await else {
            return;
        };
        let mut out = pane.out.lock().await;
        out.bindings.retain(|b| b.id != binding_id);
    }

    /// Write input bytes to the pane's PTY.
    pub async fn write(&self, pane_id: u32, bytes: &[u8]) -> Result<(), PaneError> {
        let pane = self.get(pane_id).await?;
        if !pane.is_running() {
            return Err(PaneError::Closed(pane_id));
        }
        pane.pty
            .write(bytes)
            .map_err(|_| PaneError::Closed(pane_id))
    }

    pub async fn resize(&self, pane_id: u32, winsize: WinSize) -> Result<(), PaneError> {
        let pane = self.get(pane_id).await?;
        *pane.winsize.lock().expect("winsize lock poisoned") = winsize;
        pane.pty.resize(winsize).map_err(|err| PaneError::Io {
            pane_id,
            reason: err.to_string(),
        })?;
        debug!(pane_id, %winsize, "pane resized");
        Ok(())
    }

    pub async fn mark_now(&self, pane_id: u32) -> Result<u64, PaneError> {
        let pane = self.get(pane_id).await?;
        let out = pane.out.lock().await;
        Ok(out.buffer.mark_now())
    }

    pub async fn check_marker(&self, pane_id: u32, marker: u64) -> Result<(), PaneError> {
        let pane = self.get(pane_id).await?;
        let out = pane.out.lock().await;
        out.buffer.check(marker)?;
        Ok(())
    }

    /// Kill the pane's process group, drop its bindings and forget it.
    /// Closing an unknown pane is a no-op.
    pub async fn close_pane(&self, pane_id: u32) {
        let removed = self.panes.write().await.remove(&pane_id);
        let Some(pane) = removed else {
            return;
        };
        pane.is_running.store(false, Ordering::SeqCst);
        pane.pty.kill();
        let mut out = pane.out.lock().await;
        for binding in out.bindings.drain(..) {
            binding.sink.close().await;
        }
        info!(pane_id, "pane closed");
    }

    pub async fn all(&self) -> Vec<PaneSnapshot> {
        self.panes
            .read()
            .await
            .values()
            .map(|pane| PaneSnapshot {
                id: pane.id,
                command: pane.command.clone(),
                child_pid: pane.child_pid,
                winsize: pane.winsize(),
                is_running: pane.is_running(),
                created_at: pane.created_at,
            })
            .collect()
    }

    /// Agent shutdown sweep: kill everything that is still running.
    pub async fn shutdown(&self) {
        let panes: Vec<_> = self.panes.write().await.drain().collect();
        for (id, pane) in panes {
            if pane.is_running() {
                info!(pane_id = id, "killing pane on shutdown");
                pane.pty.kill();
            }
        }
    }
}

/// Start the two halves of a pane's output pump: a blocking reader thread
/// feeding a bounded queue, and an async drain that appends to the marker
/// buffer and fans out to bindings.
fn start_pump(
    pane: Arc<Pane>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE);
    let pane_id = pane.id;

    let spawned = std::thread::Builder::new()
        .name(format!("webexec-pty-{pane_id}"))
        .spawn(move || {
            let mut reader = reader;
            let mut child = child;
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(pane_id, error = %err, "pty read ended");
                        break;
                    }
                }
            }
            drop(tx);
            let _ = child.wait();
        });
    if let Err(err) = spawned {
        warn!(pane_id, error = %err, "failed to start pty reader thread");
    }

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            pane.out.lock().await.broadcast(&chunk).await;
        }
        // Flip the flag under the output lock so a concurrent attach either
        // lands in the drain below or sees the pane as exited.
        let mut out = pane.out.lock().await;
        pane.is_running.store(false, Ordering::SeqCst);
        for binding in out.bindings.drain(..) {
            binding.sink.close().await;
        }
        info!(pane_id, "pane process exited");
    });
}
