//! PTY bridge.
//!
//! Starts an unstarted command descriptor under a pseudo-terminal and
//! exposes write/resize/close on the master side. Reads happen on a
//! separate handle owned by the session's forwarder; they block until the
//! child exits or the PTY is closed.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use portable_pty::{
    native_pty_system, Child, CommandBuilder, MasterPty, PtySize, PtySystem as _, SlavePty as _,
};
use thiserror::Error;

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// Errors from PTY setup and control.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(anyhow::Error),

    #[error("failed to spawn command under pty: {0}")]
    Spawn(anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(anyhow::Error),

    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking reader for the PTY output stream.
pub type PtyReader = Box<dyn Read + Send>;

/// A child process running under a pseudo-terminal.
///
/// Writes and resizes go through the master side; `close` is idempotent so
/// both the forwarder and the unregister path may release the PTY without
/// double-killing the child.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closed: AtomicBool,
}

/// Start `command` under a new PTY.
///
/// Returns the process handle and the reader for its output stream.
pub fn spawn(command: CommandBuilder) -> Result<(Arc<PtyProcess>, PtyReader), PtyError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: INITIAL_ROWS,
            cols: INITIAL_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(PtyError::Open)?;

    let child = pair.slave.spawn_command(command).map_err(PtyError::Spawn)?;
    // The child holds the slave end; dropping ours makes EOF observable on
    // the master once the child exits.
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(PtyError::Open)?;
    let writer = pair.master.take_writer().map_err(PtyError::Open)?;

    let process = PtyProcess {
        master: Mutex::new(pair.master),
        writer: Mutex::new(writer),
        child: Mutex::new(child),
        closed: AtomicBool::new(false),
    };

    Ok((Arc::new(process), reader))
}

impl PtyProcess {
    /// Write raw bytes to the child's terminal input.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut writer = lock_unpoisoned(&self.writer);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Propagate a window size change to the terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = lock_unpoisoned(&self.master);
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Kill the child and mark the PTY closed. Safe to call more than once;
    /// only the first call acts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = lock_unpoisoned(&self.child);
        if let Err(err) = child.kill() {
            debug!("pty child kill failed (likely already exited): {err}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
