//! Stream protocol frames.
//!
//! Text frames carrying JSON objects in both directions. Client frames put
//! their payload at the top level; output frames nest it under `data`.

use serde::{Deserialize, Serialize};

/// Frames sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Raw bytes to feed the tab's PTY.
    PtyInput { input: String },
    /// Window size change; the first one also triggers the lazy attach.
    Resize { rows: u16, cols: u16 },
}

/// Frames sent to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    PtyOutput { data: PtyOutput },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PtyOutput {
    pub output: String,
}

/// Encode a chunk of PTY output as a `pty-output` frame.
pub fn pty_output_frame(bytes: &[u8]) -> Vec<u8> {
    let frame = ServerFrame::PtyOutput {
        data: PtyOutput {
            output: String::from_utf8_lossy(bytes).into_owned(),
        },
    };
    serde_json::to_vec(&frame).unwrap_or_default()
}
