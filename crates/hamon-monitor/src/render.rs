use crate::surface::Surface;
use ratatui::{buffer::Buffer, layout::Rect};
use std::collections::HashMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Hand-off depth between sessions and the coordinator. Requesters still
/// wait for the acknowledgement, so this never lets a caller run ahead.
const RENDER_QUEUE_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render coordinator has stopped")]
    CoordinatorGone,
}

/// A session's rendered panel, addressed to its fixed region of the screen.
#[derive(Debug, Clone)]
pub struct PanelFrame {
    pub region_id: usize,
    pub region: Rect,
    pub seq: u64,
    pub buffer: Buffer,
}

struct RenderRequest {
    frame: PanelFrame,
    ack: oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct RenderHandle {
    tx: mpsc::Sender<RenderRequest>,
}

impl RenderHandle {
    /// Returns once the frame has been written to the surface and flushed.
    pub async fn render(&self, frame: PanelFrame) -> Result<(), RenderError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(RenderRequest { frame, ack })
            .await
            .map_err(|_| RenderError::CoordinatorGone)?;
        done.await.map_err(|_| RenderError::CoordinatorGone)
    }
}

/// Starts the coordinator task. It owns `surface` until every handle has
/// been dropped, then hands it back through the join handle.
pub fn spawn<S: Surface>(surface: S) -> (RenderHandle, JoinHandle<S>) {
    let (tx, rx) = mpsc::channel(RENDER_QUEUE_CAPACITY);
    let task = tokio::spawn(coordinate(surface, rx));
    (RenderHandle { tx }, task)
}

async fn coordinate<S: Surface>(mut surface: S, mut rx: mpsc::Receiver<RenderRequest>) -> S {
    let mut last_seq: HashMap<usize, u64> = HashMap::new();
    while let Some(RenderRequest { frame, ack }) = rx.recv().await {
        let stale = last_seq
            .get(&frame.region_id)
            .is_some_and(|seen| frame.seq < *seen);
        if stale {
            debug!(
                event = "render_stale_frame",
                region = frame.region_id,
                seq = frame.seq
            );
        } else {
            blit(&mut surface, &frame);
            if let Err(err) = surface.flush() {
                warn!(event = "render_flush_error", region = frame.region_id, error = %err);
            }
            last_seq.insert(frame.region_id, frame.seq);
        }
        let _ = ack.send(());
    }
    surface
}

fn blit<S: Surface>(surface: &mut S, frame: &PanelFrame) {
    let source = frame.buffer.area;
    let width = source.width.min(frame.region.width);
    let height = source.height.min(frame.region.height);
    for dy in 0..height {
        for dx in 0..width {
            let cell = frame.buffer.get(source.x + dx, source.y + dy);
            surface.set_cell(frame.region.x + dx, frame.region.y + dy, cell);
        }
    }
}
