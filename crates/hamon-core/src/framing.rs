use thiserror::Error;

pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("snapshot exceeds max size without terminator: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub snapshots: Vec<Vec<u8>>,
    pub errors: Vec<FrameError>,
}

impl DecodeReport {
    fn push_snapshot(&mut self, body: Vec<u8>) {
        self.snapshots.push(body);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Splits a newline-delimited stream into snapshot bodies. A snapshot is
/// every non-empty line up to the next empty line; each line in the body
/// keeps its trailing `\n`.
///
/// A snapshot that outgrows the cap is reported once and then skipped up to
/// and including its terminator, so no fragment of it is ever emitted.
pub struct SnapshotDecoder {
    max_snapshot_bytes: usize,
    pending: Vec<u8>,
    body: Vec<u8>,
    discarding: bool,
    /// The head of the current line was already thrown away.
    truncated_line: bool,
}

impl SnapshotDecoder {
    pub fn new(max_snapshot_bytes: usize) -> Self {
        Self {
            max_snapshot_bytes,
            pending: Vec::new(),
            body: Vec::new(),
            discarding: false,
            truncated_line: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if std::mem::take(&mut self.truncated_line) {
                continue;
            }
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            if line.is_empty() {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                report.push_snapshot(std::mem::take(&mut self.body));
                continue;
            }
            if self.discarding {
                continue;
            }
            self.body.extend_from_slice(&line);
            self.body.push(b'\n');
            if self.body.len() > self.max_snapshot_bytes {
                report.push_error(FrameError::OversizedBuffer {
                    size: self.body.len(),
                    max: self.max_snapshot_bytes,
                });
                self.start_discarding();
            }
        }

        if self.pending.len() > self.max_snapshot_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_snapshot_bytes,
            });
            self.pending.clear();
            self.truncated_line = true;
            self.start_discarding();
        }

        report
    }

    /// Drops whatever was buffered for an unterminated snapshot and returns
    /// how many bytes were discarded.
    pub fn finish(&mut self) -> usize {
        let discarded = self.pending.len() + self.body.len();
        self.pending.clear();
        self.body.clear();
        self.discarding = false;
        self.truncated_line = false;
        discarded
    }

    fn start_discarding(&mut self) {
        self.body.clear();
        self.discarding = true;
    }
}

impl Default for SnapshotDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOT_BYTES)
    }
}
