//! Deterministic building blocks shared by the monitor and the relay: the
//! stats CSV parser, the snapshot framer, control command lines and the
//! target list loader.

pub mod command;
pub mod config;
pub mod framing;
pub mod stats;

pub use command::{Action, ControlCommand};
pub use config::{load_targets, parse_targets, resolve_config_path, ConfigError, Target};
pub use framing::{DecodeReport, FrameError, SnapshotDecoder, DEFAULT_MAX_SNAPSHOT_BYTES};
pub use stats::{
    format_header, format_row, Snapshot, SnapshotLine, StatError, StatRow, FIELD_COUNT,
};
