//! Strata is a layered text buffer: an immutable base text under a stack
//! of copy-on-write edit layers, with cheap snapshots for concurrent
//! readers.
//!
//! The live text is never materialized. Edits land in the top layer's
//! patch; every query translates positions through the stack, down to
//! the base text. [`TextBuffer::create_snapshot`] freezes the current
//! top layer, and dropping the last [`Snapshot`] of a layer folds its
//! patch into the layer beneath, so the stack stays as shallow as the
//! set of live snapshots allows.

mod buffer;
mod code_points;

pub use buffer::{LineEnding, Snapshot, TextBuffer};
pub use code_points::CodePoints;
pub use text::{ClipResult, Point, Range, Text, TextSlice};

/// The pattern handed to [`TextBuffer::search`] failed to compile.
#[derive(Debug, thiserror::Error)]
#[error("invalid search pattern: {0}")]
pub struct SearchError(#[from] regex::Error);
