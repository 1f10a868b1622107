//! A layered, copy-on-write text buffer.
//!
//! The buffer is an immutable base text under a stack of layers, each
//! holding a [`Patch`] of edits against the layer below. The topmost
//! layer is the live edit target; lower layers exist only while a
//! [`Snapshot`] pins them. Reads recurse down the stack, rebasing
//! coordinates through each patch; releasing the last snapshot of a
//! layer folds its patch into the layer beneath by composition.

use parking_lot::RwLock;
use patch::{wire, Patch};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::Arc;
use text::{ClipResult, Point, Range, Text, TextSlice};
use tracing::{debug, trace};

use crate::code_points::CodePoints;
use crate::SearchError;

const CR: u16 = b'\r' as u16;
const LF: u16 = b'\n' as u16;

/// The line terminator in effect at the end of a row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
    None,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::None => "",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct LayerId(u32);

/// One frame of the edit stack: a patch over the predecessor, plus the
/// cached size and extent of the text it produces.
struct Layer {
    predecessor: Option<LayerId>,
    patch: Patch,
    extent: Point,
    size: u32,
    snapshot_count: u32,
    is_last: bool,
}

impl Layer {
    fn is_first(&self) -> bool {
        self.predecessor.is_none()
    }
}

/// Slab of layers addressed by id. A layer is pinned by its snapshots
/// and owned through the chain hanging off the buffer's top layer.
#[derive(Default)]
struct LayerStore {
    slots: Vec<Option<Layer>>,
    free: Vec<usize>,
}

impl LayerStore {
    fn insert(&mut self, layer: Layer) -> LayerId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(layer);
                LayerId(index as u32)
            }
            None => {
                self.slots.push(Some(layer));
                LayerId(self.slots.len() as u32 - 1)
            }
        }
    }

    fn remove(&mut self, id: LayerId) -> Layer {
        let layer = self.slots[id.0 as usize].take().expect("removing a live layer");
        self.free.push(id.0 as usize);
        layer
    }

    fn get(&self, id: LayerId) -> &Layer {
        self.slots[id.0 as usize].as_ref().expect("live layer")
    }

    fn get_mut(&mut self, id: LayerId) -> &mut Layer {
        self.slots[id.0 as usize].as_mut().expect("live layer")
    }
}

struct BufferState {
    base_text: Arc<Text>,
    layers: LayerStore,
    top: LayerId,
}

fn previous_column(position: Point) -> Point {
    Point::new(position.row, position.column - 1)
}

impl BufferState {
    fn new(base_text: Text) -> Self {
        let base_text = Arc::new(base_text);
        let mut layers = LayerStore::default();
        let top = layers.insert(Layer {
            predecessor: None,
            patch: Patch::new(),
            extent: base_text.extent(),
            size: base_text.size(),
            snapshot_count: 0,
            is_last: true,
        });
        Self {
            base_text,
            layers,
            top,
        }
    }

    fn predecessor_size(&self, predecessor: Option<LayerId>) -> u32 {
        match predecessor {
            None => self.base_text.size(),
            Some(id) => self.layers.get(id).size,
        }
    }

    fn predecessor_character_at(&self, predecessor: Option<LayerId>, position: Point) -> u16 {
        match predecessor {
            None => self.base_text.at(position),
            Some(id) => self.character_at(id, position),
        }
    }

    fn predecessor_clip(&self, predecessor: Option<LayerId>, position: Point) -> ClipResult {
        match predecessor {
            None => self.base_text.clip_position(position),
            Some(id) => self.clip_position(id, position),
        }
    }

    fn predecessor_chunks<F>(
        &self,
        predecessor: Option<LayerId>,
        start: Point,
        end: Point,
        callback: &mut F,
    ) -> bool
    where
        F: FnMut(TextSlice) -> bool,
    {
        match predecessor {
            None => callback(
                TextSlice::new(self.base_text.clone()).slice(Range::new(start, end)),
            ),
            Some(id) => self.for_each_chunk_in_range(id, start, end, callback),
        }
    }

    fn character_at(&self, layer_id: LayerId, position: Point) -> u16 {
        let layer = self.layers.get(layer_id);
        match layer.patch.find_change_for_new_position(position) {
            None => self.predecessor_character_at(layer.predecessor, position),
            Some(change) if position < change.new_end => change
                .new_text
                .at(position.traversal(change.new_start)),
            Some(change) => self.predecessor_character_at(
                layer.predecessor,
                change.old_end.traverse(position.traversal(change.new_end)),
            ),
        }
    }

    /// Snap `position` onto a valid boundary of this layer's text and
    /// compute its absolute offset.
    ///
    /// A CRLF pair assembled across an edit boundary (the '\r' in the
    /// predecessor, the '\n' in an insertion, or the other way around)
    /// must be treated as one two-unit ending, so both branches check
    /// for it before reporting a boundary at the seam.
    fn clip_position(&self, layer_id: LayerId, position: Point) -> ClipResult {
        let layer = self.layers.get(layer_id);
        let preceding_change = if layer.is_last {
            layer.patch.change_for_new_position(position)
        } else {
            layer.patch.find_change_for_new_position(position)
        };
        let Some(change) = preceding_change else {
            return self.predecessor_clip(layer.predecessor, position);
        };

        let base_offset = self.predecessor_clip(layer.predecessor, change.old_start).offset;
        let current_offset =
            base_offset + change.preceding_new_text_size - change.preceding_old_text_size;

        if position < change.new_end {
            let within = change
                .new_text
                .clip_position(position.traversal(change.new_start));

            if within.offset == 0
                && change.old_start.column > 0
                && change.new_text.first() == Some(LF)
                && self.predecessor_character_at(
                    layer.predecessor,
                    previous_column(change.old_start),
                ) == CR
            {
                return ClipResult::new(previous_column(change.new_start), current_offset - 1);
            }

            ClipResult::new(
                change.new_start.traverse(within.position),
                current_offset + within.offset,
            )
        } else {
            let base_location = self.predecessor_clip(
                layer.predecessor,
                change.old_end.traverse(position.traversal(change.new_end)),
            );
            let distance_position = base_location.position.traversal(change.old_end);
            let distance_offset = base_location.offset - (base_offset + change.old_text_size);

            if distance_offset == 0
                && base_location.offset < self.predecessor_size(layer.predecessor)
            {
                let previous_unit = if !change.new_text.is_empty() {
                    change.new_text.last()
                } else if change.old_start.column > 0 {
                    Some(self.predecessor_character_at(
                        layer.predecessor,
                        previous_column(change.old_start),
                    ))
                } else {
                    None
                };

                if previous_unit == Some(CR)
                    && self.predecessor_character_at(layer.predecessor, base_location.position)
                        == LF
                {
                    return ClipResult::new(
                        previous_column(change.new_end),
                        current_offset + change.new_text.size() - 1,
                    );
                }
            }

            ClipResult::new(
                change.new_end.traverse(distance_position),
                current_offset + change.new_text.size() + distance_offset,
            )
        }
    }

    /// Walk the chunks covering `[clip(start), clip(end))` in order:
    /// inserted regions come from this layer's changes, everything else
    /// from the predecessor with coordinates rebased through the patch.
    /// Stops early when the callback returns true.
    fn for_each_chunk_in_range<F>(
        &self,
        layer_id: LayerId,
        start: Point,
        end: Point,
        callback: &mut F,
    ) -> bool
    where
        F: FnMut(TextSlice) -> bool,
    {
        let layer = self.layers.get(layer_id);
        let goal_position = self.clip_position(layer_id, end).position;
        let mut current_position = self.clip_position(layer_id, start).position;
        let mut base_position = current_position;
        let mut change = layer.patch.find_change_for_new_position(current_position);

        while current_position < goal_position {
            if let Some(c) = change {
                if current_position < c.new_end {
                    let slice = TextSlice::new(c.new_text.clone())
                        .prefix(
                            goal_position
                                .traversal(c.new_start)
                                .min(c.new_end.traversal(c.new_start)),
                        )
                        .suffix(current_position.traversal(c.new_start));
                    if callback(slice) {
                        return true;
                    }
                    base_position = c.old_end;
                    current_position = c.new_end;
                    if current_position > goal_position {
                        break;
                    }
                }

                base_position = c
                    .old_end
                    .traverse(current_position.traversal(c.new_end));
            }

            change = layer
                .patch
                .find_change_ending_after_new_position(current_position);

            let (next_position, next_base_position) = match change {
                Some(next) => (
                    goal_position.min(next.new_start),
                    base_position
                        .traverse(goal_position.traversal(current_position))
                        .min(next.old_start),
                ),
                None => (
                    goal_position,
                    base_position.traverse(goal_position.traversal(current_position)),
                ),
            };

            if self.predecessor_chunks(layer.predecessor, base_position, next_base_position, callback)
            {
                return true;
            }
            base_position = next_base_position;
            current_position = next_position;
        }

        false
    }

    fn position_for_offset(&self, layer_id: LayerId, goal_offset: u32) -> Point {
        let extent = self.layers.get(layer_id).extent;
        let mut position = Point::zero();
        let mut offset = 0;
        self.for_each_chunk_in_range(layer_id, Point::zero(), extent, &mut |slice| {
            let size = slice.size();
            if offset + size >= goal_offset {
                position = position.traverse(slice.position_for_offset(goal_offset - offset));
                return true;
            }
            position = position.traverse(slice.extent());
            offset += size;
            false
        });
        position
    }

    fn text_in_range(&self, layer_id: LayerId, range: Range) -> Text {
        let mut result = Text::new();
        self.for_each_chunk_in_range(layer_id, range.start, range.end, &mut |slice| {
            result.append(&slice);
            false
        });
        result
    }

    fn chunks_in_range(&self, layer_id: LayerId, range: Range) -> Vec<TextSlice> {
        let mut result = Vec::new();
        self.for_each_chunk_in_range(layer_id, range.start, range.end, &mut |slice| {
            if !slice.is_empty() {
                result.push(slice);
            }
            false
        });
        result
    }

    fn line_length_for_row(&self, layer_id: LayerId, row: u32) -> u32 {
        self.clip_position(layer_id, Point::new(row, u32::MAX))
            .position
            .column
    }

    fn set_text_in_range(&mut self, old_range: Range, new_text: Text) {
        let top_id = self.top;

        // The clipped positions feed the patch, so every change stays on
        // a valid predecessor boundary whatever range the caller passed.
        let start = self.clip_position(top_id, old_range.start);
        let mut end = self.clip_position(top_id, old_range.end);
        if end.offset < start.offset {
            end = start;
        }
        let old_range = Range::new(start.position, end.position);

        let new_range_end = start.position.traverse(new_text.extent());
        let deleted_text_size = end.offset - start.offset;
        trace!(
            deleted = deleted_text_size,
            inserted = new_text.size(),
            "splicing text"
        );

        let layer = self.layers.get_mut(top_id);
        layer.extent = new_range_end.traverse(layer.extent.traversal(old_range.end));
        layer.size += new_text.size();
        layer.size -= deleted_text_size;
        layer.patch.splice(
            old_range.start,
            old_range.extent(),
            new_text.extent(),
            None,
            Arc::new(new_text),
            deleted_text_size,
        );
    }

    /// Decrement `layer_id`'s snapshot count and, when nothing above it
    /// is pinned any more, fold the unpinned suffix of the stack into
    /// the deepest unpinned layer.
    fn release_snapshot_layer(&mut self, layer_id: LayerId) {
        {
            let layer = self.layers.get_mut(layer_id);
            assert!(layer.snapshot_count > 0, "releasing a layer with no snapshots");
            layer.snapshot_count -= 1;
            if layer.snapshot_count > 0 {
                return;
            }
        }
        if self.layers.get(self.top).snapshot_count > 0 {
            return;
        }

        let mut layers_to_fold = Vec::new();
        let mut bottom = self.top;
        while let Some(predecessor) = self.layers.get(bottom).predecessor {
            if self.layers.get(predecessor).snapshot_count != 0 {
                break;
            }
            layers_to_fold.push(bottom);
            bottom = predecessor;
        }
        if layers_to_fold.is_empty() {
            return;
        }

        let top_layer = self.layers.get(self.top);
        let (top_size, top_extent) = (top_layer.size, top_layer.extent);
        {
            let bottom_layer = self.layers.get_mut(bottom);
            bottom_layer.size = top_size;
            bottom_layer.extent = top_extent;
        }

        // Peel the dead layers deepest-first, alternating the direction
        // each composition walks from.
        let mut left_to_right = true;
        for &id in layers_to_fold.iter().rev() {
            let folded = self.layers.remove(id);
            self.layers
                .get_mut(bottom)
                .patch
                .combine(&folded.patch, left_to_right);
            left_to_right = !left_to_right;
        }

        debug!(folded = layers_to_fold.len(), "collapsed unpinned layers");
        self.top = bottom;
        self.layers.get_mut(bottom).is_last = true;
    }
}

struct BufferInner {
    state: RwLock<BufferState>,
}

/// A mutable text buffer with cheap point-in-time snapshots.
///
/// Mutations take `&mut self` (single writer); reads take `&self` and
/// are safe to run from snapshot-holding readers on other threads.
pub struct TextBuffer {
    inner: Arc<BufferInner>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::from(Text::new())
    }

    pub fn extent(&self) -> Point {
        let state = self.inner.state.read();
        state.layers.get(state.top).extent
    }

    pub fn size(&self) -> u32 {
        let state = self.inner.state.read();
        state.layers.get(state.top).size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn text(&self) -> Text {
        let state = self.inner.state.read();
        let extent = state.layers.get(state.top).extent;
        state.text_in_range(state.top, Range::new(Point::zero(), extent))
    }

    pub fn text_in_range(&self, range: Range) -> Text {
        let state = self.inner.state.read();
        state.text_in_range(state.top, range)
    }

    pub fn chunks(&self) -> Vec<TextSlice> {
        let state = self.inner.state.read();
        let extent = state.layers.get(state.top).extent;
        state.chunks_in_range(state.top, Range::new(Point::zero(), extent))
    }

    pub fn chunks_in_range(&self, range: Range) -> Vec<TextSlice> {
        let state = self.inner.state.read();
        state.chunks_in_range(state.top, range)
    }

    /// Visit the chunks covering `range` in order, stopping early when
    /// `callback` returns true.
    pub fn for_each_chunk_in_range<F>(&self, range: Range, mut callback: F) -> bool
    where
        F: FnMut(TextSlice) -> bool,
    {
        let state = self.inner.state.read();
        state.for_each_chunk_in_range(state.top, range.start, range.end, &mut callback)
    }

    pub fn clip_position(&self, position: Point) -> ClipResult {
        let state = self.inner.state.read();
        state.clip_position(state.top, position)
    }

    pub fn position_for_offset(&self, offset: u32) -> Point {
        let state = self.inner.state.read();
        state.position_for_offset(state.top, offset)
    }

    pub fn line_length_for_row(&self, row: u32) -> u32 {
        let state = self.inner.state.read();
        state.line_length_for_row(state.top, row)
    }

    pub fn line_ending_for_row(&self, row: u32) -> LineEnding {
        let state = self.inner.state.read();
        let mut result = LineEnding::None;
        state.for_each_chunk_in_range(
            state.top,
            Point::new(row, u32::MAX),
            Point::new(row.saturating_add(1), 0),
            &mut |slice| match slice.first() {
                None => false,
                Some(unit) => {
                    result = if unit == CR {
                        LineEnding::CrLf
                    } else {
                        LineEnding::Lf
                    };
                    true
                }
            },
        );
        result
    }

    pub fn set_text(&mut self, new_text: Text) {
        let extent = self.extent();
        self.set_text_in_range(Range::new(Point::zero(), extent), new_text);
    }

    pub fn set_text_in_range(&mut self, old_range: Range, new_text: Text) {
        self.inner
            .state
            .write()
            .set_text_in_range(old_range, new_text);
    }

    /// Replace the base text. Refused (returning false) while any
    /// snapshot holds a layer beneath the live one.
    pub fn reset_base_text(&mut self, new_base_text: Text) -> bool {
        let mut state = self.inner.state.write();
        let top = state.top;
        if !state.layers.get(top).is_first() {
            return false;
        }
        debug!(size = new_base_text.size(), "resetting base text");
        let new_base_text = Arc::new(new_base_text);
        state.layers.get_mut(top).patch.clear();
        state.layers.get_mut(top).extent = new_base_text.extent();
        state.layers.get_mut(top).size = new_base_text.size();
        state.base_text = new_base_text;
        true
    }

    /// Bake the top layer's outstanding changes into the base text.
    /// Refused under the same conditions as [`reset_base_text`](Self::reset_base_text).
    pub fn flush_outstanding_changes(&mut self) -> bool {
        let mut state = self.inner.state.write();
        let top = state.top;
        if !state.layers.get(top).is_first() {
            return false;
        }

        let BufferState {
            base_text, layers, ..
        } = &mut *state;
        let layer = layers.get_mut(top);
        let changes = layer.patch.get_changes();
        debug!(changes = changes.len(), "flushing outstanding changes");
        let base_text = Arc::make_mut(base_text);
        for change in changes {
            base_text.splice(change.new_start, change.old_extent(), &change.new_text);
        }
        layer.patch.clear();
        true
    }

    /// Write the top patch followed by the buffer's size and extent.
    /// Refused while any snapshot holds a layer beneath the live one.
    pub fn serialize_outstanding_changes(&self, sink: &mut Vec<u8>) -> bool {
        let state = self.inner.state.read();
        let layer = state.layers.get(state.top);
        if !layer.is_first() {
            return false;
        }
        layer.patch.serialize(sink);
        wire::put_u32(sink, layer.size);
        wire::put_point(sink, layer.extent);
        true
    }

    /// Restore outstanding changes written by
    /// [`serialize_outstanding_changes`](Self::serialize_outstanding_changes).
    /// Requires a first, empty top layer; malformed input leaves the
    /// buffer untouched.
    pub fn deserialize_outstanding_changes(&mut self, mut source: &[u8]) -> bool {
        let mut state = self.inner.state.write();
        let top = state.top;
        {
            let layer = state.layers.get(top);
            if !layer.is_first() || layer.patch.get_change_count() > 0 {
                return false;
            }
        }
        let Some(restored) = Patch::deserialize(&mut source) else {
            return false;
        };
        let Some(size) = wire::get_u32(&mut source) else {
            return false;
        };
        let Some(extent) = wire::get_point(&mut source) else {
            return false;
        };
        debug!(changes = restored.get_change_count(), "restored outstanding changes");
        let layer = state.layers.get_mut(top);
        layer.patch = restored;
        layer.size = size;
        layer.extent = extent;
        true
    }

    pub fn is_modified(&self) -> bool {
        let state = self.inner.state.read();
        let mut layer = state.layers.get(state.top);
        loop {
            if layer.patch.get_change_count() > 0 {
                return true;
            }
            match layer.predecessor {
                None => return false,
                Some(id) => layer = state.layers.get(id),
            }
        }
    }

    /// A stable digest of the base text, unaffected by pending edits.
    pub fn base_text_digest(&self) -> u64 {
        let state = self.inner.state.read();
        let mut seed = 0u64;
        for unit in state.base_text.iter() {
            seed ^= u64::from(unit)
                .wrapping_add(0x9e37_79b9)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2);
        }
        seed
    }

    /// Search the buffer for `pattern`, returning the UTF-16 code-unit
    /// offset of the first match.
    pub fn search(&self, pattern: &str) -> Result<Option<u32>, SearchError> {
        let regex = Regex::new(pattern)?;
        let chunks = self.chunks();

        let mut cursor = CodePoints::new(&chunks);
        let mut haystack = String::new();
        let mut unit_offsets = Vec::new();
        let mut unit_offset = 0;
        while let Some(code_point) = cursor.peek() {
            cursor.advance();
            let decoded =
                char::from_u32(code_point).unwrap_or(char::REPLACEMENT_CHARACTER);
            unit_offsets.push((haystack.len(), unit_offset));
            haystack.push(decoded);
            unit_offset += if code_point > 0xffff { 2 } else { 1 };
        }

        Ok(regex.find(&haystack).map(|found| {
            let index = unit_offsets.partition_point(|&(byte, _)| byte < found.start());
            unit_offsets
                .get(index)
                .map_or(unit_offset, |&(_, units)| units)
        }))
    }

    /// Freeze the current state into a [`Snapshot`]. An empty non-first
    /// top layer is not frozen; the snapshot attaches to its predecessor
    /// instead, so snapshot churn does not grow the stack.
    pub fn create_snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.write();
        let top = state.top;
        let top_layer = state.layers.get(top);

        let pinned = if !top_layer.is_first() && top_layer.patch.get_change_count() == 0 {
            top_layer.predecessor.expect("non-first layer has a predecessor")
        } else {
            let (extent, size) = (top_layer.extent, top_layer.size);
            state.layers.get_mut(top).is_last = false;
            let new_top = state.layers.insert(Layer {
                predecessor: Some(top),
                patch: Patch::new(),
                extent,
                size,
                snapshot_count: 0,
                is_last: true,
            });
            state.top = new_top;
            top
        };

        state.layers.get_mut(pinned).snapshot_count += 1;
        debug!("created snapshot");
        Snapshot {
            inner: self.inner.clone(),
            layer: pinned,
        }
    }

    /// A Graphviz-flavored dump of the base text and every layer's patch,
    /// bottom-up.
    pub fn get_dot_graph(&self) -> String {
        let state = self.inner.state.read();
        let mut ids = Vec::new();
        let mut current = state.top;
        loop {
            ids.push(current);
            match state.layers.get(current).predecessor {
                None => break,
                Some(id) => current = id,
            }
        }

        let mut result = String::from("graph { label=\"--- buffer ---\" }\n");
        let _ = writeln!(result, "graph {{ label=\"base:\n{}\" }}", state.base_text);
        for (index, id) in ids.iter().rev().enumerate() {
            let layer = state.layers.get(*id);
            let _ = writeln!(
                result,
                "graph {{ label=\"layer {} (snapshot count {}):\" }}",
                index, layer.snapshot_count
            );
            result.push_str(&layer.patch.get_dot_graph());
        }
        result
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Text> for TextBuffer {
    fn from(base_text: Text) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: RwLock::new(BufferState::new(base_text)),
            }),
        }
    }
}

impl From<&str> for TextBuffer {
    fn from(base_text: &str) -> Self {
        Self::from(Text::from(base_text))
    }
}

/// A pinned view of the buffer at the moment of creation.
///
/// Queries through a snapshot observe the frozen layer's text however
/// the buffer is edited afterwards. Dropping the snapshot releases the
/// layer and may collapse the stack.
pub struct Snapshot {
    inner: Arc<BufferInner>,
    layer: LayerId,
}

impl Snapshot {
    pub fn size(&self) -> u32 {
        self.inner.state.read().layers.get(self.layer).size
    }

    pub fn extent(&self) -> Point {
        self.inner.state.read().layers.get(self.layer).extent
    }

    pub fn line_length_for_row(&self, row: u32) -> u32 {
        self.inner.state.read().line_length_for_row(self.layer, row)
    }

    pub fn text(&self) -> Text {
        let state = self.inner.state.read();
        let extent = state.layers.get(self.layer).extent;
        state.text_in_range(self.layer, Range::new(Point::zero(), extent))
    }

    pub fn text_in_range(&self, range: Range) -> Text {
        self.inner.state.read().text_in_range(self.layer, range)
    }

    pub fn chunks(&self) -> Vec<TextSlice> {
        let state = self.inner.state.read();
        let extent = state.layers.get(self.layer).extent;
        state.chunks_in_range(self.layer, Range::new(Point::zero(), extent))
    }

    pub fn chunks_in_range(&self, range: Range) -> Vec<TextSlice> {
        self.inner.state.read().chunks_in_range(self.layer, range)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        debug!("releasing snapshot");
        self.inner.state.write().release_snapshot_layer(self.layer);
    }
}

#[cfg(test)]
impl TextBuffer {
    /// Number of layers in the stack, the base text excluded.
    fn layer_depth(&self) -> usize {
        let state = self.inner.state.read();
        let mut depth = 1;
        let mut current = state.top;
        while let Some(id) = state.layers.get(current).predecessor {
            depth += 1;
            current = id;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(buffer: &mut TextBuffer, start: (u32, u32), end: (u32, u32), text: &str) {
        buffer.set_text_in_range(
            Range::new(Point::new(start.0, start.1), Point::new(end.0, end.1)),
            Text::from(text),
        );
    }

    #[test]
    fn new_buffer_is_empty() {
        let buffer = TextBuffer::new();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.extent(), Point::zero());
        assert!(buffer.is_empty());
        assert!(!buffer.is_modified());
        assert_eq!(buffer.text(), "");
    }

    #[test]
    fn basic_edit_and_query() {
        let mut buffer = TextBuffer::from("abcdefg");
        edit(&mut buffer, (0, 2), (0, 5), "XYZ");
        assert_eq!(buffer.text(), "abXYZfg");
        assert_eq!(buffer.size(), 7);
        assert_eq!(buffer.extent(), Point::new(0, 7));
        assert_eq!(
            buffer.clip_position(Point::new(0, 3)),
            ClipResult::new(Point::new(0, 3), 3)
        );
        assert!(buffer.is_modified());
    }

    #[test]
    fn set_text_replaces_everything() {
        let mut buffer = TextBuffer::from("one\ntwo");
        buffer.set_text(Text::from("three"));
        assert_eq!(buffer.text(), "three");
        assert_eq!(buffer.extent(), Point::new(0, 5));
        assert_eq!(buffer.size(), 5);
    }

    #[test]
    fn clip_refuses_to_split_crlf_made_by_inserting_a_linefeed() {
        let mut buffer = TextBuffer::from("a\rb");
        edit(&mut buffer, (0, 2), (0, 2), "\n");
        assert_eq!(buffer.text(), "a\r\nb");
        assert_eq!(
            buffer.clip_position(Point::new(0, 2)),
            ClipResult::new(Point::new(0, 1), 1)
        );
    }

    #[test]
    fn clip_refuses_to_split_crlf_made_by_inserting_a_carriage_return() {
        let mut buffer = TextBuffer::from("a\nb");
        edit(&mut buffer, (0, 1), (0, 1), "\r");
        assert_eq!(buffer.text(), "a\r\nb");
        assert_eq!(
            buffer.clip_position(Point::new(0, 2)),
            ClipResult::new(Point::new(0, 1), 1)
        );
    }

    #[test]
    fn line_lengths_and_endings() {
        let mut buffer = TextBuffer::from("ab\ncd\r\nef");
        assert_eq!(buffer.line_length_for_row(0), 2);
        assert_eq!(buffer.line_length_for_row(1), 2);
        assert_eq!(buffer.line_length_for_row(2), 2);
        assert_eq!(buffer.line_ending_for_row(0), LineEnding::Lf);
        assert_eq!(buffer.line_ending_for_row(1), LineEnding::CrLf);
        assert_eq!(buffer.line_ending_for_row(2), LineEnding::None);
        assert_eq!(buffer.line_ending_for_row(1).as_str(), "\r\n");

        // An ending assembled across an edit boundary reads as CRLF.
        edit(&mut buffer, (0, 2), (0, 2), "\r");
        assert_eq!(buffer.line_ending_for_row(0), LineEnding::CrLf);
        assert_eq!(buffer.line_length_for_row(0), 2);
    }

    #[test]
    fn position_and_offset_translation() {
        let mut buffer = TextBuffer::from("one\ntwo\nthree");
        edit(&mut buffer, (1, 0), (1, 3), "2");
        assert_eq!(buffer.text(), "one\n2\nthree");
        assert_eq!(buffer.position_for_offset(0), Point::zero());
        assert_eq!(buffer.position_for_offset(4), Point::new(1, 0));
        assert_eq!(buffer.position_for_offset(5), Point::new(1, 1));
        assert_eq!(buffer.position_for_offset(6), Point::new(2, 0));
        assert_eq!(buffer.position_for_offset(11), Point::new(2, 5));
        // Past the end clamps to the extent.
        assert_eq!(buffer.position_for_offset(99), Point::new(2, 5));
    }

    #[test]
    fn out_of_range_positions_clip_instead_of_failing() {
        let mut buffer = TextBuffer::from("ab\ncd");
        assert_eq!(
            buffer.clip_position(Point::new(0, 99)),
            ClipResult::new(Point::new(0, 2), 2)
        );
        assert_eq!(
            buffer.clip_position(Point::new(9, 9)),
            ClipResult::new(Point::new(1, 2), 5)
        );
        edit(&mut buffer, (1, 99), (9, 9), "!");
        assert_eq!(buffer.text(), "ab\ncd!");
    }

    #[test]
    fn snapshot_observes_the_frozen_text() {
        let mut buffer = TextBuffer::from("hello world");
        let snapshot = buffer.create_snapshot();
        edit(&mut buffer, (0, 6), (0, 11), "there");
        assert_eq!(buffer.text(), "hello there");
        assert_eq!(snapshot.text(), "hello world");
        assert_eq!(snapshot.size(), 11);
        assert_eq!(snapshot.extent(), Point::new(0, 11));
        assert_eq!(snapshot.line_length_for_row(0), 11);
        drop(snapshot);
        assert!(buffer.is_modified());
        assert_eq!(buffer.text(), "hello there");
        assert_eq!(buffer.layer_depth(), 1);
    }

    #[test]
    fn snapshot_of_an_unmodified_empty_top_attaches_to_the_layer_below() {
        let mut buffer = TextBuffer::from("a");
        edit(&mut buffer, (0, 1), (0, 1), "b");
        let first = buffer.create_snapshot();
        assert_eq!(buffer.layer_depth(), 2);

        // No edits since: further snapshots must not grow the stack.
        let second = buffer.create_snapshot();
        let third = buffer.create_snapshot();
        assert_eq!(buffer.layer_depth(), 2);
        assert_eq!(second.text(), "ab");

        drop(first);
        drop(third);
        assert_eq!(buffer.layer_depth(), 2);
        drop(second);
        assert_eq!(buffer.layer_depth(), 1);
        assert_eq!(buffer.text(), "ab");
    }

    #[test]
    fn releasing_a_deep_snapshot_cannot_collapse_past_a_pinned_layer() {
        let mut buffer = TextBuffer::from("");
        edit(&mut buffer, (0, 0), (0, 0), "A");
        let lower = buffer.create_snapshot();
        edit(&mut buffer, (0, 1), (0, 1), "B");
        let upper = buffer.create_snapshot();
        edit(&mut buffer, (0, 2), (0, 2), "C");
        assert_eq!(buffer.layer_depth(), 3);

        drop(lower);
        // The layer pinned by `upper` blocks the fold below it.
        assert_eq!(buffer.layer_depth(), 3);
        assert_eq!(upper.text(), "AB");
        assert_eq!(buffer.text(), "ABC");

        drop(upper);
        assert_eq!(buffer.layer_depth(), 1);
        assert_eq!(buffer.text(), "ABC");
    }

    #[test]
    fn base_text_digest_ignores_pending_edits() {
        let mut buffer = TextBuffer::from("stable");
        let digest = buffer.base_text_digest();
        assert_eq!(TextBuffer::from("stable").base_text_digest(), digest);
        edit(&mut buffer, (0, 0), (0, 0), "un");
        assert_eq!(buffer.base_text_digest(), digest);
        assert_ne!(TextBuffer::from("unstable").base_text_digest(), digest);
    }

    #[test]
    fn reset_base_text_requires_a_first_top_layer() {
        let mut buffer = TextBuffer::from("old");
        assert!(buffer.reset_base_text(Text::from("new")));
        assert_eq!(buffer.text(), "new");
        assert!(!buffer.is_modified());

        let snapshot = buffer.create_snapshot();
        assert!(!buffer.reset_base_text(Text::from("newer")));
        assert_eq!(buffer.text(), "new");
        drop(snapshot);
        assert!(buffer.reset_base_text(Text::from("newer")));
        assert_eq!(buffer.text(), "newer");
    }

    #[test]
    fn flush_bakes_changes_into_the_base() {
        let mut buffer = TextBuffer::from("one two three");
        edit(&mut buffer, (0, 4), (0, 7), "2");
        edit(&mut buffer, (0, 0), (0, 3), "1");
        let digest_before = buffer.base_text_digest();
        assert_eq!(buffer.text(), "1 2 three");

        assert!(buffer.flush_outstanding_changes());
        assert_eq!(buffer.text(), "1 2 three");
        assert!(!buffer.is_modified());
        assert_ne!(buffer.base_text_digest(), digest_before);
        assert_eq!(
            buffer.base_text_digest(),
            TextBuffer::from("1 2 three").base_text_digest()
        );
    }

    #[test]
    fn flush_is_refused_while_snapshots_pin_lower_layers() {
        let mut buffer = TextBuffer::from("abc");
        let snapshot = buffer.create_snapshot();
        edit(&mut buffer, (0, 0), (0, 0), "x");
        assert!(!buffer.flush_outstanding_changes());
        assert!(buffer.is_modified());
        drop(snapshot);
        assert!(buffer.flush_outstanding_changes());
        assert_eq!(buffer.text(), "xabc");
    }

    #[test]
    fn outstanding_changes_round_trip_through_bytes() {
        let mut buffer = TextBuffer::from("one\ntwo");
        edit(&mut buffer, (0, 0), (0, 3), "1");
        edit(&mut buffer, (1, 0), (1, 3), "2\n2");

        let mut bytes = Vec::new();
        assert!(buffer.serialize_outstanding_changes(&mut bytes));

        let mut restored = TextBuffer::from("one\ntwo");
        assert!(restored.deserialize_outstanding_changes(&bytes));
        assert_eq!(restored.text(), "1\n2\n2");
        assert_eq!(restored.size(), buffer.size());
        assert_eq!(restored.extent(), buffer.extent());
        assert!(restored.is_modified());
    }

    #[test]
    fn deserialize_requires_an_empty_first_top_layer() {
        let mut buffer = TextBuffer::from("abc");
        edit(&mut buffer, (0, 0), (0, 0), "x");
        let mut bytes = Vec::new();
        assert!(buffer.serialize_outstanding_changes(&mut bytes));

        let mut dirty = TextBuffer::from("abc");
        edit(&mut dirty, (0, 0), (0, 0), "y");
        assert!(!dirty.deserialize_outstanding_changes(&bytes));
        assert_eq!(dirty.text(), "yabc");

        let mut pinned = TextBuffer::from("abc");
        let snapshot = pinned.create_snapshot();
        assert!(!pinned.deserialize_outstanding_changes(&bytes));
        drop(snapshot);

        let mut clean = TextBuffer::from("abc");
        assert!(!clean.deserialize_outstanding_changes(&bytes[..3]));
        assert!(!clean.is_modified());
        assert!(clean.deserialize_outstanding_changes(&bytes));
        assert_eq!(clean.text(), "xabc");
    }

    #[test]
    fn serialization_is_refused_while_snapshots_pin_lower_layers() {
        let mut buffer = TextBuffer::from("abc");
        let snapshot = buffer.create_snapshot();
        let mut bytes = Vec::new();
        assert!(!buffer.serialize_outstanding_changes(&mut bytes));
        assert!(bytes.is_empty());
        drop(snapshot);
        assert!(buffer.serialize_outstanding_changes(&mut bytes));
    }

    #[test]
    fn dot_graph_lists_layers_bottom_up() {
        let mut buffer = TextBuffer::from("base");
        let snapshot = buffer.create_snapshot();
        edit(&mut buffer, (0, 0), (0, 0), "top ");

        let graph = buffer.get_dot_graph();
        assert!(graph.starts_with("graph { label=\"--- buffer ---\" }\n"));
        assert!(graph.contains("label=\"base:\nbase\""));
        assert!(graph.contains("layer 0 (snapshot count 1)"));
        assert!(graph.contains("layer 1 (snapshot count 0)"));
        drop(snapshot);
    }

    #[test]
    fn chunks_cover_the_text_without_gaps() {
        let mut buffer = TextBuffer::from("one two three");
        edit(&mut buffer, (0, 4), (0, 7), "2");
        edit(&mut buffer, (0, 0), (0, 3), "1\n1");

        let chunks = buffer.chunks();
        assert!(chunks.len() > 1);
        let total: u32 = chunks.iter().map(TextSlice::size).sum();
        assert_eq!(total, buffer.size());
        let joined: String = chunks.iter().map(TextSlice::to_string).collect();
        assert_eq!(joined, buffer.text().to_string());
    }

    #[test]
    fn chunk_iteration_stops_at_change_boundary() {
        // An edit ending exactly at the iteration goal: the inserted text
        // is emitted up to the goal and iteration terminates.
        let mut buffer = TextBuffer::from("abcdef");
        edit(&mut buffer, (0, 2), (0, 4), "XY");

        let chunks = buffer.chunks_in_range(Range::new(Point::zero(), Point::new(0, 4)));
        let joined: String = chunks.iter().map(TextSlice::to_string).collect();
        assert_eq!(joined, "abXY");

        let mut seen = Vec::new();
        let stopped = buffer.for_each_chunk_in_range(
            Range::new(Point::zero(), Point::new(0, 4)),
            |slice| {
                seen.push(slice.to_string());
                true
            },
        );
        assert!(stopped);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "ab");
    }

    #[test]
    fn searches_decode_surrogate_pairs() {
        let buffer = TextBuffer::from("ab\u{1F601}cd");
        assert_eq!(buffer.search("\u{1F601}").unwrap(), Some(2));
        // The pair occupies two code units.
        assert_eq!(buffer.search("cd").unwrap(), Some(4));
        assert_eq!(buffer.search("zzz").unwrap(), None);
        assert!(buffer.search("[").is_err());
    }

    #[test]
    fn search_spans_chunk_boundaries() {
        let mut buffer = TextBuffer::from("hello world");
        edit(&mut buffer, (0, 5), (0, 6), " brave ");
        assert_eq!(buffer.text(), "hello brave world");
        assert!(buffer.chunks().len() > 1);
        assert_eq!(buffer.search("o b.ave w").unwrap(), Some(4));
        assert_eq!(buffer.search("^hello").unwrap(), Some(0));
    }
}
