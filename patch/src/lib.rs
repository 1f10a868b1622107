//! An ordered set of edits tracked in two coordinate spaces.
//!
//! A [`Patch`] records what changed between an input ("old") text and an
//! output ("new") text as a sorted sequence of disjoint [`Change`]s. Every
//! change carries its range in both spaces plus the running size of all
//! earlier changes, so positions and absolute offsets can be translated
//! between the spaces with a single lookup.

pub mod wire;

use std::sync::Arc;
use text::{Point, Text, TextSlice};

/// One contiguous edit: the old range was replaced by `new_text`.
///
/// `old_text_size` is the number of code units of input text the change
/// covers; the `preceding_*` fields accumulate the sizes of all changes
/// before this one, in each space.
#[derive(Clone, Debug)]
pub struct Change {
    pub old_start: Point,
    pub old_end: Point,
    pub new_start: Point,
    pub new_end: Point,
    pub old_text: Option<Arc<Text>>,
    pub new_text: Arc<Text>,
    pub old_text_size: u32,
    pub preceding_old_text_size: u32,
    pub preceding_new_text_size: u32,
}

impl Change {
    pub fn old_extent(&self) -> Point {
        self.old_end.traversal(self.old_start)
    }

    pub fn new_extent(&self) -> Point {
        self.new_end.traversal(self.new_start)
    }
}

/// A sorted, disjoint set of [`Change`]s keyed on both coordinate spaces.
#[derive(Clone, Debug, Default)]
pub struct Patch {
    changes: Vec<Change>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn get_change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// The change whose new range contains `position`, or the nearest
    /// change preceding it.
    pub fn find_change_for_new_position(&self, position: Point) -> Option<&Change> {
        let index = self
            .changes
            .partition_point(|change| change.new_start <= position);
        index.checked_sub(1).map(|index| &self.changes[index])
    }

    /// Lookup for the live top of an edit stack. With this backing store
    /// the containing-or-preceding answer is already unique, so this is
    /// the same lookup as [`find_change_for_new_position`](Self::find_change_for_new_position).
    pub fn change_for_new_position(&self, position: Point) -> Option<&Change> {
        self.find_change_for_new_position(position)
    }

    /// The first change whose new range ends strictly after `position`.
    pub fn find_change_ending_after_new_position(&self, position: Point) -> Option<&Change> {
        let index = self
            .changes
            .partition_point(|change| change.new_end <= position);
        self.changes.get(index)
    }

    /// Record that the region of the output text starting at
    /// `new_splice_start` and spanning `old_extent` was replaced by
    /// `new_text` (spanning `new_extent`).
    ///
    /// Changes touching the replaced region, boundaries inclusive, merge
    /// into a single change; later changes are rebased into the rewritten
    /// output space. `deleted_text_size` is the size in code units of the
    /// replaced output region.
    pub fn splice(
        &mut self,
        new_splice_start: Point,
        old_extent: Point,
        new_extent: Point,
        old_text: Option<Arc<Text>>,
        new_text: Arc<Text>,
        deleted_text_size: u32,
    ) {
        let splice_old_end = new_splice_start.traverse(old_extent);

        let lo = self
            .changes
            .partition_point(|change| change.new_end < new_splice_start);
        let hi = self
            .changes
            .partition_point(|change| change.new_start <= splice_old_end);

        // Translate an output-space position lying outside every change
        // below `lo` into the input space.
        let old_position_before = |position: Point| -> Point {
            match lo.checked_sub(1).map(|index| &self.changes[index]) {
                Some(change) => change
                    .old_end
                    .traverse(position.traversal(change.new_end)),
                None => position,
            }
        };

        let mut head: Option<TextSlice> = None;
        let mut tail: Option<TextSlice> = None;
        let merged_new_start;
        let merged_old_start;
        let merged_old_end;
        let pre_splice_new_end;
        let mut merged_old_text_size = deleted_text_size;
        let merged_old_text;

        if lo < hi {
            let first = &self.changes[lo];
            if first.new_start < new_splice_start {
                merged_new_start = first.new_start;
                merged_old_start = first.old_start;
                head = Some(
                    TextSlice::new(first.new_text.clone())
                        .prefix(new_splice_start.traversal(first.new_start)),
                );
            } else {
                merged_new_start = new_splice_start;
                merged_old_start = old_position_before(new_splice_start);
            }

            let last = &self.changes[hi - 1];
            if last.new_end > splice_old_end {
                merged_old_end = last.old_end;
                pre_splice_new_end = last.new_end;
                tail = Some(
                    TextSlice::new(last.new_text.clone())
                        .suffix(splice_old_end.traversal(last.new_start)),
                );
            } else {
                merged_old_end = last
                    .old_end
                    .traverse(splice_old_end.traversal(last.new_end));
                pre_splice_new_end = splice_old_end;
            }

            let mut overlapping_new_text_size = 0;
            for change in &self.changes[lo..hi] {
                merged_old_text_size += change.old_text_size;
                overlapping_new_text_size += change.new_text.size();
            }
            overlapping_new_text_size -= head.as_ref().map_or(0, TextSlice::size);
            overlapping_new_text_size -= tail.as_ref().map_or(0, TextSlice::size);
            merged_old_text_size -= overlapping_new_text_size;
            merged_old_text = None;
        } else {
            merged_new_start = new_splice_start;
            merged_old_start = old_position_before(new_splice_start);
            merged_old_end = old_position_before(splice_old_end);
            pre_splice_new_end = splice_old_end;
            merged_old_text = old_text;
        }

        let merged_new_text = match (&head, &tail) {
            (None, None) => new_text,
            _ => {
                let mut combined = Text::new();
                if let Some(head) = &head {
                    combined.append(head);
                }
                combined.append(&TextSlice::new(new_text));
                if let Some(tail) = &tail {
                    combined.append(tail);
                }
                Arc::new(combined)
            }
        };
        let merged_new_end = merged_new_start.traverse(merged_new_text.extent());

        let is_noop = merged_old_start == merged_old_end
            && merged_new_text.is_empty()
            && merged_old_text_size == 0;
        let merged = if is_noop {
            None
        } else {
            Some(Change {
                old_start: merged_old_start,
                old_end: merged_old_end,
                new_start: merged_new_start,
                new_end: merged_new_end,
                old_text: merged_old_text,
                new_text: merged_new_text,
                old_text_size: merged_old_text_size,
                preceding_old_text_size: 0,
                preceding_new_text_size: 0,
            })
        };

        self.changes.splice(lo..hi, merged);

        let rebase_from = if is_noop { lo } else { lo + 1 };
        for change in &mut self.changes[rebase_from..] {
            change.new_start = merged_new_end.traverse(change.new_start.traversal(pre_splice_new_end));
            change.new_end = merged_new_end.traverse(change.new_end.traversal(pre_splice_new_end));
        }

        self.rebuild_running_sizes(lo);
    }

    fn rebuild_running_sizes(&mut self, from: usize) {
        let (mut old_sum, mut new_sum) = match from.checked_sub(1).map(|index| &self.changes[index])
        {
            Some(change) => (
                change.preceding_old_text_size + change.old_text_size,
                change.preceding_new_text_size + change.new_text.size(),
            ),
            None => (0, 0),
        };
        for change in &mut self.changes[from..] {
            change.preceding_old_text_size = old_sum;
            change.preceding_new_text_size = new_sum;
            old_sum += change.old_text_size;
            new_sum += change.new_text.size();
        }
    }

    /// Fold `other`'s changes into `self`, where `self` is applied first
    /// and `other` to its output.
    ///
    /// Both directions compute the same composition; they differ in which
    /// end of `other` they walk from and which of its coordinate spaces
    /// they splice with. Walking forward, earlier splices have already
    /// rewritten this patch's output space to agree with `other`'s new
    /// coordinates; walking backward, positions below each splice are
    /// still untouched, so `other`'s old coordinates apply directly.
    pub fn combine(&mut self, other: &Patch, left_to_right: bool) {
        if left_to_right {
            for change in other.get_changes() {
                self.splice(
                    change.new_start,
                    change.old_extent(),
                    change.new_extent(),
                    change.old_text.clone(),
                    change.new_text.clone(),
                    change.old_text_size,
                );
            }
        } else {
            for change in other.get_changes().iter().rev() {
                self.splice(
                    change.old_start,
                    change.old_extent(),
                    change.new_extent(),
                    change.old_text.clone(),
                    change.new_text.clone(),
                    change.old_text_size,
                );
            }
        }
    }

    pub fn serialize(&self, sink: &mut Vec<u8>) {
        wire::put_u32(sink, self.changes.len() as u32);
        for change in &self.changes {
            wire::put_point(sink, change.old_start);
            wire::put_point(sink, change.old_end);
            wire::put_point(sink, change.new_start);
            wire::put_point(sink, change.new_end);
            wire::put_u32(sink, change.old_text_size);
            match &change.old_text {
                Some(old_text) => {
                    sink.push(1);
                    wire::put_text(sink, old_text);
                }
                None => sink.push(0),
            }
            wire::put_text(sink, &change.new_text);
        }
    }

    pub fn deserialize(source: &mut &[u8]) -> Option<Patch> {
        let change_count = wire::get_u32(source)?;
        let mut patch = Patch::new();
        for _ in 0..change_count {
            let old_start = wire::get_point(source)?;
            let old_end = wire::get_point(source)?;
            let new_start = wire::get_point(source)?;
            let new_end = wire::get_point(source)?;
            let old_text_size = wire::get_u32(source)?;
            let (&old_text_flag, rest) = source.split_first()?;
            *source = rest;
            let old_text = if old_text_flag == 0 {
                None
            } else {
                Some(Arc::new(wire::get_text(source)?))
            };
            let new_text = Arc::new(wire::get_text(source)?);

            if let Some(previous) = patch.changes.last() {
                if new_start < previous.new_end || old_start < previous.old_end {
                    return None;
                }
            }
            patch.changes.push(Change {
                old_start,
                old_end,
                new_start,
                new_end,
                old_text,
                new_text,
                old_text_size,
                preceding_old_text_size: 0,
                preceding_new_text_size: 0,
            });
        }
        patch.rebuild_running_sizes(0);
        Some(patch)
    }

    pub fn get_dot_graph(&self) -> String {
        use std::fmt::Write as _;

        let mut result = String::from("digraph patch {\n");
        for (index, change) in self.changes.iter().enumerate() {
            let _ = writeln!(
                result,
                "  change_{index} [label=\"old: ({},{})-({},{}) new: ({},{})-({},{}) text: {:?}\"];",
                change.old_start.row,
                change.old_start.column,
                change.old_end.row,
                change.old_end.column,
                change.new_start.row,
                change.new_start.column,
                change.new_end.row,
                change.new_end.column,
                change.new_text.to_string(),
            );
        }
        result.push_str("}\n");
        result
    }
}
