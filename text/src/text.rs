//! UTF-16 code-unit storage with a per-line offset index.
//!
//! Lines are split at `'\n'` only. A lone `'\r'` is an ordinary character;
//! a `"\r\n"` pair is a single two-unit line ending that
//! [`clip_position`](Text::clip_position) refuses to bisect.

use crate::{ClipResult, Point, Range};
use std::fmt::{self, Write as _};
use std::sync::Arc;

const LF: u16 = b'\n' as u16;
const CR: u16 = b'\r' as u16;

pub fn is_high_surrogate(unit: u16) -> bool {
    (unit & 0xfc00) == 0xd800
}

pub fn is_low_surrogate(unit: u16) -> bool {
    (0xdc00..=0xdfff).contains(&unit)
}

/// An owned sequence of UTF-16 code units.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Text {
    content: Vec<u16>,
    line_offsets: Vec<u32>,
}

impl Text {
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
            line_offsets: vec![0],
        }
    }

    pub fn from_units(content: Vec<u16>) -> Self {
        let line_offsets = Self::index_lines(&content);
        Self {
            content,
            line_offsets,
        }
    }

    fn index_lines(content: &[u16]) -> Vec<u32> {
        let mut line_offsets = vec![0];
        for (offset, &unit) in content.iter().enumerate() {
            if unit == LF {
                line_offsets.push(offset as u32 + 1);
            }
        }
        line_offsets
    }

    pub fn size(&self) -> u32 {
        self.content.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn extent(&self) -> Point {
        let last_row = self.line_offsets.len() as u32 - 1;
        let last_start = *self.line_offsets.last().unwrap();
        Point::new(last_row, self.size() - last_start)
    }

    pub fn units(&self) -> &[u16] {
        &self.content
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.content.iter().copied()
    }

    pub fn first(&self) -> Option<u16> {
        self.content.first().copied()
    }

    pub fn last(&self) -> Option<u16> {
        self.content.last().copied()
    }

    fn line_start(&self, row: u32) -> u32 {
        self.line_offsets[row as usize]
    }

    /// Offset of the end of `row`'s content, excluding its line ending
    /// (the `'\n'`, or both units of a `"\r\n"`).
    fn line_content_end(&self, row: u32) -> u32 {
        if row as usize == self.line_offsets.len() - 1 {
            return self.size();
        }
        let newline = self.line_offsets[row as usize + 1] - 1;
        if newline > self.line_start(row) && self.content[newline as usize - 1] == CR {
            newline - 1
        } else {
            newline
        }
    }

    pub fn line_length_for_row(&self, row: u32) -> u32 {
        self.clip_position(Point::new(row, u32::MAX)).position.column
    }

    /// Snap `position` onto a valid code-unit boundary.
    ///
    /// The row clamps to the last row and the column to that row's content
    /// length; a position between the halves of a surrogate pair snaps
    /// backward onto the high surrogate.
    pub fn clip_position(&self, position: Point) -> ClipResult {
        let last_row = self.line_offsets.len() as u32 - 1;
        let row = position.row.min(last_row);
        let line_start = self.line_start(row);
        let line_length = self.line_content_end(row) - line_start;
        let mut column = position.column.min(line_length);
        let mut offset = line_start + column;

        if offset > 0
            && (offset as usize) < self.content.len()
            && is_low_surrogate(self.content[offset as usize])
            && is_high_surrogate(self.content[offset as usize - 1])
        {
            offset -= 1;
            column -= 1;
        }

        ClipResult::new(Point::new(row, column), offset)
    }

    pub fn position_for_offset(&self, offset: u32) -> Point {
        let offset = offset.min(self.size());
        let row = self.line_offsets.partition_point(|&start| start <= offset) - 1;
        Point::new(row as u32, offset - self.line_offsets[row])
    }

    /// The code unit at the clipped `position`.
    ///
    /// Panics if the clipped position is the end of the text.
    pub fn at(&self, position: Point) -> u16 {
        self.content[self.clip_position(position).offset as usize]
    }

    /// Replace the range starting at `start` spanning `deleted_extent`
    /// with `inserted`.
    pub fn splice(&mut self, start: Point, deleted_extent: Point, inserted: &Text) {
        let start_offset = self.clip_position(start).offset as usize;
        let end_offset = self
            .clip_position(start.traverse(deleted_extent))
            .offset as usize;
        self.content
            .splice(start_offset..end_offset, inserted.content.iter().copied());
        self.line_offsets = Self::index_lines(&self.content);
    }

    pub fn append(&mut self, slice: &TextSlice) {
        let base = self.content.len() as u32;
        let units = slice.units();
        self.content.extend_from_slice(units);
        for (index, &unit) in units.iter().enumerate() {
            if unit == LF {
                self.line_offsets.push(base + index as u32 + 1);
            }
        }
    }
}

impl From<&str> for Text {
    fn from(value: &str) -> Self {
        Self::from_units(value.encode_utf16().collect())
    }
}

impl From<&String> for Text {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for decoded in char::decode_utf16(self.iter()) {
            f.write_char(decoded.unwrap_or(char::REPLACEMENT_CHARACTER))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Text({:?})", self.to_string())
    }
}

impl PartialEq<&str> for Text {
    fn eq(&self, other: &&str) -> bool {
        self.iter().eq(other.encode_utf16())
    }
}

/// A window into a [`Text`], holding a shared handle to the text so the
/// view stays valid for as long as the slice is kept.
#[derive(Clone)]
pub struct TextSlice {
    text: Arc<Text>,
    start: ClipResult,
    end: ClipResult,
}

impl TextSlice {
    pub fn new(text: Arc<Text>) -> Self {
        let end = ClipResult::new(text.extent(), text.size());
        Self {
            text,
            start: ClipResult::default(),
            end,
        }
    }

    /// Clip a position given relative to the slice start, clamping the
    /// result into the slice bounds.
    fn clip_relative(&self, position: Point) -> ClipResult {
        let absolute = self
            .text
            .clip_position(self.start.position.traverse(position));
        if absolute.offset <= self.start.offset {
            self.start
        } else if absolute.offset >= self.end.offset {
            self.end
        } else {
            absolute
        }
    }

    /// The sub-slice covering `range`, relative to the slice start.
    pub fn slice(&self, range: Range) -> TextSlice {
        TextSlice {
            text: self.text.clone(),
            start: self.clip_relative(range.start),
            end: self.clip_relative(range.end),
        }
    }

    /// The head of the slice spanning `extent`. The start is unchanged, so
    /// positions relative to the original start remain meaningful.
    pub fn prefix(&self, extent: Point) -> TextSlice {
        TextSlice {
            text: self.text.clone(),
            start: self.start,
            end: self.clip_relative(extent),
        }
    }

    /// The tail of the slice beginning at `start` (relative to the
    /// original slice start).
    pub fn suffix(&self, start: Point) -> TextSlice {
        TextSlice {
            text: self.text.clone(),
            start: self.clip_relative(start),
            end: self.end,
        }
    }

    pub fn size(&self) -> u32 {
        self.end.offset - self.start.offset
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn extent(&self) -> Point {
        self.end.position.traversal(self.start.position)
    }

    pub fn units(&self) -> &[u16] {
        &self.text.units()[self.start.offset as usize..self.end.offset as usize]
    }

    pub fn first(&self) -> Option<u16> {
        self.units().first().copied()
    }

    pub fn last(&self) -> Option<u16> {
        self.units().last().copied()
    }

    pub fn position_for_offset(&self, offset: u32) -> Point {
        let absolute = self
            .text
            .position_for_offset(self.start.offset + offset.min(self.size()));
        absolute.traversal(self.start.position)
    }
}

impl From<Arc<Text>> for TextSlice {
    fn from(text: Arc<Text>) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for TextSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for decoded in char::decode_utf16(self.units().iter().copied()) {
            f.write_char(decoded.unwrap_or(char::REPLACEMENT_CHARACTER))?;
        }
        Ok(())
    }
}

impl fmt::Debug for TextSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextSlice({:?})", self.to_string())
    }
}
