//! Little-endian byte framing for persisted patches.

use text::{Point, Text};

pub fn put_u16(sink: &mut Vec<u8>, value: u16) {
    sink.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u32(sink: &mut Vec<u8>, value: u32) {
    sink.extend_from_slice(&value.to_le_bytes());
}

pub fn get_u16(source: &mut &[u8]) -> Option<u16> {
    let (bytes, rest) = source.split_first_chunk::<2>()?;
    *source = rest;
    Some(u16::from_le_bytes(*bytes))
}

pub fn get_u32(source: &mut &[u8]) -> Option<u32> {
    let (bytes, rest) = source.split_first_chunk::<4>()?;
    *source = rest;
    Some(u32::from_le_bytes(*bytes))
}

pub fn put_point(sink: &mut Vec<u8>, point: Point) {
    put_u32(sink, point.row);
    put_u32(sink, point.column);
}

pub fn get_point(source: &mut &[u8]) -> Option<Point> {
    let row = get_u32(source)?;
    let column = get_u32(source)?;
    Some(Point::new(row, column))
}

pub fn put_text(sink: &mut Vec<u8>, text: &Text) {
    put_u32(sink, text.size());
    for unit in text.iter() {
        put_u16(sink, unit);
    }
}

pub fn get_text(source: &mut &[u8]) -> Option<Text> {
    let size = get_u32(source)? as usize;
    if source.len() < size.checked_mul(2)? {
        return None;
    }
    let mut units = Vec::with_capacity(size);
    for _ in 0..size {
        units.push(get_u16(source)?);
    }
    Some(Text::from_units(units))
}
