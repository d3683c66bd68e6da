//! The zero-copy escape hatch.
//!
//! A buffer sent inside a payload is normally copied, structured-clone
//! style. Wrapping the value with [`wrap_transfer`] (or a bare buffer with
//! [`transferable`]) tags it with the buffers that must be *moved* instead:
//! before a tagged payload reaches a port, the engine detaches the listed
//! buffers from their source handles and re-seats the bytes on the copy
//! that travels. The sender's original reads as detached afterwards.
//!
//! The tag is a dedicated [`Value::Transfer`] variant, which cannot collide
//! with user keys by construction; [`take_transferables`] is the stripping
//! pass. Only shallow positions are scanned: the payload itself and its
//! direct children.

use crate::value::{Buffer, Value};

/// Tag a value with buffers to move when it is sent.
///
/// The value itself is returned (wrapped), so callers can compose it into a
/// payload the same way they would the untagged value.
pub fn wrap_transfer(value: impl Into<Value>, buffers: Vec<Buffer>) -> Value {
    Value::Transfer {
        value: Box::new(value.into()),
        transfer: buffers,
    }
}

/// Tag a single buffer for transfer and use it as the value.
pub fn transferable(buffer: Buffer) -> Value {
    let handle = buffer.clone();
    wrap_transfer(Value::Buffer(buffer), vec![handle])
}

/// Strip transfer tags from a payload and perform the move.
///
/// Scans the payload and its direct children. For every tag found, each
/// listed buffer is detached from its source handle; the bytes are re-seated
/// into a fresh handle wherever the payload referenced the same cell. The
/// fresh handles are returned for the delivery's transfer list.
pub fn take_transferables(payload: &mut Value) -> Vec<Buffer> {
    let mut moved = Vec::new();
    strip(payload, &mut moved);
    match payload {
        Value::Array(items) => {
            for item in items {
                strip(item, &mut moved);
            }
        }
        Value::Map(entries) => {
            for entry in entries.values_mut() {
                strip(entry, &mut moved);
            }
        }
        _ => {}
    }
    moved
}

fn strip(slot: &mut Value, moved: &mut Vec<Buffer>) {
    if !matches!(slot, Value::Transfer { .. }) {
        return;
    }
    let Value::Transfer { value, transfer } = std::mem::take(slot) else {
        unreachable!()
    };
    let mut inner = *value;
    for source in transfer {
        let fresh = Buffer::adopt(source.detach());
        reseat(&mut inner, &source, &fresh);
        moved.push(fresh);
    }
    *slot = inner;
}

/// Replace shallow occurrences of `source`'s cell with the moved handle.
fn reseat(value: &mut Value, source: &Buffer, fresh: &Buffer) {
    let swap = |v: &mut Value| {
        if let Value::Buffer(b) = v {
            if Buffer::same_cell(b, source) {
                *b = fresh.clone();
            }
        }
    };
    swap(value);
    match value {
        Value::Array(items) => items.iter_mut().for_each(swap),
        Value::Map(entries) => entries.values_mut().for_each(swap),
        _ => {}
    }
}
