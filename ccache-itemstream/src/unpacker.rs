use crate::item::{Item, RawItem};

/// One decoded element of the stream: either a successfully decoded item,
/// or a single raw byte emitted while resynchronizing (§4.7 "behavior on
/// garbage" — the stream is never silently truncated).
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    Item(Item),
    Raw(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Synced,
    Resyncing,
}

/// Resilient decoder for a length-delimited stream of item maps. Tolerates
/// corruption: on a decode failure it stops trusting frame boundaries and
/// scans byte-by-byte for the next position a trial decode both succeeds
/// and satisfies a caller-supplied validator.
///
/// `V` is typically "does this look like a real item" (e.g. a plausible
/// path and mode); the default validator used by `ccache-core`'s sync path
/// just checks the path is non-empty, since `RawItem` decoding already
/// enforces the map shape itself.
pub struct ItemUnpacker<V> {
    buffer: Vec<u8>,
    state: State,
    validator: V,
}

impl<V> ItemUnpacker<V>
where
    V: Fn(&Item) -> bool,
{
    pub fn new(validator: V) -> Self {
        ItemUnpacker {
            buffer: Vec::new(),
            state: State::Synced,
            validator,
        }
    }

    /// Appends more input. Does not decode eagerly; call `next_event`
    /// (or iterate) to pull decoded output.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Forces the decoder into the resynchronizing state, e.g. after the
    /// caller already knows a chunk was skipped or missing.
    pub fn resync(&mut self) {
        self.state = State::Resyncing;
    }

    pub fn is_resyncing(&self) -> bool {
        self.state == State::Resyncing
    }

    /// Pulls the next event out of the buffered input, or `None` if more
    /// input is needed.
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        if self.buffer.is_empty() {
            return None;
        }

        match self.state {
            State::Synced => match try_decode_item(&self.buffer) {
                Ok((item, consumed)) => {
                    self.buffer.drain(0..consumed);
                    Some(StreamEvent::Item(item))
                }
                Err(_) => {
                    log::warn!("item stream decode failed, resynchronizing");
                    self.state = State::Resyncing;
                    self.next_event()
                }
            },
            State::Resyncing => match try_decode_item(&self.buffer) {
                Ok((item, consumed)) if (self.validator)(&item) => {
                    self.buffer.drain(0..consumed);
                    self.state = State::Synced;
                    log::debug!("item stream resynchronized at {:?}", item.path);
                    Some(StreamEvent::Item(item))
                }
                _ => {
                    let byte = self.buffer.remove(0);
                    Some(StreamEvent::Raw(byte))
                }
            },
        }
    }
}

impl<V> Iterator for ItemUnpacker<V>
where
    V: Fn(&Item) -> bool,
{
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        self.next_event()
    }
}

/// A validator requiring nothing beyond successful decode — used when the
/// caller has no extra shape checks beyond "this parses as an item map".
pub fn always_valid(_item: &Item) -> bool {
    true
}

fn try_decode_item(buf: &[u8]) -> Result<(Item, usize), anyhow::Error> {
    let mut cursor = std::io::Cursor::new(buf);
    let raw: RawItem = rmp_serde::from_read(&mut cursor)?;
    let consumed = cursor.position() as usize;
    let item = Item::try_from(raw)?;
    if item.path.is_empty() {
        anyhow::bail!("item has empty path");
    }
    Ok((item, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use std::collections::BTreeMap;

    fn pack(item: &Item) -> Vec<u8> {
        let raw = crate::item::RawItem::from(item);
        let mut buf = Vec::new();
        let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        serde::Serialize::serialize(&raw, &mut serializer).unwrap();
        buf
    }

    fn dir_item(path: &str) -> Item {
        Item {
            path: path.to_string(),
            mode: libc::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            mtime_ns: 0,
            xattrs: BTreeMap::new(),
            kind: ItemKind::Directory,
        }
    }

    #[test]
    fn test_decodes_consecutive_items() {
        let foo = dir_item("foo");
        let bar = dir_item("bar");
        let mut stream = pack(&foo);
        stream.extend(pack(&bar));

        let mut unpacker = ItemUnpacker::new(always_valid);
        unpacker.feed(&stream);

        assert_eq!(unpacker.next_event(), Some(StreamEvent::Item(foo)));
        assert_eq!(unpacker.next_event(), Some(StreamEvent::Item(bar)));
        assert_eq!(unpacker.next_event(), None);
    }

    #[test]
    fn test_resyncs_after_garbage_run() {
        // pack(foo) + pack(bar) + garbage + pack(boo) + pack(baz)
        let foo = dir_item("foo");
        let bar = dir_item("bar");
        let boo = dir_item("boo");
        let baz = dir_item("baz");
        let garbage = b"garbage";

        let mut stream = pack(&foo);
        stream.extend(pack(&bar));
        stream.extend_from_slice(garbage);
        stream.extend(pack(&boo));
        stream.extend(pack(&baz));

        let mut unpacker = ItemUnpacker::new(always_valid);
        unpacker.feed(&stream);

        let mut items = Vec::new();
        let mut raw_bytes = Vec::new();
        while let Some(event) = unpacker.next_event() {
            match event {
                StreamEvent::Item(item) => items.push(item),
                StreamEvent::Raw(byte) => raw_bytes.push(byte),
            }
        }

        assert_eq!(items, vec![foo, bar, boo, baz]);
        assert_eq!(raw_bytes, garbage.to_vec());
    }

    #[test]
    fn test_external_resync_call() {
        let foo = dir_item("foo");
        let mut unpacker = ItemUnpacker::new(always_valid);
        unpacker.feed(&pack(&foo));
        unpacker.resync();
        assert!(unpacker.is_resyncing());
        assert_eq!(unpacker.next_event(), Some(StreamEvent::Item(foo)));
        assert!(!unpacker.is_resyncing());
    }
}
