//! Streaming encoder producing the Fleece wire format.
//!
//! The encoder appends values to an in-memory stream. Composite values hold
//! relative back-pointers to data written earlier, so a collection is built
//! as a stack frame of value words and emitted when it closes: dictionary
//! entries are sorted by key, element width is selected (narrow words can
//! only reach 64 KiB back), pointers are fixed up from absolute offsets to
//! relative ones, and the parent frame receives a single word referring to
//! the new collection.
//!
//! # Example
//!
//! ```
//! use fleece::{Encoder, TypedValue};
//!
//! let mut enc = Encoder::new();
//! enc.begin_dictionary().unwrap();
//! enc.write_key("greeting").unwrap();
//! enc.write_string("hello").unwrap();
//! enc.end_dictionary().unwrap();
//! let bytes = enc.finish().unwrap();
//!
//! let root = fleece::root(&bytes).unwrap();
//! let TypedValue::Dict(dict) = root.typed().unwrap() else {
//!     panic!("expected dict")
//! };
//! let greeting = dict.get("greeting").unwrap().unwrap();
//! assert_eq!(greeting.as_str(), Some("hello"));
//! ```

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::strings::{Slot, StringInfo, StringTable};
use crate::tag::{self, Tag};
use crate::varint::{put_int_of_length, put_uvarint, MAX_VARINT_LEN};
use crate::writer::Writer;

/// Largest element count representable in a collection header word.
const MAX_INLINE_COUNT: u32 = 0x07FF;
/// Count at which a varint extension follows the header word.
const VARINT_COUNT: u32 = 0x0FFF;

/// One element word of an open collection.
#[derive(Debug, Clone, Copy)]
enum Item {
    /// An inline value word, emitted as its first 2 or 4 bytes.
    Inline([u8; 4]),
    /// A pointer recorded as the absolute target offset; converted to a
    /// relative offset when the collection closes.
    Pointer(u32),
}

/// An open array or dictionary being built.
#[derive(Debug)]
struct Frame {
    tag: Tag,
    items: Vec<Item>,
    /// Key bytes in write order, recorded for the closing sort (dicts only).
    keys: Vec<SmallVec<[u8; 16]>>,
    /// Do any element words need the 4-byte form?
    wide: bool,
    /// The next item to add is this dict's key.
    writing_key: bool,
    /// A key must be written before any value.
    blocked_on_key: bool,
}

impl Frame {
    fn new(tag: Tag, reserve: usize) -> Self {
        Self {
            tag,
            items: Vec::with_capacity(reserve),
            keys: Vec::new(),
            wide: false,
            writing_key: false,
            blocked_on_key: false,
        }
    }
}

/// Streaming producer of the wire format.
///
/// Values are appended with the `write_*` methods; collections are bracketed
/// by `begin_*`/`end_*`. A finished document is obtained with
/// [`finish`](Encoder::finish) (or [`end`](Encoder::end) +
/// [`output`](Encoder::output)); the final two bytes of the stream are
/// always a narrow value word pointing at (or being) the document root.
///
/// Any error leaves the encoder unusable until [`reset`](Encoder::reset):
/// subsequent operations return the original error.
pub struct Encoder {
    out: Writer,
    stack: Vec<Frame>,
    strings: StringTable,
    unique_strings: bool,
    sort_keys: bool,
    poisoned: Option<Error>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Create an encoder with interning and key sorting enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: Writer::new(),
            // The bottom frame holds the single top-level value.
            stack: vec![Frame::new(Tag::Special, 1)],
            strings: StringTable::with_capacity(100),
            unique_strings: true,
            sort_keys: true,
            poisoned: None,
        }
    }

    /// Enable or disable string interning (default on).
    pub fn set_unique_strings(&mut self, on: bool) {
        self.unique_strings = on;
    }

    /// Enable or disable dictionary key sorting (default on).
    pub fn set_sort_keys(&mut self, on: bool) {
        self.sort_keys = on;
    }

    // --- State ---

    fn check_ready(&mut self) -> Result<()> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        if self.stack.is_empty() {
            // `end` has already run; nothing more may be written.
            return self.fail(Error::Unbalanced);
        }
        Ok(())
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.poisoned = Some(e.clone());
        Err(e)
    }

    fn top(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("encoder has an open frame")
    }

    fn top_ref(&self) -> &Frame {
        self.stack.last().expect("encoder has an open frame")
    }

    /// Position of the next write, padding the stream to an even offset.
    fn next_write_pos(&mut self) -> usize {
        if self.out.len() & 1 == 1 {
            self.out.write(&[0]);
        }
        self.out.len()
    }

    fn add_item(&mut self, item: Item, wide: bool) -> Result<()> {
        if self.top_ref().blocked_on_key {
            return self.fail(Error::NeedKey);
        }
        let frame = self.top();
        if frame.writing_key {
            frame.writing_key = false;
        } else if frame.tag == Tag::Dict {
            // This item completes a pair; the next one must be a key.
            frame.blocked_on_key = true;
            frame.writing_key = true;
        }
        frame.items.push(item);
        if wide {
            frame.wide = true;
        }
        Ok(())
    }

    /// Append one value: inline if it fits in a word, else out-of-line with
    /// a pointer word in the enclosing collection.
    fn write_value(&mut self, t: Tag, buf: &mut [u8], can_inline: bool) -> Result<()> {
        buf[0] |= (t as u8) << 4;
        let size = buf.len();
        if can_inline && size <= tag::WIDE {
            let mut word = [0u8; 4];
            word[..size].copy_from_slice(buf);
            self.add_item(Item::Inline(word), size > tag::NARROW)
        } else {
            let pos = self.next_write_pos();
            self.add_item(Item::Pointer(pos as u32), false)?;
            self.out.write(buf);
            Ok(())
        }
    }

    // --- Scalars ---

    /// Append a null value.
    pub fn write_null(&mut self) -> Result<()> {
        self.check_ready()?;
        self.add_item(Item::Inline(special_word(tag::SPECIAL_NULL)), false)
    }

    /// Append a boolean value.
    pub fn write_bool(&mut self, b: bool) -> Result<()> {
        self.check_ready()?;
        let nibble = if b { tag::SPECIAL_TRUE } else { tag::SPECIAL_FALSE };
        self.add_item(Item::Inline(special_word(nibble)), false)
    }

    /// Append a signed integer.
    pub fn write_int(&mut self, i: i64) -> Result<()> {
        self.check_ready()?;
        self.write_int_inner(i as u64, (-2048..2048).contains(&i), false)
    }

    /// Append an unsigned integer.
    pub fn write_uint(&mut self, i: u64) -> Result<()> {
        self.check_ready()?;
        self.write_int_inner(i, i < 2048, true)
    }

    fn write_int_inner(&mut self, i: u64, small: bool, unsigned: bool) -> Result<()> {
        if small {
            let word = [
                (Tag::ShortInt as u8) << 4 | ((i >> 8) & 0x0F) as u8,
                i as u8,
                0,
                0,
            ];
            self.add_item(Item::Inline(word), false)
        } else {
            let mut buf = [0u8; 10];
            let n = put_int_of_length(&mut buf[1..], i, unsigned);
            buf[0] = (n - 1) as u8;
            if unsigned {
                buf[0] |= tag::INT_UNSIGNED;
            }
            let mut size = n + 1;
            if size & 1 == 1 {
                size += 1; // pad to even; buf is zeroed
            }
            self.write_value(Tag::Int, &mut buf[..size], true)
        }
    }

    /// Append a double value. Values equal to their integer truncation are
    /// canonicalized to the integer encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for NaN.
    pub fn write_double(&mut self, n: f64) -> Result<()> {
        self.check_ready()?;
        if n.is_nan() {
            return self.fail(Error::InvalidValue);
        }
        // `i64::MAX as f64` rounds up to 2^63, so this is [-2^63, 2^63).
        if n.is_finite() && n == n.trunc() && n >= i64::MIN as f64 && n < i64::MAX as f64 {
            return self.write_int(n as i64);
        }
        let mut buf = [0u8; 10];
        buf[0] = tag::FLOAT_DOUBLE;
        buf[2..10].copy_from_slice(&n.to_le_bytes());
        self.write_value(Tag::Float, &mut buf, true)
    }

    /// Append a single-precision float value, canonicalized like
    /// [`write_double`](Encoder::write_double).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for NaN.
    pub fn write_float(&mut self, n: f32) -> Result<()> {
        self.check_ready()?;
        if n.is_nan() {
            return self.fail(Error::InvalidValue);
        }
        if n.is_finite() && n == n.trunc() && n >= i32::MIN as f32 && n < i32::MAX as f32 {
            return self.write_int(i64::from(n as i32));
        }
        let mut buf = [0u8; 6];
        buf[2..6].copy_from_slice(&n.to_le_bytes());
        self.write_value(Tag::Float, &mut buf, true)
    }

    // --- Strings and binary data ---

    /// Append a string value, interned where policy allows.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.check_ready()?;
        self.write_string_inner(s.as_bytes(), false)
    }

    /// Append a binary value. Binary payloads are never interned.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_ready()?;
        self.write_data_inner(Tag::Binary, data)
    }

    fn write_string_inner(&mut self, s: &[u8], as_key: bool) -> Result<()> {
        let sharable = (tag::NARROW..=tag::MAX_SHARED_STRING_SIZE).contains(&s.len());
        if self.unique_strings && sharable {
            match self.strings.find(s) {
                Slot::Found(i) => {
                    let info = self.strings.info_mut(i);
                    info.used_as_key |= as_key;
                    let offset = info.offset;
                    self.add_item(Item::Pointer(offset), false)
                }
                Slot::Vacant(_) => {
                    let offset = self.next_write_pos() as u32;
                    self.write_data_inner(Tag::String, s)?;
                    // Re-probe: the vacant slot predates the NeedKey check
                    // in add_item, and a poisoned encoder must not intern.
                    let slot = self.strings.find(s);
                    self.strings.add_at(
                        slot,
                        s,
                        StringInfo {
                            offset,
                            used_as_key: as_key,
                        },
                    );
                    Ok(())
                }
            }
        } else {
            self.write_data_inner(Tag::String, s)
        }
    }

    fn write_data_inner(&mut self, t: Tag, s: &[u8]) -> Result<()> {
        let mut buf = [0u8; 1 + MAX_VARINT_LEN];
        buf[0] = s.len().min(0x0F) as u8;
        if s.len() < tag::NARROW {
            // Tiny payloads fit inside the value word.
            buf[1..=s.len()].copy_from_slice(s);
            self.write_value(t, &mut buf[..=s.len()], true)
        } else {
            let mut len = 1;
            if s.len() >= 0x0F {
                len += put_uvarint(&mut buf[1..], s.len() as u64);
            }
            self.write_value(t, &mut buf[..len], false)?;
            self.out.write(s);
            Ok(())
        }
    }

    // --- Arrays and dictionaries ---

    /// Open an array.
    pub fn begin_array(&mut self) -> Result<()> {
        self.begin_array_with_capacity(0)
    }

    /// Open an array, reserving room for `reserve` elements.
    pub fn begin_array_with_capacity(&mut self, reserve: usize) -> Result<()> {
        self.check_ready()?;
        self.push(Tag::Array, reserve)
    }

    /// Open a dictionary.
    pub fn begin_dictionary(&mut self) -> Result<()> {
        self.begin_dictionary_with_capacity(0)
    }

    /// Open a dictionary, reserving room for `reserve` entries.
    pub fn begin_dictionary_with_capacity(&mut self, reserve: usize) -> Result<()> {
        self.check_ready()?;
        self.push(Tag::Dict, 2 * reserve)?;
        let frame = self.top();
        frame.writing_key = true;
        frame.blocked_on_key = true;
        Ok(())
    }

    fn push(&mut self, t: Tag, reserve: usize) -> Result<()> {
        // A collection is itself a value of the enclosing frame.
        if self.top_ref().blocked_on_key {
            return self.fail(Error::NeedKey);
        }
        self.stack.push(Frame::new(t, reserve));
        Ok(())
    }

    /// Declare the key for the next dictionary entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoKeyHere`] outside a dictionary or when a value is
    /// expected instead.
    pub fn write_key(&mut self, key: &str) -> Result<()> {
        self.check_ready()?;
        if !self.top_ref().blocked_on_key {
            return self.fail(Error::NoKeyHere);
        }
        self.top().blocked_on_key = false;
        self.write_string_inner(key.as_bytes(), true)?;
        if self.sort_keys {
            self.top().keys.push(SmallVec::from_slice(key.as_bytes()));
        }
        Ok(())
    }

    /// Close the current array.
    pub fn end_array(&mut self) -> Result<()> {
        self.check_ready()?;
        self.end_collection(Tag::Array)
    }

    /// Close the current dictionary.
    pub fn end_dictionary(&mut self) -> Result<()> {
        self.check_ready()?;
        if !self.top_ref().writing_key {
            // A key was written without its value.
            return self.fail(Error::Unbalanced);
        }
        self.end_collection(Tag::Dict)
    }

    fn end_collection(&mut self, t: Tag) -> Result<()> {
        if self.top_ref().tag != t {
            return self.fail(Error::Unbalanced);
        }
        let mut frame = self.stack.pop().expect("encoder has an open frame");
        if self.sort_keys && t == Tag::Dict {
            sort_dict(&mut frame);
        }
        self.check_pointer_widths(&mut frame);

        let mut count = frame.items.len() as u32;
        if t == Tag::Dict {
            count /= 2;
        }

        // Header word: 11-bit inline count, wide flag, varint extension for
        // large counts, padded to even length.
        let mut buf = [0u8; 2 + MAX_VARINT_LEN];
        let inline_count = count.min(MAX_INLINE_COUNT);
        buf[0] = (inline_count >> 8) as u8;
        buf[1] = inline_count as u8;
        let mut len = 2;
        if count >= VARINT_COUNT {
            len += put_uvarint(&mut buf[2..], u64::from(count));
            if len & 1 == 1 {
                len += 1; // pad to even; buf is zeroed
            }
        }
        if frame.wide {
            buf[0] |= tag::HEADER_WIDE;
        }
        // An empty collection's header can be inlined into the parent;
        // otherwise the parent gets a pointer to it.
        self.write_value(t, &mut buf[..len], count == 0)?;

        self.fix_and_emit(&frame);
        Ok(())
    }

    /// Check whether any pointers in `frame` can't fit in a narrow word.
    /// Element width is per-collection; one far pointer makes them all wide.
    fn check_pointer_widths(&mut self, frame: &mut Frame) {
        if frame.wide {
            return;
        }
        let mut base = self.next_write_pos();
        for item in &frame.items {
            if let Item::Pointer(target) = *item {
                if base - target as usize >= 0x1_0000 {
                    frame.wide = true;
                    break;
                }
            }
            base += tag::NARROW;
        }
    }

    /// Convert absolute pointer targets to relative offsets and write the
    /// element words back-to-back.
    fn fix_and_emit(&mut self, frame: &Frame) {
        if frame.items.is_empty() {
            return;
        }
        let width = if frame.wide { tag::WIDE } else { tag::NARROW };
        let mut base = self.next_write_pos();
        let mut body = Vec::with_capacity(frame.items.len() * width);
        for item in &frame.items {
            let word = match *item {
                Item::Inline(w) => w,
                Item::Pointer(target) => {
                    debug_assert!((target as usize) < base);
                    tag::pointer_word(base - target as usize, frame.wide)
                }
            };
            body.extend_from_slice(&word[..width]);
            base += width;
        }
        self.out.write(&body);
    }

    // --- Finishing ---

    /// Finish the document, emitting the root value and trailer.
    ///
    /// The final 2 bytes of the stream are always a narrow value word that
    /// is, or points at, the document root. A second `end` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unbalanced`] if a collection is still open or more
    /// than one top-level value was written.
    pub fn end(&mut self) -> Result<()> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        if self.stack.is_empty() {
            return Ok(());
        }
        if self.stack.len() > 1 {
            return self.fail(Error::Unbalanced);
        }
        let mut frame = self.stack.pop().expect("encoder has an open frame");
        // A root further than 64 KiB back needs the wide form (and then the
        // narrow trailer pointer appended below).
        self.check_pointer_widths(&mut frame);
        match frame.items.len() {
            0 => {
                // Empty document: a null trailer, so readers always find a root.
                self.next_write_pos();
                self.out.write(&special_word(tag::SPECIAL_NULL)[..tag::NARROW]);
            }
            1 => {
                let base = self.next_write_pos();
                let word = match frame.items[0] {
                    Item::Inline(w) => w,
                    Item::Pointer(target) => {
                        tag::pointer_word(base - target as usize, frame.wide)
                    }
                };
                if frame.wide {
                    self.out.write(&word);
                    // The trailer must be narrow: append a 2-byte pointer to
                    // the 4-byte root word just written.
                    let trailer = tag::pointer_word(tag::WIDE, false);
                    self.out.write(&trailer[..tag::NARROW]);
                } else {
                    self.out.write(&word[..tag::NARROW]);
                }
            }
            _ => return self.fail(Error::Unbalanced),
        }
        Ok(())
    }

    /// Finish the document and return the encoded stream.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.end()?;
        Ok(std::mem::take(&mut self.out).into_bytes())
    }

    /// View the stream written so far (complete only after
    /// [`end`](Encoder::end)).
    #[must_use]
    pub fn output(&self) -> &[u8] {
        self.out.as_bytes()
    }

    /// Drop all in-flight state and output, keeping the encoder reusable.
    pub fn reset(&mut self) {
        self.out.reset();
        self.stack.clear();
        self.stack.push(Frame::new(Tag::Special, 1));
        self.strings.clear();
        self.poisoned = None;
    }

    /// Emit an array of every interned string that was used as a key;
    /// other table slots become nulls. Slot order is an implementation
    /// detail of the interning table, so the output order is unspecified.
    pub fn write_key_table(&mut self) -> Result<()> {
        self.check_ready()?;
        // Snapshot first: writing the strings below probes the table.
        let keys: Vec<Option<Vec<u8>>> = self
            .strings
            .slots()
            .map(|slot| match slot {
                Some((bytes, info)) if info.used_as_key => Some(bytes.to_vec()),
                _ => None,
            })
            .collect();
        self.begin_array_with_capacity(keys.len())?;
        for key in &keys {
            match key {
                Some(bytes) => self.write_string_inner(bytes, false)?,
                None => self.write_null()?,
            }
        }
        self.end_array()
    }
}

fn special_word(nibble: u8) -> [u8; 4] {
    [(Tag::Special as u8) << 4 | nibble, 0, 0, 0]
}

/// Reorder a dict frame's (key, value) word pairs into ascending
/// byte-lexicographic key order.
fn sort_dict(frame: &mut Frame) {
    let n = frame.keys.len();
    if n < 2 {
        return;
    }
    debug_assert_eq!(frame.items.len(), 2 * n);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| frame.keys[a].cmp(&frame.keys[b]));
    let old = frame.items.clone();
    for (i, &j) in order.iter().enumerate() {
        frame.items[2 * i] = old[2 * j];
        frame.items[2 * i + 1] = old[2 * j + 1];
    }
}
