//! Fleece: a compact, schema-free binary encoding for JSON-equivalent
//! values that is directly addressable — any value can be read in place
//! without parsing or materialization — plus an in-memory Hash Array Mapped
//! Trie for indexing large encoded dictionaries.
//!
//! # Reading and writing
//!
//! The [`Encoder`] streams values into an in-memory byte stream; composite
//! values refer to earlier data through relative back-pointers, so identical
//! strings are stored once and dictionaries can share subtrees. The reader
//! side ([`root`], [`Value`], [`Array`], [`Dict`]) is a set of zero-copy
//! views over the encoded bytes: the final two bytes of a stream always
//! locate the document root.
//!
//! ```
//! use fleece::{Encoder, TypedValue};
//!
//! let mut enc = Encoder::new();
//! enc.begin_dictionary()?;
//! enc.write_key("id")?;
//! enc.write_int(7)?;
//! enc.write_key("tags")?;
//! enc.begin_array()?;
//! enc.write_string("fast")?;
//! enc.write_string("small")?;
//! enc.end_array()?;
//! enc.end_dictionary()?;
//! let bytes = enc.finish()?;
//!
//! let root = fleece::root(&bytes)?;
//! let TypedValue::Dict(dict) = root.typed()? else { unreachable!() };
//! assert_eq!(dict.get("id")?.unwrap().as_i64(), Some(7));
//! # Ok::<(), fleece::Error>(())
//! ```
//!
//! # Indexing
//!
//! [`Hamt`] maps hashable keys to opaque payloads (for example, offsets
//! into an encoded stream) using the same 32-bit hash convention as the
//! encoder's string interning table.

pub mod encoder;
pub mod error;
pub mod hamt;
pub mod hash;
pub mod strings;
pub mod tag;
pub mod value;
pub mod varint;
pub mod writer;

pub use encoder::Encoder;
pub use error::{Error, Result};
pub use hamt::{Hamt, HamtKey};
pub use tag::Tag;
pub use value::{root, Array, Dict, TypedValue, Value};
pub use writer::Writer;
