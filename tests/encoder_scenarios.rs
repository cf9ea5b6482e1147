//! End-to-end encoder scenarios: width promotion, count boundaries, and
//! structural invariants checked over whole streams.

use fleece::{root, Encoder, TypedValue, Value};

/// A dict whose payload spans more than 64 KiB forces 4-byte element words,
/// and the reader still resolves every pointer.
#[test]
fn test_wide_promotion_past_64k() {
    let n = 4000;
    let mut enc = Encoder::new();
    enc.begin_dictionary_with_capacity(n).unwrap();
    for i in 0..n {
        enc.write_key(&format!("k{i:04}")).unwrap();
        // 16-byte values stay out-of-line and are never interned.
        enc.write_string(&format!("payload-{i:08}")).unwrap();
    }
    enc.end_dictionary().unwrap();
    let out = enc.finish().unwrap();
    assert!(out.len() > 0x1_0000);

    let TypedValue::Dict(dict) = root(&out).unwrap().typed().unwrap() else {
        panic!("expected dict")
    };
    assert!(dict.is_wide(), "far back-pointers require wide words");
    assert_eq!(dict.count(), n);
    assert_eq!(
        dict.get("k0000").unwrap().unwrap().as_str(),
        Some("payload-00000000")
    );
    assert_eq!(
        dict.get("k3999").unwrap().unwrap().as_str(),
        Some("payload-00003999")
    );
    assert!(dict.get("k4000").unwrap().is_none());
}

/// A small collection of far-away values is promoted too, even though its
/// element count is tiny.
#[test]
fn test_wide_promotion_small_collection() {
    let mut enc = Encoder::new();
    enc.begin_array().unwrap();
    // One huge binary payload pushes later pointers past the narrow range.
    enc.write_data(&vec![0xA5u8; 0x1_2000]).unwrap();
    enc.write_string("tail-string").unwrap();
    enc.end_array().unwrap();
    let out = enc.finish().unwrap();

    let TypedValue::Array(arr) = root(&out).unwrap().typed().unwrap() else {
        panic!("expected array")
    };
    assert!(arr.is_wide());
    assert_eq!(arr.count(), 2);
    assert_eq!(arr.get(0).unwrap().as_data().map(<[u8]>::len), Some(0x1_2000));
    assert_eq!(arr.get(1).unwrap().as_str(), Some("tail-string"));
}

/// 0x0FFE elements: saturated inline count, no varint extension.
#[test]
fn test_inline_count_saturates_below_varint_threshold() {
    let n = 0x0FFE;
    let mut enc = Encoder::new();
    enc.begin_array_with_capacity(n).unwrap();
    for _ in 0..n {
        enc.write_int(7).unwrap();
    }
    enc.end_array().unwrap();
    enc.end().unwrap();
    let out = enc.output();

    // Array header leads the stream; its count field is pinned at 0x7FF and
    // the first element word follows immediately.
    assert_eq!(&out[..2], [0x67, 0xFF]);
    assert_eq!(&out[2..4], [0x00, 0x07]);
}

/// 0x0FFF elements: the true count follows as a varint.
#[test]
fn test_varint_count_extension() {
    let n = 0x0FFF;
    let mut enc = Encoder::new();
    enc.begin_array_with_capacity(n).unwrap();
    for _ in 0..n {
        enc.write_int(7).unwrap();
    }
    enc.end_array().unwrap();
    let out = enc.finish().unwrap();

    // Header, then varint(0x0FFF) = [0xFF, 0x1F], then the elements.
    assert_eq!(&out[..4], [0x67, 0xFF, 0xFF, 0x1F]);

    let TypedValue::Array(arr) = root(&out).unwrap().typed().unwrap() else {
        panic!("expected array")
    };
    assert_eq!(arr.count(), n);
    assert_eq!(arr.get(n - 1).unwrap().as_i64(), Some(7));
}

/// Interned strings are shared across collections, not just within one.
#[test]
fn test_interning_spans_collections() {
    let mut enc = Encoder::new();
    enc.begin_array().unwrap();
    enc.begin_dictionary().unwrap();
    enc.write_key("shared-key").unwrap();
    enc.write_int(1).unwrap();
    enc.end_dictionary().unwrap();
    enc.begin_dictionary().unwrap();
    enc.write_key("shared-key").unwrap();
    enc.write_int(2).unwrap();
    enc.end_dictionary().unwrap();
    enc.end_array().unwrap();
    let out = enc.finish().unwrap();

    // The key payload appears exactly once in the whole stream.
    let needle: &[u8] = b"shared-key";
    let hits = out.windows(needle.len()).filter(|w| *w == needle).count();
    assert_eq!(hits, 1);

    let TypedValue::Array(arr) = root(&out).unwrap().typed().unwrap() else {
        panic!("expected array")
    };
    for (i, expected) in [1i64, 2].iter().enumerate() {
        let TypedValue::Dict(dict) = arr.get(i).unwrap().typed().unwrap() else {
            panic!("expected dict")
        };
        assert_eq!(dict.get("shared-key").unwrap().unwrap().as_i64(), Some(*expected));
    }
}

/// A root value sitting more than 64 KiB before the end of the stream is
/// written wide, with the narrow trailer pointing at the wide word.
#[test]
fn test_wide_root_trailer() {
    let n = 33_000;
    let mut enc = Encoder::new();
    enc.set_unique_strings(false);
    enc.begin_array_with_capacity(n).unwrap();
    for _ in 0..n {
        enc.write_string("ab").unwrap();
    }
    enc.end_array().unwrap();
    let out = enc.finish().unwrap();

    // Trailer is a narrow pointer to the 4-byte wide root word before it.
    assert_eq!(&out[out.len() - 2..], [0x80, 0x02]);

    let TypedValue::Array(arr) = root(&out).unwrap().typed().unwrap() else {
        panic!("expected array")
    };
    assert!(arr.is_wide());
    assert_eq!(arr.count(), n);
    assert_eq!(arr.get(0).unwrap().as_str(), Some("ab"));
    assert_eq!(arr.get(n - 1).unwrap().as_str(), Some("ab"));
}

/// Every reachable value sits at an even stream position, even when odd
/// payload lengths are mixed in.
#[test]
fn test_alignment_of_all_values() {
    let mut enc = Encoder::new();
    enc.begin_array().unwrap();
    enc.write_string("odd").unwrap();
    enc.write_string("five!").unwrap();
    enc.begin_dictionary().unwrap();
    enc.write_key("k").unwrap();
    enc.write_data(&[1, 2, 3]).unwrap();
    enc.end_dictionary().unwrap();
    enc.write_int(300).unwrap();
    enc.write_double(0.25).unwrap();
    enc.end_array().unwrap();
    let out = enc.finish().unwrap();

    fn walk(v: &Value<'_>) {
        assert_eq!(v.pos() % 2, 0, "misaligned value at {:#x}", v.pos());
        match v.typed().unwrap() {
            fleece::TypedValue::Array(arr) => {
                for item in arr.iter() {
                    walk(&item.unwrap());
                }
            }
            fleece::TypedValue::Dict(dict) => {
                for entry in dict.iter() {
                    let (k, val) = entry.unwrap();
                    walk(&k);
                    walk(&val);
                }
            }
            _ => {}
        }
    }
    walk(&root(&out).unwrap());
}

/// An encoder is reusable after `reset`, and its interning table restarts.
#[test]
fn test_reset_between_documents() {
    let mut enc = Encoder::new();
    enc.begin_array().unwrap();
    enc.write_string("doc-one-payload").unwrap();
    enc.end_array().unwrap();
    enc.end().unwrap();
    let first = enc.output().to_vec();

    enc.reset();
    enc.write_int(5).unwrap();
    enc.end().unwrap();
    assert_eq!(enc.output(), [0x00, 0x05]);

    // The first document was complete and independent.
    let TypedValue::Array(arr) = root(&first).unwrap().typed().unwrap() else {
        panic!("expected array")
    };
    assert_eq!(arr.get(0).unwrap().as_str(), Some("doc-one-payload"));
}
