//! Canonical JSON encoding
//!
//! Object keys are written in byte order and no insignificant whitespace is
//! emitted, so identical content always produces identical bytes. This holds
//! whether or not `serde_json`'s `preserve_order` feature is active somewhere
//! in the dependency graph.

use serde_json::Value;

/// Canonical encoding of `value` as a string
#[must_use]
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::with_capacity(256);
    write_canonical(value, &mut out);
    out
}

/// Canonical encoding of `value` as bytes
#[inline]
#[must_use]
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(value).into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Display for scalar values is already compact JSON
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        assert_eq!(canonical_string(&value), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonical_string(&value), "[3,1,2]");
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_string(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn parsed_text_with_whitespace_matches() {
        let a: Value = serde_json::from_str("{ \"x\" : 1 ,\n \"y\": [ true ] }").unwrap();
        let b: Value = serde_json::from_str(r#"{"y":[true],"x":1}"#).unwrap();
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }
}
