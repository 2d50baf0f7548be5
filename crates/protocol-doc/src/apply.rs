//! Patch engine
//!
//! Applies an ordered operation list to a working copy of a document. Either
//! every operation succeeds and the new document is returned, or the first
//! failure is reported and the caller's document is left as it was.

use crate::patch::{PatchError, PatchFailure, PatchOperation};
use crate::pointer::{get_tokens, get_tokens_mut, parse_index, DocPath, PointerError};
use serde_json::Value;

/// Apply `operations` to a copy of `document`
///
/// Deterministic: identical inputs always yield identical output.
///
/// # Errors
/// The first failing operation, with its index and reason. Nothing after it
/// runs; in particular a failing `test` stops the list.
pub fn apply(document: &Value, operations: &[PatchOperation]) -> Result<Value, PatchError> {
    let mut working = document.clone();
    for (index, op) in operations.iter().enumerate() {
        apply_operation(&mut working, op).map_err(|reason| PatchError {
            index,
            op: op.kind(),
            path: op.path().to_string(),
            reason,
        })?;
    }
    Ok(working)
}

/// Apply `operations` and swap the result into `document` on success
///
/// # Errors
/// Same as [`apply`]; `document` is untouched on error.
pub fn apply_to(document: &mut Value, operations: &[PatchOperation]) -> Result<(), PatchError> {
    *document = apply(document, operations)?;
    Ok(())
}

fn apply_operation(doc: &mut Value, op: &PatchOperation) -> Result<(), PatchFailure> {
    match op {
        PatchOperation::Add { path, value } => {
            let tokens = resolve(doc, path)?;
            add_at(doc, &tokens, value.clone())
        }
        PatchOperation::Remove { path } => {
            let tokens = resolve(doc, path)?;
            remove_at(doc, &tokens).map(drop)
        }
        PatchOperation::Replace { path, value } => {
            let tokens = resolve(doc, path)?;
            replace_at(doc, &tokens, value.clone())
        }
        PatchOperation::Move { from, path } => {
            let from_tokens = resolve(doc, from)?;
            let target_tokens = resolve(doc, path)?;
            if from_tokens == target_tokens {
                // Moving onto itself only requires the source to exist
                return get_tokens(doc, &from_tokens)
                    .map(drop)
                    .ok_or(PatchFailure::PathNotFound);
            }
            if target_tokens.len() > from_tokens.len()
                && target_tokens[..from_tokens.len()] == from_tokens[..]
            {
                return Err(PatchFailure::MoveIntoSelf);
            }
            let value = remove_at(doc, &from_tokens)?;
            // Ids in the target are resolved after the removal
            let target_tokens = resolve(doc, path)?;
            add_at(doc, &target_tokens, value)
        }
        PatchOperation::Copy { from, path } => {
            let from_tokens = resolve(doc, from)?;
            let value = get_tokens(doc, &from_tokens)
                .cloned()
                .ok_or(PatchFailure::PathNotFound)?;
            let tokens = resolve(doc, path)?;
            add_at(doc, &tokens, value)
        }
        PatchOperation::Test { path, value } => {
            let tokens = resolve(doc, path)?;
            let actual = get_tokens(doc, &tokens);
            if actual == Some(value) {
                Ok(())
            } else {
                Err(PatchFailure::TestFailed {
                    expected: value.clone(),
                    actual: actual.cloned(),
                })
            }
        }
    }
}

fn resolve(doc: &Value, path: &DocPath) -> Result<Vec<String>, PatchFailure> {
    path.resolve(doc).map_err(|e| match e {
        PointerError::NotAnArray { .. } => PatchFailure::InvalidTarget,
        _ => PatchFailure::PathNotFound,
    })
}

fn parent_of<'a>(
    doc: &'a mut Value,
    tokens: &'a [String],
) -> Result<(&'a mut Value, &'a str), PatchFailure> {
    let (last, parent_tokens) = tokens.split_last().ok_or(PatchFailure::InvalidTarget)?;
    let parent = get_tokens_mut(doc, parent_tokens).ok_or(PatchFailure::PathNotFound)?;
    Ok((parent, last.as_str()))
}

fn add_at(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), PatchFailure> {
    if tokens.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, key) = parent_of(doc, tokens)?;
    match parent {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let idx = parse_index(key).ok_or(PatchFailure::InvalidIndex)?;
            if idx > items.len() {
                return Err(PatchFailure::InvalidIndex);
            }
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(PatchFailure::InvalidTarget),
    }
}

fn remove_at(doc: &mut Value, tokens: &[String]) -> Result<Value, PatchFailure> {
    if tokens.is_empty() {
        return Err(PatchFailure::RootRemoval);
    }
    let (parent, key) = parent_of(doc, tokens)?;
    match parent {
        Value::Object(map) => map.remove(key).ok_or(PatchFailure::PathNotFound),
        Value::Array(items) => {
            let idx = parse_index(key).ok_or(PatchFailure::InvalidIndex)?;
            if idx >= items.len() {
                return Err(PatchFailure::PathNotFound);
            }
            Ok(items.remove(idx))
        }
        _ => Err(PatchFailure::InvalidTarget),
    }
}

fn replace_at(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), PatchFailure> {
    if tokens.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, key) = parent_of(doc, tokens)?;
    match parent {
        Value::Object(map) => match map.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(PatchFailure::PathNotFound),
        },
        Value::Array(items) => {
            let idx = parse_index(key).ok_or(PatchFailure::InvalidIndex)?;
            let slot = items.get_mut(idx).ok_or(PatchFailure::PathNotFound)?;
            *slot = value;
            Ok(())
        }
        _ => Err(PatchFailure::InvalidTarget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::OpKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn p(text: &str) -> DocPath {
        text.parse().unwrap()
    }

    fn doc() -> Value {
        json!({
            "name": "Study",
            "activities": [
                {"id": "ACT_1", "name": "Consent"},
                {"id": "ACT_2", "name": "Vitals"},
                {"id": "ACT_3", "name": "Labs"}
            ],
            "meta": {"tags": ["a", "b"]}
        })
    }

    #[test]
    fn add_object_member_and_array_elements() {
        let ops = vec![
            PatchOperation::add(p("/phase"), json!("II")),
            PatchOperation::add(p("/meta/tags/-"), json!("c")),
            PatchOperation::add(p("/meta/tags/0"), json!("z")),
        ];
        let out = apply(&doc(), &ops).unwrap();
        assert_eq!(out["phase"], json!("II"));
        assert_eq!(out["meta"]["tags"], json!(["z", "a", "b", "c"]));
    }

    #[test]
    fn replace_and_remove_by_id() {
        let ops = vec![
            PatchOperation::replace(p("/activities/@id:ACT_2/name"), json!("Vital signs")),
            PatchOperation::remove(p("/activities/@id:ACT_1")),
        ];
        let out = apply(&doc(), &ops).unwrap();
        assert_eq!(out["activities"][0]["name"], json!("Vital signs"));
        assert_eq!(out["activities"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn id_segments_resolve_per_operation() {
        // ACT_3 sits at index 2 initially and index 1 after the removal
        let ops = vec![
            PatchOperation::remove(p("/activities/@id:ACT_1")),
            PatchOperation::replace(p("/activities/@id:ACT_3/name"), json!("Chemistry")),
        ];
        let out = apply(&doc(), &ops).unwrap();
        assert_eq!(out["activities"][1], json!({"id": "ACT_3", "name": "Chemistry"}));
    }

    #[test]
    fn unresolved_id_is_path_not_found() {
        let ops = vec![PatchOperation::replace(
            p("/activities/@id:ACT_9/name"),
            json!("x"),
        )];
        let err = apply(&doc(), &ops).unwrap_err();
        assert_eq!(err.code(), "path_not_found");
        assert_eq!(err.index, 0);
        assert_eq!(err.path, "/activities/@id:ACT_9/name");
    }

    #[test]
    fn failed_test_stops_before_later_operations() {
        let ops = vec![
            PatchOperation::replace(p("/name"), json!("Renamed")),
            PatchOperation::test(p("/activities/0/name"), json!("Not consent")),
            PatchOperation::remove(p("/activities/0")),
        ];
        let original = doc();
        let err = apply(&original, &ops).unwrap_err();
        assert_eq!(err.code(), "test_failed");
        assert_eq!(err.index, 1);
        assert_eq!(err.op, OpKind::Test);
        assert_eq!(original, doc());
    }

    #[test]
    fn apply_to_leaves_document_on_failure() {
        let mut target = doc();
        let ops = vec![
            PatchOperation::replace(p("/name"), json!("Changed")),
            PatchOperation::remove(p("/missing")),
        ];
        assert!(apply_to(&mut target, &ops).is_err());
        assert_eq!(target, doc());

        apply_to(&mut target, &ops[..1]).unwrap();
        assert_eq!(target["name"], json!("Changed"));
    }

    #[test]
    fn move_and_copy() {
        let ops = vec![
            PatchOperation::move_to(p("/activities/@id:ACT_3"), p("/activities/0")),
            PatchOperation::copy(p("/meta/tags"), p("/tagsCopy")),
        ];
        let out = apply(&doc(), &ops).unwrap();
        assert_eq!(out["activities"][0]["id"], json!("ACT_3"));
        assert_eq!(out["activities"][2]["id"], json!("ACT_2"));
        assert_eq!(out["tagsCopy"], json!(["a", "b"]));
    }

    #[test]
    fn move_into_own_child_is_rejected() {
        let ops = vec![PatchOperation::move_to(p("/meta"), p("/meta/tags/inner"))];
        let err = apply(&doc(), &ops).unwrap_err();
        assert_eq!(err.code(), "move_into_self");
    }

    #[test]
    fn move_onto_itself_is_noop() {
        let ops = vec![PatchOperation::move_to(p("/meta"), p("/meta"))];
        assert_eq!(apply(&doc(), &ops).unwrap(), doc());
    }

    #[test]
    fn out_of_range_and_bad_indices() {
        let too_far = vec![PatchOperation::add(p("/meta/tags/5"), json!("x"))];
        assert_eq!(apply(&doc(), &too_far).unwrap_err().code(), "invalid_index");

        let bad = vec![PatchOperation::replace(p("/meta/tags/one"), json!("x"))];
        assert_eq!(apply(&doc(), &bad).unwrap_err().code(), "invalid_index");

        let missing = vec![PatchOperation::remove(p("/meta/tags/2"))];
        assert_eq!(apply(&doc(), &missing).unwrap_err().code(), "path_not_found");
    }

    #[test]
    fn scalar_parent_is_invalid_target() {
        let ops = vec![PatchOperation::add(p("/name/x"), json!(1))];
        assert_eq!(apply(&doc(), &ops).unwrap_err().code(), "invalid_target");
    }

    #[test]
    fn root_operations() {
        let replaced = apply(&doc(), &[PatchOperation::replace(p(""), json!({"v": 2}))]).unwrap();
        assert_eq!(replaced, json!({"v": 2}));

        let err = apply(&doc(), &[PatchOperation::remove(p(""))]).unwrap_err();
        assert_eq!(err.code(), "root_removal");
    }

    #[test]
    fn empty_operation_list_is_identity() {
        assert_eq!(apply(&doc(), &[]).unwrap(), doc());
    }
}
