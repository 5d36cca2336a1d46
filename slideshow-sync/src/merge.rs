//! Deep merge of a partial update into a record.

use serde_json::Value;

/// Merge `source` into `target`.
///
/// For every key of `source`: missing in `target` → copied; both sides
/// non-array objects → merged recursively; anything else → overwritten.
/// Arrays and scalars are replaced wholesale. When either side is not an
/// object at all, `source` replaces `target`.
pub fn merge(target: &mut Value, source: &Value) {
    if !(target.is_object() && source.is_object()) {
        *target = source.clone();
        return;
    }
    let (Some(target_map), Some(source_map)) = (target.as_object_mut(), source.as_object()) else {
        return;
    };

    for (key, incoming) in source_map {
        match target_map.get_mut(key) {
            Some(existing) if existing.is_object() && incoming.is_object() => {
                merge(existing, incoming);
            }
            Some(existing) => *existing = incoming.clone(),
            None => {
                target_map.insert(key.clone(), incoming.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_merge_keeps_existing_keys() {
        let mut target = json!({"a": 1, "b": {"x": 1}});
        merge(&mut target, &json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(target, json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));
    }

    #[test]
    fn test_arrays_are_replaced() {
        let mut target = json!({"tags": ["a", "b"], "size": {"w": 10}});
        merge(&mut target, &json!({"tags": ["c"]}));
        assert_eq!(target, json!({"tags": ["c"], "size": {"w": 10}}));
    }

    #[test]
    fn test_scalar_overwrites_object_and_back() {
        let mut target = json!({"crop": {"x": 0}, "title": "old"});
        merge(&mut target, &json!({"crop": null, "title": {"text": "new"}}));
        assert_eq!(target, json!({"crop": null, "title": {"text": "new"}}));
    }

    #[test]
    fn test_deep_recursion() {
        let mut target = json!({"meta": {"exif": {"iso": 100, "f": 2.8}}});
        merge(&mut target, &json!({"meta": {"exif": {"iso": 400}}}));
        assert_eq!(target, json!({"meta": {"exif": {"iso": 400, "f": 2.8}}}));
    }

    #[test]
    fn test_non_object_target_is_replaced() {
        let mut target = json!(5);
        merge(&mut target, &json!({"a": 1}));
        assert_eq!(target, json!({"a": 1}));
    }
}
