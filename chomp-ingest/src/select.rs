//! Pure JSON-selector projection (spec.md §4.6.2, testable property 5).
//! Grounded on `examples/original_source/src/utils.py::select_from_dict`,
//! generalized to also accept integer-index brackets (`items[0].price`) per
//! spec.md §4.6.2, since the Python original only walks dotted keys.

use serde_json::Value;

/// `None`/empty/`"."`/`"root"` select the whole document, matching the
/// source's sentinel set.
pub fn select_from_dict<'a>(selector: Option<&str>, data: &'a Value) -> Option<&'a Value> {
    let selector = match selector {
        None => return Some(data),
        Some(s) if s.is_empty() || s == "." || s == "root" => return Some(data),
        Some(s) => s.strip_prefix('.').unwrap_or(s),
    };

    let mut current = data;
    for segment in selector.split('.') {
        for part in split_bracket_indices(segment) {
            current = match part {
                Segment::Key(key) => current.get(key)?,
                Segment::Index(i) => current.get(i)?,
            };
        }
    }
    Some(current)
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Splits `"items[0][1]"` into `[Key("items"), Index(0), Index(1)]`.
fn split_bracket_indices(segment: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = segment;
    if let Some(bracket) = rest.find('[') {
        if bracket > 0 {
            out.push(Segment::Key(&rest[..bracket]));
        }
        rest = &rest[bracket..];
        while let Some(stripped) = rest.strip_prefix('[') {
            if let Some(end) = stripped.find(']') {
                if let Ok(idx) = stripped[..end].parse::<usize>() {
                    out.push(Segment::Index(idx));
                }
                rest = &stripped[end + 1..];
            } else {
                break;
            }
        }
    } else if !rest.is_empty() {
        out.push(Segment::Key(rest));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_selectors_return_whole_document() {
        let data = json!({"a": 1});
        assert_eq!(select_from_dict(None, &data), Some(&data));
        assert_eq!(select_from_dict(Some("."), &data), Some(&data));
        assert_eq!(select_from_dict(Some("root"), &data), Some(&data));
    }

    #[test]
    fn dotted_path_walks_nested_objects() {
        let data = json!({"data": {"price": "64321.4973"}});
        assert_eq!(
            select_from_dict(Some(".data.price"), &data),
            Some(&json!("64321.4973"))
        );
    }

    #[test]
    fn bracket_index_walks_arrays() {
        let data = json!({"items": [{"price": 1}, {"price": 2}]});
        assert_eq!(
            select_from_dict(Some("items[1].price"), &data),
            Some(&json!(2))
        );
    }

    #[test]
    fn missing_key_returns_none() {
        let data = json!({"a": 1});
        assert_eq!(select_from_dict(Some("b.c"), &data), None);
    }
}
