//! Dotted/bracketed path access over untyped response objects, e.g.
//! `choices[0].delta.content`. Used only by the custom protocol family,
//! whose response shape is pure configuration.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(Segment::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    break;
                };
                if let Ok(index) = stripped[..close].parse::<usize>() {
                    segments.push(Segment::Index(index));
                }
                rest = &stripped[close + 1..];
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    segments
}

/// Traverse `value` along `path`. Short-circuits to `None` on any
/// null/non-object intermediate or out-of-range index, never raising.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in parse_path(path) {
        current = match segment {
            Segment::Key(key) => current.as_object()?.get(&key)?,
            Segment::Index(index) => current.as_array()?.get(index)?,
        };
    }
    Some(current)
}

pub fn has(value: &Value, path: &str) -> bool {
    get(value, path).is_some()
}

/// Set `path` in `value`, creating missing intermediate containers. A missing
/// container becomes an array when the next segment is an index, otherwise an
/// object; arrays are padded with null up to the target index.
pub fn set(value: &mut Value, path: &str, new_value: Value) {
    let segments = parse_path(path);
    if segments.is_empty() {
        *value = new_value;
        return;
    }

    let mut current = value;
    for (position, segment) in segments.iter().enumerate() {
        let last = position + 1 == segments.len();
        match segment {
            Segment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let map = current.as_object_mut().unwrap_or_else(|| unreachable!());
                if last {
                    map.insert(key.clone(), new_value);
                    return;
                }
                current = map.entry(key.clone()).or_insert(Value::Null);
            }
            Segment::Index(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let array = current.as_array_mut().unwrap_or_else(|| unreachable!());
                while array.len() <= *index {
                    array.push(Value::Null);
                }
                if last {
                    array[*index] = new_value;
                    return;
                }
                current = &mut array[*index];
            }
        }
    }
}
