//! Canonical value rendering.
//!
//! Two surfaces share this: `Print` (plain mode, raw top-level strings)
//! and the debugger's typed display (quoted mode). Aggregates are
//! flattened through the heap; revisited ids render as `<cycle #id>` so
//! cyclic structures terminate.

use std::collections::HashSet;

use etch_core::{escape_str, HeapId, Value};

use crate::heap::{Heap, Slots};

/// Debugger-style rendering: strings quoted and escaped.
pub fn render_value(heap: &Heap, value: &Value) -> String {
    let mut visited = HashSet::new();
    render(heap, value, true, &mut visited)
}

/// `Print`-style rendering: the top-level string is raw; everything nested
/// is quoted.
pub fn render_plain(heap: &Heap, value: &Value) -> String {
    if let Value::Str(s) = value {
        return s.to_string();
    }
    let mut visited = HashSet::new();
    render(heap, value, true, &mut visited)
}

fn render(heap: &Heap, value: &Value, quote: bool, visited: &mut HashSet<HeapId>) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        // shortest round-trip via `{}`; integral floats keep a `.0` so
        // they do not read as ints
        Value::Float(x) => {
            if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
                format!("{x:.1}")
            } else {
                x.to_string()
            }
        }
        Value::Char(c) => format!("'{c}'"),
        Value::Str(s) => {
            if quote {
                format!("\"{}\"", escape_str(s))
            } else {
                s.to_string()
            }
        }
        Value::Ref(id) => format!("<ref #{id}>"),
        Value::Weak(id) => format!("<weak #{id}>"),
        Value::Some(inner) => format!("some({})", render(heap, inner, true, visited)),
        Value::None => "none".to_string(),
        Value::Ok(inner) => format!("ok({})", render(heap, inner, true, visited)),
        Value::Err(inner) => format!("error({})", render(heap, inner, true, visited)),
        Value::Array(id) => render_object(heap, *id, visited),
        Value::Table(id) => render_object(heap, *id, visited),
    }
}

fn render_object(heap: &Heap, id: HeapId, visited: &mut HashSet<HeapId>) -> String {
    if !visited.insert(id) {
        return format!("<cycle #{id}>");
    }
    let out = match heap.get(id).map(|obj| &obj.slots) {
        Some(Slots::Array(elems)) => {
            let parts: Vec<String> =
                elems.iter().map(|v| render(heap, v, true, visited)).collect();
            format!("[{}]", parts.join(", "))
        }
        Some(Slots::Table(fields)) => {
            let parts: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{k}: {}", render(heap, v, true, visited)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Some(Slots::Weak { target, .. }) => format!("<weak #{target}>"),
        None => format!("<dead #{id}>"),
    };
    visited.remove(&id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars() {
        let heap = Heap::new();
        assert_eq!(render_value(&heap, &Value::Int(42)), "42");
        assert_eq!(render_value(&heap, &Value::Float(2.5)), "2.5");
        assert_eq!(render_value(&heap, &Value::Float(3.0)), "3.0");
        assert_eq!(render_value(&heap, &Value::Bool(true)), "true");
        assert_eq!(render_value(&heap, &Value::Char('x')), "'x'");
        assert_eq!(render_value(&heap, &Value::Nil), "nil");
        assert_eq!(render_value(&heap, &Value::str("hi\n")), "\"hi\\n\"");
        assert_eq!(render_plain(&heap, &Value::str("hi")), "hi");
    }

    #[test]
    fn wrappers() {
        let heap = Heap::new();
        assert_eq!(render_value(&heap, &Value::Some(Box::new(Value::Int(1)))), "some(1)");
        assert_eq!(render_value(&heap, &Value::None), "none");
        assert_eq!(render_value(&heap, &Value::Ok(Box::new(Value::str("s")))), "ok(\"s\")");
        assert_eq!(render_value(&heap, &Value::Err(Box::new(Value::Int(2)))), "error(2)");
        assert_eq!(render_value(&heap, &Value::Ref(3)), "<ref #3>");
        assert_eq!(render_value(&heap, &Value::Weak(4)), "<weak #4>");
    }

    #[test]
    fn aggregates_and_cycles() {
        let mut heap = Heap::new();
        let arr = heap.alloc_array(2);
        heap.push_element(arr, Value::Int(1)).unwrap();
        heap.push_element(arr, Value::str("two")).unwrap();
        assert_eq!(render_value(&heap, &Value::Array(arr)), "[1, \"two\"]");

        let t = heap.alloc_table();
        heap.set_field(t, "me", Value::Table(t)).unwrap();
        assert_eq!(render_value(&heap, &Value::Table(t)), format!("{{me: <cycle #{t}>}}"));
    }
}
