//! Function name mangling.
//!
//! Overloads are made uniquely nameable by appending a compact signature:
//! `base$<param codes>_<return code>`. Type codes:
//!
//! | code | type | | code | type |
//! |---|---|---|---|---|
//! | `i` | int | `t` | table |
//! | `b` | bool | `a<T>` | array of T |
//! | `f` | float | `r<T>` | ref to T |
//! | `c` | char | `w<T>` | weak to T |
//! | `s` | string | `o<T>` | option of T |
//! | `n` | nil | `e<T><E>` | result of T, E |
//! | `v` | void (return only) | | |
//!
//! `main(a: array[int]) -> int` mangles to `main$ai_i`. The synthetic
//! entry function `<global>` carries no separator and demangles to itself.
//! External identity always uses the mangled form; the separator never
//! reaches the user.

/// Separator between base name and signature codes.
pub const SEPARATOR: char = '$';

/// Builds a mangled name from a base and already-encoded parameter/return
/// code strings.
pub fn mangle(base: &str, params: &str, ret: &str) -> String {
    format!("{base}{SEPARATOR}{params}_{ret}")
}

/// Base name for display. Names without a separator (notably `<global>`)
/// come back unchanged.
pub fn display_name(mangled: &str) -> &str {
    match mangled.find(SEPARATOR) {
        Some(pos) => &mangled[..pos],
        None => mangled,
    }
}

/// Full human-readable signature, e.g. `add(int, int) -> int`. Falls back
/// to the base name when the signature part does not parse.
pub fn demangle(mangled: &str) -> String {
    let Some(pos) = mangled.find(SEPARATOR) else {
        return mangled.to_string();
    };
    let base = &mangled[..pos];
    let sig = &mangled[pos + 1..];
    let Some(underscore) = sig.rfind('_') else {
        return base.to_string();
    };
    let (params_code, ret_code) = (&sig[..underscore], &sig[underscore + 1..]);

    let mut params = Vec::new();
    let mut rest = params_code;
    while !rest.is_empty() {
        match parse_type(rest) {
            Some((ty, tail)) => {
                params.push(ty);
                rest = tail;
            }
            None => return base.to_string(),
        }
    }
    let ret = match parse_type(ret_code) {
        Some((ty, "")) => ty,
        _ => return base.to_string(),
    };

    if ret == "void" {
        format!("{base}({})", params.join(", "))
    } else {
        format!("{base}({}) -> {ret}", params.join(", "))
    }
}

fn parse_type(code: &str) -> Option<(String, &str)> {
    let mut chars = code.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    let simple = |name: &str| Some((name.to_string(), rest));
    match first {
        'i' => simple("int"),
        'b' => simple("bool"),
        'f' => simple("float"),
        'c' => simple("char"),
        's' => simple("string"),
        'n' => simple("nil"),
        't' => simple("table"),
        'v' => simple("void"),
        'a' => {
            let (inner, tail) = parse_type(rest)?;
            Some((format!("array[{inner}]"), tail))
        }
        'r' => {
            let (inner, tail) = parse_type(rest)?;
            Some((format!("ref[{inner}]"), tail))
        }
        'w' => {
            let (inner, tail) = parse_type(rest)?;
            Some((format!("weak[{inner}]"), tail))
        }
        'o' => {
            let (inner, tail) = parse_type(rest)?;
            Some((format!("option[{inner}]"), tail))
        }
        'e' => {
            let (ok, tail) = parse_type(rest)?;
            let (err, tail) = parse_type(tail)?;
            Some((format!("result[{ok}, {err}]"), tail))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strips_signature() {
        assert_eq!(display_name("add$ii_i"), "add");
        assert_eq!(display_name("main$_v"), "main");
        assert_eq!(display_name("<global>"), "<global>");
    }

    #[test]
    fn demangle_signatures() {
        assert_eq!(demangle("add$ii_i"), "add(int, int) -> int");
        assert_eq!(demangle("main$_v"), "main()");
        assert_eq!(demangle("greet$s_v"), "greet(string)");
    }

    #[test]
    fn demangle_nested() {
        assert_eq!(demangle("head$ai_oi"), "head(array[int]) -> option[int]");
        assert_eq!(demangle("load$s_ets"), "load(string) -> result[table, string]");
        assert_eq!(demangle("<global>"), "<global>");
    }

    #[test]
    fn roundtrip_with_mangle() {
        let m = mangle("push", "ati", "v");
        assert_eq!(m, "push$ati_v");
        assert_eq!(display_name(&m), "push");
        assert_eq!(demangle(&m), "push(array[table], int)");
    }

    #[test]
    fn garbled_signature_falls_back_to_base() {
        assert_eq!(demangle("f$zz_q"), "f");
        assert_eq!(demangle("f$i"), "f");
    }
}
