//! eval.rs — Mini-évaluateur d'expressions & parsing typé de `setVariable`
//!
//! Deux usages :
//! - conditions de breakpoints : grammaire minimale (précédence standard)
//!     expr       := or
//!     or         := and ("||" and)*
//!     and        := equality ("&&" equality)*
//!     equality   := comparison (("==" | "!=") comparison)*
//!     comparison := addition (("<" | "<=" | ">" | ">=") addition)*
//!     addition   := unary (("+" | "-") unary)*
//!     unary      := ("!" | "-") unary | primary
//!     primary    := IDENT | INT | FLOAT | STRING | "true" | "false" | "(" expr ")"
//!   Variables résolues via un callback ; toute erreur d'évaluation est
//!   traitée comme `false` par l'appelant.
//! - entrées `setVariable` : parsing dirigé par le type déclaré de la
//!   variable (nombres/bools nus, chaînes **obligatoirement** entre
//!   guillemets, tableaux `[a, b, c]` avec échappement façon JSON).
//!
//! Évaluation read-only : aucun effet de bord.

use color_eyre::eyre::{bail, eyre, Result};
use etch_core::Value;

/* ------------------------------- Lexer ------------------------------------ */

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    LParen,
    RParen,
    Plus,
    Minus,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

struct Lexer<'a> {
    s: &'a [u8],
    i: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self { Self { s: src.as_bytes(), i: 0 } }

    fn eof(&self) -> bool { self.i >= self.s.len() }
    fn peek(&self) -> u8 { self.s[self.i] }

    fn skip_ws(&mut self) {
        while !self.eof() && self.peek().is_ascii_whitespace() {
            self.i += 1;
        }
    }

    fn next_token(&mut self) -> Result<Tok> {
        self.skip_ws();
        if self.eof() {
            return Ok(Tok::Eof);
        }
        let c = self.peek();

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.i;
            while !self.eof() && (self.peek().is_ascii_alphanumeric() || self.peek() == b'_') {
                self.i += 1;
            }
            let word = std::str::from_utf8(&self.s[start..self.i]).expect("ascii ident").to_string();
            return Ok(match word.as_str() {
                "true" => Tok::True,
                "false" => Tok::False,
                _ => Tok::Ident(word),
            });
        }

        if c.is_ascii_digit() {
            let start = self.i;
            while !self.eof() && self.peek().is_ascii_digit() {
                self.i += 1;
            }
            if !self.eof() && self.peek() == b'.' {
                self.i += 1;
                while !self.eof() && self.peek().is_ascii_digit() {
                    self.i += 1;
                }
                let text = std::str::from_utf8(&self.s[start..self.i]).expect("ascii number");
                return Ok(Tok::Float(text.parse().map_err(|_| eyre!("nombre invalide `{text}`"))?));
            }
            let text = std::str::from_utf8(&self.s[start..self.i]).expect("ascii number");
            return Ok(Tok::Int(text.parse().map_err(|_| eyre!("entier invalide `{text}`"))?));
        }

        if c == b'"' {
            let (s, next) = lex_quoted(self.s, self.i)?;
            self.i = next;
            return Ok(Tok::Str(s));
        }

        let two = |l: &mut Self, tok| {
            l.i += 2;
            Ok(tok)
        };
        match (c, self.s.get(self.i + 1).copied()) {
            (b'=', Some(b'=')) => return two(self, Tok::EqEq),
            (b'!', Some(b'=')) => return two(self, Tok::NotEq),
            (b'<', Some(b'=')) => return two(self, Tok::Le),
            (b'>', Some(b'=')) => return two(self, Tok::Ge),
            (b'&', Some(b'&')) => return two(self, Tok::AndAnd),
            (b'|', Some(b'|')) => return two(self, Tok::OrOr),
            _ => {}
        }
        self.i += 1;
        Ok(match c {
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'!' => Tok::Bang,
            b'<' => Tok::Lt,
            b'>' => Tok::Gt,
            other => bail!("caractère inattendu `{}`", other as char),
        })
    }
}

/// Lit une chaîne entre guillemets avec échappement façon JSON ; retourne
/// (contenu, offset après le guillemet fermant).
fn lex_quoted(s: &[u8], start: usize) -> Result<(String, usize)> {
    debug_assert_eq!(s[start], b'"');
    let mut out = String::new();
    let mut i = start + 1;
    while i < s.len() {
        match s[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' => {
                let esc = s.get(i + 1).copied().ok_or_else(|| eyre!("échappement tronqué"))?;
                match esc {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'n' => out.push('\n'),
                    b'r' => out.push('\r'),
                    b't' => out.push('\t'),
                    b'u' => {
                        let hex = s
                            .get(i + 2..i + 6)
                            .ok_or_else(|| eyre!("échappement \\u tronqué"))?;
                        let hex = std::str::from_utf8(hex).map_err(|_| eyre!("\\u non-ascii"))?;
                        let code = u32::from_str_radix(hex, 16).map_err(|_| eyre!("\\u invalide"))?;
                        out.push(char::from_u32(code).ok_or_else(|| eyre!("\\u hors plage"))?);
                        i += 6;
                        continue;
                    }
                    other => bail!("échappement inconnu `\\{}`", other as char),
                }
                i += 2;
            }
            other => {
                // UTF-8 passthrough byte à byte
                let tail = &s[i..];
                let ch_len = utf8_len(other);
                let chunk = tail.get(..ch_len).ok_or_else(|| eyre!("UTF-8 tronqué"))?;
                out.push_str(std::str::from_utf8(chunk).map_err(|_| eyre!("UTF-8 invalide"))?);
                i += ch_len;
            }
        }
    }
    bail!("guillemet fermant manquant")
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

/* ------------------------------- Parser ----------------------------------- */

struct Parser<'a, F> {
    lexer: Lexer<'a>,
    cur: Tok,
    lookup: F,
}

impl<'a, F> Parser<'a, F>
where
    F: FnMut(&str) -> Option<Value>,
{
    fn new(src: &'a str, lookup: F) -> Result<Self> {
        let mut lexer = Lexer::new(src);
        let cur = lexer.next_token()?;
        Ok(Self { lexer, cur, lookup })
    }

    fn bump(&mut self) -> Result<Tok> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn eat(&mut self, tok: &Tok) -> Result<bool> {
        if &self.cur == tok {
            self.bump()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn or(&mut self) -> Result<Value> {
        let mut lhs = self.and()?;
        while self.eat(&Tok::OrOr)? {
            let rhs = self.and()?;
            lhs = Value::Bool(as_bool(&lhs)? || as_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Value> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::AndAnd)? {
            let rhs = self.equality()?;
            lhs = Value::Bool(as_bool(&lhs)? && as_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Value> {
        let mut lhs = self.comparison()?;
        loop {
            if self.eat(&Tok::EqEq)? {
                let rhs = self.comparison()?;
                lhs = Value::Bool(lhs == rhs);
            } else if self.eat(&Tok::NotEq)? {
                let rhs = self.comparison()?;
                lhs = Value::Bool(lhs != rhs);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn comparison(&mut self) -> Result<Value> {
        let mut lhs = self.addition()?;
        loop {
            let op = match self.cur {
                Tok::Lt => "<",
                Tok::Le => "<=",
                Tok::Gt => ">",
                Tok::Ge => ">=",
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.addition()?;
            let ord = lhs
                .compare(&rhs)
                .ok_or_else(|| eyre!("pas d'ordre entre {} et {}", lhs.type_name(), rhs.type_name()))?;
            lhs = Value::Bool(match op {
                "<" => ord.is_lt(),
                "<=" => ord.is_le(),
                ">" => ord.is_gt(),
                _ => ord.is_ge(),
            });
        }
    }

    fn addition(&mut self) -> Result<Value> {
        let mut lhs = self.unary()?;
        loop {
            let minus = match self.cur {
                Tok::Plus => false,
                Tok::Minus => true,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.unary()?;
            lhs = numeric_add(&lhs, &rhs, minus)?;
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.eat(&Tok::Bang)? {
            let v = self.unary()?;
            return Ok(Value::Bool(!as_bool(&v)?));
        }
        if self.eat(&Tok::Minus)? {
            return match self.unary()? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => bail!("négation de {}", other.type_name()),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        match self.bump()? {
            Tok::Int(i) => Ok(Value::Int(i)),
            Tok::Float(x) => Ok(Value::Float(x)),
            Tok::Str(s) => Ok(Value::str(s)),
            Tok::True => Ok(Value::Bool(true)),
            Tok::False => Ok(Value::Bool(false)),
            Tok::Ident(name) => {
                (self.lookup)(&name).ok_or_else(|| eyre!("variable inconnue `{name}`"))
            }
            Tok::LParen => {
                let v = self.or()?;
                if !self.eat(&Tok::RParen)? {
                    bail!("parenthèse fermante manquante");
                }
                Ok(v)
            }
            other => bail!("token inattendu {other:?}"),
        }
    }
}

fn as_bool(v: &Value) -> Result<bool> {
    v.as_bool().ok_or_else(|| eyre!("attendu bool, trouvé {}", v.type_name()))
}

fn numeric_add(lhs: &Value, rhs: &Value, minus: bool) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            Ok(Value::Int(if minus { a.wrapping_sub(*b) } else { a.wrapping_add(*b) }))
        }
        (Value::Float(a), Value::Float(b)) => {
            Ok(Value::Float(if minus { a - b } else { a + b }))
        }
        _ => bail!("arithmétique entre {} et {}", lhs.type_name(), rhs.type_name()),
    }
}

/// Évalue une expression complète ; la valeur doit consommer toute l'entrée.
pub fn eval_expr<F>(src: &str, lookup: F) -> Result<Value>
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut p = Parser::new(src, lookup)?;
    let v = p.or()?;
    if p.cur != Tok::Eof {
        bail!("entrée résiduelle après l'expression");
    }
    Ok(v)
}

/// Évalue une condition de breakpoint : résultat strictement booléen.
pub fn eval_condition<F>(src: &str, lookup: F) -> Result<bool>
where
    F: FnMut(&str) -> Option<Value>,
{
    as_bool(&eval_expr(src, lookup)?)
}

/* --------------------------- setVariable input ---------------------------- */

/// Entrée `setVariable` parsée.
#[derive(Debug, Clone, PartialEq)]
pub enum SetInput {
    /// Valeur scalaire prête à écrire.
    Scalar(Value),
    /// Éléments d'un tableau à matérialiser sur le tas.
    Array(Vec<Value>),
}

/// Parse la chaîne saisie par le client selon le type déclaré de la
/// variable (`type_name` de sa valeur actuelle). Un mismatch laisse la
/// variable inchangée côté appelant.
pub fn parse_typed_input(input: &str, declared: &str) -> Result<SetInput> {
    let input = input.trim();
    match declared {
        "int" => {
            let v: i64 = input
                .parse()
                .map_err(|_| eyre!("type mismatch: variable is int, got `{input}`"))?;
            Ok(SetInput::Scalar(Value::Int(v)))
        }
        "float" => {
            let v: f64 = input
                .parse()
                .map_err(|_| eyre!("type mismatch: variable is float, got `{input}`"))?;
            Ok(SetInput::Scalar(Value::Float(v)))
        }
        "bool" => match input {
            "true" => Ok(SetInput::Scalar(Value::Bool(true))),
            "false" => Ok(SetInput::Scalar(Value::Bool(false))),
            _ => Err(eyre!("type mismatch: variable is bool, got `{input}`")),
        },
        "char" => parse_char(input).map(SetInput::Scalar),
        "string" => {
            if !input.starts_with('"') {
                bail!("string values must be quoted: \"...\"");
            }
            let bytes = input.as_bytes();
            let (s, end) = lex_quoted(bytes, 0)?;
            if end != bytes.len() {
                bail!("trailing characters after closing quote");
            }
            Ok(SetInput::Scalar(Value::str(s)))
        }
        "array" => parse_array(input),
        other => Err(eyre!("variables of type {other} cannot be set")),
    }
}

fn parse_char(input: &str) -> Result<Value> {
    let inner = input
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(|| eyre!("char values use single quotes: 'x'"))?;
    let c = match inner {
        "\\n" => '\n',
        "\\t" => '\t',
        "\\r" => '\r',
        "\\\\" => '\\',
        "\\'" => '\'',
        _ => {
            let mut chars = inner.chars();
            let c = chars.next().ok_or_else(|| eyre!("empty char literal"))?;
            if chars.next().is_some() {
                bail!("char literal must contain exactly one character");
            }
            c
        }
    };
    Ok(Value::Char(c))
}

/// `[1, 2, 3]`, `["a", "b"]`… Un élément est un littéral scalaire ; les
/// tableaux imbriqués et toute entrée ambiguë sont rejetés.
fn parse_array(input: &str) -> Result<SetInput> {
    let inner = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| eyre!("array values use brackets: [a, b, c]"))?;

    let mut items = Vec::new();
    let mut rest = inner.trim();
    while !rest.is_empty() {
        let (item, tail) = take_element(rest)?;
        items.push(item);
        rest = tail.trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
            if rest.is_empty() {
                bail!("trailing comma in array literal");
            }
        } else if !rest.is_empty() {
            bail!("expected `,` between array elements");
        }
    }
    Ok(SetInput::Array(items))
}

fn take_element(s: &str) -> Result<(Value, &str)> {
    let bytes = s.as_bytes();
    match bytes[0] {
        b'"' => {
            let (text, end) = lex_quoted(bytes, 0)?;
            Ok((Value::str(text), &s[end..]))
        }
        b'[' => bail!("nested arrays are not supported in setVariable"),
        _ => {
            let end = s.find(',').unwrap_or(s.len());
            let token = s[..end].trim();
            let value = if token == "true" {
                Value::Bool(true)
            } else if token == "false" {
                Value::Bool(false)
            } else if token.starts_with('\'') {
                parse_char(token)?
            } else if token.contains('.') {
                Value::Float(token.parse().map_err(|_| eyre!("bad float `{token}`"))?)
            } else {
                Value::Int(token.parse().map_err(|_| eyre!("bad element `{token}`"))?)
            };
            Ok((value, &s[end..]))
        }
    }
}

/* --------------------------------- Tests ---------------------------------- */
