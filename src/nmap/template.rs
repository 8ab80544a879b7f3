//! Version-info substitution templates
//!
//! A template is the value of a `p/`, `v/`, `i/`, `h/`, `o/`, `d/` or
//! `cpe:/` binding in the service-probes corpus: a literal string
//! interleaved with `$1`-style capture references and `$FN(...)` calls
//! to a small set of built-in transform functions.

use regex::Captures;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Byte-accurate literal text.
    Literal(String),
    /// Capture-group reference, a 1-based index or a group name.
    Group(String),
    /// Built-in function call, e.g. `$SUBST(1,"_"," ")`.
    Func { name: String, args: Vec<String> },
}

/// An ordered sequence of tokens. Rendering concatenates the render of
/// each token against a successful match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    /// Parse a template source. Never fails: anything that does not form
    /// a group reference or a well-formed function call stays literal.
    pub fn parse(src: &str) -> Template {
        let chars: Vec<char> = src.chars().collect();
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] != '$' {
                literal.push(chars[i]);
                i += 1;
                continue;
            }
            // At a '$'. Decide between escape, group, function and plain text.
            let Some(&next) = chars.get(i + 1) else {
                literal.push('$');
                break;
            };
            if next == '$' {
                literal.push('$');
                i += 2;
                continue;
            }
            if next.is_ascii_digit() {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                flush_literal(&mut tokens, &mut literal);
                tokens.push(Token::Group(chars[i + 1..j].iter().collect()));
                i = j;
                continue;
            }
            if next.is_ascii_alphabetic() {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                if chars.get(j) == Some(&'(') {
                    if let Some((args, end)) = parse_args(&chars, j + 1) {
                        flush_literal(&mut tokens, &mut literal);
                        tokens.push(Token::Func {
                            name: chars[i + 1..j].iter().collect(),
                            args,
                        });
                        i = end;
                        continue;
                    }
                }
            }
            literal.push('$');
            i += 1;
        }

        flush_literal(&mut tokens, &mut literal);
        Template { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Render against a successful match. Group references that captured
    /// nothing render as the empty string.
    pub fn render(&self, caps: &Captures) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Group(key) => out.push_str(group_text(caps, key).unwrap_or_default()),
                Token::Func { name, args } => out.push_str(&render_func(caps, name, args)),
            }
        }
        out
    }
}

fn flush_literal(tokens: &mut Vec<Token>, literal: &mut String) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }
}

/// Parse the argument list of a function call starting right after the
/// opening parenthesis. Returns the arguments and the index just past
/// the closing parenthesis, or None when the call is malformed.
fn parse_args(chars: &[char], mut i: usize) -> Option<(Vec<String>, usize)> {
    let mut args = Vec::new();
    loop {
        while chars.get(i).is_some_and(|c| c.is_whitespace()) {
            i += 1;
        }
        match chars.get(i)? {
            ')' => return Some((args, i + 1)),
            '"' => {
                let (arg, next) = parse_quoted(chars, i + 1)?;
                args.push(arg);
                i = next;
            }
            _ => {
                let mut arg = String::new();
                while let Some(&c) = chars.get(i) {
                    if c == ',' || c == ')' || c.is_whitespace() {
                        break;
                    }
                    arg.push(c);
                    i += 1;
                }
                if arg.is_empty() {
                    return None;
                }
                args.push(arg);
            }
        }
        while chars.get(i).is_some_and(|c| c.is_whitespace()) {
            i += 1;
        }
        match chars.get(i)? {
            ',' => i += 1,
            ')' => return Some((args, i + 1)),
            _ => return None,
        }
    }
}

/// Parse a double-quoted argument with backslash escapes. Returns the
/// unescaped text and the index just past the closing quote.
fn parse_quoted(chars: &[char], mut i: usize) -> Option<(String, usize)> {
    let mut out = String::new();
    loop {
        match chars.get(i)? {
            '"' => return Some((out, i + 1)),
            '\\' => {
                let escaped = chars.get(i + 1)?;
                match escaped {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    '0' => out.push('\0'),
                    c => out.push(*c),
                }
                i += 2;
            }
            c => {
                out.push(*c);
                i += 1;
            }
        }
    }
}

/// Fetch a capture by numeric index or name.
fn group_text<'a>(caps: &'a Captures, key: &str) -> Option<&'a str> {
    match key.parse::<usize>() {
        Ok(index) => caps.get(index).map(|m| m.as_str()),
        Err(_) => caps.name(key).map(|m| m.as_str()),
    }
}

fn render_func(caps: &Captures, name: &str, args: &[String]) -> String {
    match name {
        "SUBST" => subst(caps, args),
        "P" => printable(caps, args),
        "I" => as_int(caps, args),
        _ => String::new(),
    }
}

/// `SUBST(group, from, to)` — replace every occurrence of `from` in the
/// captured group with `to`.
fn subst(caps: &Captures, args: &[String]) -> String {
    if args.len() >= 3 {
        if let Some(g) = group_text(caps, &args[0]) {
            if !g.is_empty() {
                return g.replace(&args[1], &args[2]);
            }
        }
    }
    String::new()
}

/// `P(group)` — keep only printable code points of the captured group.
fn printable(caps: &Captures, args: &[String]) -> String {
    let mut out = String::new();
    if let Some(g) = args.first().and_then(|a| group_text(caps, a)) {
        out.extend(g.chars().filter(|c| !c.is_control()));
    }
    out
}

/// `I(group, endian)` — interpret the group bytes as an unsigned
/// integer. `">"` is big-endian, `"<"` little-endian; anything else
/// (including a missing argument) renders `"0"`.
fn as_int(caps: &Captures, args: &[String]) -> String {
    let mut n: u64 = 0;
    if args.len() >= 2 {
        if let Some(g) = group_text(caps, &args[0]) {
            if !g.is_empty() {
                n = match args[1].as_str() {
                    ">" => g.bytes().fold(0u64, |acc, b| (acc << 8) | b as u64),
                    "<" => g.bytes().rev().fold(0u64, |acc, b| (acc << 8) | b as u64),
                    _ => 0,
                };
            }
        }
    }
    n.to_string()
}
