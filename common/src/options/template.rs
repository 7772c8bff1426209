//! Wildcard patterns with captures and the name templates that consume them
//!
//! A pattern knows `*` (any run of characters), `?` (one character) and `\x` (literal `x`).
//! A template copies text and substitutes:
//!
//! | token | value |
//! |---|---|
//! | `*` | the next `*` capture, in pattern order |
//! | `?` | the next `?` capture, in pattern order |
//! | `%*N` / `%?N` | the N-th (1-based) `*` / `?` capture |
//! | `%t<c>` | current time, `<c>` as in URL paths |
//! | `%n` | a four digit counter, unique within the daemon |
//! | `%h` | local host name |
//! | `%%` | `%` |

use crate::url::timefmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    Star,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wildcard {
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    pub stars: Vec<String>,
    pub singles: Vec<char>,
}

enum Capture {
    Star(usize, usize),
    Single(usize),
}

fn match_at(tokens: &[Token], chars: &[char], pos: usize, caps: &mut Vec<Capture>) -> bool {
    let Some(token) = tokens.first() else {
        return pos == chars.len();
    };
    match token {
        Token::Literal(c) => {
            chars.get(pos) == Some(c) && match_at(&tokens[1..], chars, pos + 1, caps)
        }
        Token::Any => {
            if pos >= chars.len() {
                return false;
            }
            caps.push(Capture::Single(pos));
            if match_at(&tokens[1..], chars, pos + 1, caps) {
                return true;
            }
            caps.pop();
            false
        }
        Token::Star => {
            for end in pos..=chars.len() {
                caps.push(Capture::Star(pos, end));
                if match_at(&tokens[1..], chars, end, caps) {
                    return true;
                }
                caps.pop();
            }
            false
        }
    }
}

impl Wildcard {
    pub fn new(pattern: &str) -> Self {
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            tokens.push(match c {
                '*' => Token::Star,
                '?' => Token::Any,
                '\\' => Token::Literal(chars.next().unwrap_or('\\')),
                other => Token::Literal(other),
            });
        }
        Self { tokens }
    }

    /// Matches the whole of `name`; each `*` takes the shortest run that lets the rest match.
    pub fn captures(&self, name: &str) -> Option<Captures> {
        let chars: Vec<char> = name.chars().collect();
        let mut caps = Vec::new();
        if !match_at(&self.tokens, &chars, 0, &mut caps) {
            return None;
        }
        let mut captures = Captures::default();
        for cap in caps {
            match cap {
                Capture::Star(start, end) => captures.stars.push(chars[start..end].iter().collect()),
                Capture::Single(pos) => captures.singles.push(chars[pos]),
            }
        }
        Some(captures)
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.captures(name).is_some()
    }
}

/// Values a template may refer to
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    pub captures: Option<&'a Captures>,
    /// seconds since the epoch
    pub time: i64,
    pub hostname: &'a str,
    pub counter: u32,
}

pub fn expand(template: &str, values: &TemplateValues) -> String {
    let empty = Captures::default();
    let captures = values.captures.unwrap_or(&empty);
    let mut stars = captures.stars.iter();
    let mut singles = captures.singles.iter();
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(stars.next().map(String::as_str).unwrap_or("")),
            '?' => {
                if let Some(single) = singles.next() {
                    out.push(*single);
                }
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '%' => match chars.peek().copied() {
                Some(kind @ ('*' | '?')) => {
                    chars.next();
                    let index = chars
                        .next_if(char::is_ascii_digit)
                        .and_then(|digit| digit.to_digit(10))
                        .unwrap_or(0) as usize;
                    if kind == '*' {
                        if let Some(star) = index.checked_sub(1).and_then(|i| captures.stars.get(i)) {
                            out.push_str(star);
                        }
                    } else if let Some(single) =
                        index.checked_sub(1).and_then(|i| captures.singles.get(i))
                    {
                        out.push(*single);
                    }
                }
                Some('t') => {
                    chars.next();
                    match chars.next_if(|f| timefmt::TIME_FORMATS.contains(&(*f as u8))) {
                        Some(format) => {
                            out.push_str(&timefmt::format_time(values.time, format as u8))
                        }
                        None => out.push_str("%t"),
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push_str(&format!("{:04}", values.counter % 10_000));
                }
                Some('h') => {
                    chars.next();
                    out.push_str(values.hostname);
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            other => out.push(other),
        }
    }
    out
}
