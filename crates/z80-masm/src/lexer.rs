//! Lexical layer: comment stripping and line tokenization.

use crate::config::CommentConfig;

/// One logical source line after comment stripping.
#[derive(Debug, Clone)]
pub struct Line {
    /// Identifier of the source unit this line came from.
    pub file: u32,
    /// 1-based line number within that unit.
    pub number: u32,
    pub text: String,
}

/// Strip comments from a whole source unit, preserving line structure.
///
/// Block comments have their content removed but keep every newline they
/// span, so a block comment can never splice two statements together.
/// Comment markers inside string and character literals are literal.
pub fn strip_comments(source: &str, config: &CommentConfig) -> Result<Vec<String>, String> {
    let semicolon = config.enabled && config.allow_semicolon;
    let cpp = config.enabled && config.allow_cpp_style;
    let block = config.enabled && config.allow_block;

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars().peekable();
    let mut in_block = false;
    let mut in_string: Option<char> = None;
    let mut line_comment = false;

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            lines.push(std::mem::take(&mut current));
            line_comment = false;
            in_string = None;
            continue;
        }
        if line_comment {
            continue;
        }
        if in_block {
            if ch == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block = false;
            }
            continue;
        }
        if let Some(quote) = in_string {
            current.push(ch);
            if ch == '\\' {
                if let Some(&escaped) = chars.peek() {
                    current.push(escaped);
                    chars.next();
                }
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                in_string = Some(ch);
                current.push(ch);
            }
            ';' if semicolon => line_comment = true,
            '/' if cpp && chars.peek() == Some(&'/') => {
                chars.next();
                line_comment = true;
            }
            '/' if block && chars.peek() == Some(&'*') => {
                chars.next();
                in_block = true;
            }
            _ => current.push(ch),
        }
    }
    if in_block {
        return Err("unterminated block comment".to_string());
    }
    lines.push(current);
    Ok(lines)
}

/// A classified lexeme.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Identifier, register name, keyword, or word operator.
    Ident(String),
    Int(i64),
    Float(f64),
    /// String or character literal, escapes already decoded.
    Str(String),
    /// Operator or punctuation, longest-match.
    Punct(&'static str),
    /// `$` - the current logical address.
    Dollar,
    /// `$$` - the current physical address.
    DollarDollar,
}

impl Tok {
    /// Identifier text, if this is one.
    pub fn ident(&self) -> Option<&str> {
        match self {
            Self::Ident(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Self::Punct(q) if *q == p)
    }
}

const PUNCTS: &[&str] = &[
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "**", "+", "-", "*", "/", "%", "<", ">", "=",
    "!", "~", "&", "^", "|", "?", ":", "(", ")", "{", "}", "[", "]", ",", "\\",
];

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '.'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '?' | '@')
}

/// Decode the escape sequences of a quoted literal body.
fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('x') => {
                // Up to two hex digits; a bare \x degrades to a literal x.
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(digit) => {
                            value = value * 16 + digit;
                            digits += 1;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push('x');
                } else {
                    out.push(char::from(value as u8));
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Tokenize one comment-stripped line.
pub fn tokenize(text: &str) -> Result<Vec<Tok>, String> {
    let bytes: Vec<char> = text.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        // String and character literals
        if ch == '"' || ch == '\'' {
            let quote = ch;
            let mut raw = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < bytes.len() {
                let c = bytes[j];
                if c == '\\' && j + 1 < bytes.len() {
                    raw.push(c);
                    raw.push(bytes[j + 1]);
                    j += 2;
                    continue;
                }
                if c == quote {
                    closed = true;
                    break;
                }
                raw.push(c);
                j += 1;
            }
            if !closed {
                return Err("unterminated string literal".to_string());
            }
            toks.push(Tok::Str(decode_escapes(&raw)));
            i = j + 1;
            continue;
        }

        // $: address, $$-address, $hex, or $PHASE/$PASS
        if ch == '$' {
            if bytes.get(i + 1) == Some(&'$') {
                toks.push(Tok::DollarDollar);
                i += 2;
                continue;
            }
            let mut j = i + 1;
            while j < bytes.len() && is_ident_continue(bytes[j]) {
                j += 1;
            }
            let body: String = bytes[i + 1..j].iter().collect();
            if body.is_empty() {
                toks.push(Tok::Dollar);
                i = j;
                continue;
            }
            if body.chars().all(|c| c.is_ascii_hexdigit()) {
                let value = i64::from_str_radix(&body, 16)
                    .map_err(|_| format!("bad hex literal ${body}"))?;
                toks.push(Tok::Int(value));
            } else {
                // $PHASE / $PASS introspection names travel as identifiers.
                toks.push(Tok::Ident(format!("${body}")));
            }
            i = j;
            continue;
        }

        // %: binary literal when directly followed by binary digits,
        // modulo operator otherwise.
        if ch == '%' {
            if matches!(bytes.get(i + 1), Some('0' | '1')) {
                let mut j = i + 1;
                while matches!(bytes.get(j), Some('0' | '1')) {
                    j += 1;
                }
                let body: String = bytes[i + 1..j].iter().collect();
                let value = i64::from_str_radix(&body, 2)
                    .map_err(|_| format!("bad binary literal %{body}"))?;
                toks.push(Tok::Int(value));
                i = j;
                continue;
            }
            toks.push(Tok::Punct("%"));
            i += 1;
            continue;
        }

        // Numbers: decimal, float, 0x/0b prefixes, trailing-b binary
        if ch.is_ascii_digit() {
            if ch == '0' && matches!(bytes.get(i + 1), Some('x' | 'X')) {
                let mut j = i + 2;
                while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
                    j += 1;
                }
                let body: String = bytes[i + 2..j].iter().collect();
                if body.is_empty() {
                    return Err("bad hex literal 0x".to_string());
                }
                let value = u64::from_str_radix(&body, 16)
                    .map_err(|_| format!("hex literal out of range 0x{body}"))?;
                toks.push(Tok::Int(value as i64));
                i = j;
                continue;
            }
            if ch == '0' && matches!(bytes.get(i + 1), Some('b' | 'B')) {
                let mut j = i + 2;
                while matches!(bytes.get(j), Some('0' | '1')) {
                    j += 1;
                }
                let body: String = bytes[i + 2..j].iter().collect();
                if body.is_empty() {
                    return Err("bad binary literal 0b".to_string());
                }
                let value = u64::from_str_radix(&body, 2)
                    .map_err(|_| format!("binary literal out of range 0b{body}"))?;
                toks.push(Tok::Int(value as i64));
                i = j;
                continue;
            }
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            // Float
            if bytes.get(j) == Some(&'.') && matches!(bytes.get(j + 1), Some(c) if c.is_ascii_digit())
            {
                let mut k = j + 1;
                while k < bytes.len() && bytes[k].is_ascii_digit() {
                    k += 1;
                }
                let body: String = bytes[i..k].iter().collect();
                let value: f64 = body.parse().map_err(|_| format!("bad float {body}"))?;
                toks.push(Tok::Float(value));
                i = k;
                continue;
            }
            // Trailing-b binary (10101010b)
            if matches!(bytes.get(j), Some('b' | 'B'))
                && !matches!(bytes.get(j + 1), Some(c) if is_ident_continue(*c))
                && bytes[i..j].iter().all(|c| matches!(c, '0' | '1'))
            {
                let body: String = bytes[i..j].iter().collect();
                let value = i64::from_str_radix(&body, 2)
                    .map_err(|_| format!("bad binary literal {body}b"))?;
                toks.push(Tok::Int(value));
                i = j + 1;
                continue;
            }
            let body: String = bytes[i..j].iter().collect();
            let value: i64 = body
                .parse::<u64>()
                .map_err(|_| format!("integer literal out of range {body}"))? as i64;
            toks.push(Tok::Int(value));
            i = j;
            continue;
        }

        // Identifiers (labels may carry ? @ _ . and a trailing ' for AF')
        if is_ident_start(ch) {
            let mut j = i + 1;
            while j < bytes.len() && is_ident_continue(bytes[j]) {
                j += 1;
            }
            let mut name: String = bytes[i..j].iter().collect();
            if bytes.get(j) == Some(&'\'') && name.eq_ignore_ascii_case("af") {
                name.push('\'');
                j += 1;
            }
            toks.push(Tok::Ident(name));
            i = j;
            continue;
        }

        // Punctuation, longest match first
        let mut matched = false;
        for punct in PUNCTS {
            let chars: Vec<char> = punct.chars().collect();
            if bytes[i..].starts_with(&chars) {
                toks.push(Tok::Punct(punct));
                i += chars.len();
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(format!("unexpected character {ch:?}"));
        }
    }

    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(source: &str) -> Vec<String> {
        strip_comments(source, &CommentConfig::default()).expect("clean source")
    }

    #[test]
    fn semicolon_and_cpp_comments_drop_to_eol() {
        assert_eq!(strip("LD A, 5 ; tail"), vec!["LD A, 5 "]);
        assert_eq!(strip("LD A, 5 // tail"), vec!["LD A, 5 "]);
    }

    #[test]
    fn block_comment_keeps_newlines() {
        let lines = strip("LD A, 1 /* two\nlines */ LD B, 2");
        assert_eq!(lines, vec!["LD A, 1 ", " LD B, 2"]);
    }

    #[test]
    fn markers_inside_strings_are_literal() {
        assert_eq!(strip("DB \"a ; b\""), vec!["DB \"a ; b\""]);
        assert_eq!(strip("DB 'x /* y */'"), vec!["DB 'x /* y */'"]);
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        assert!(strip_comments("LD A, 1 /* open", &CommentConfig::default()).is_err());
    }

    #[test]
    fn number_prefixes() {
        assert_eq!(tokenize("0x1F").expect("toks"), vec![Tok::Int(0x1F)]);
        assert_eq!(tokenize("0b101").expect("toks"), vec![Tok::Int(5)]);
        assert_eq!(tokenize("%101").expect("toks"), vec![Tok::Int(5)]);
        assert_eq!(tokenize("$FF").expect("toks"), vec![Tok::Int(0xFF)]);
        assert_eq!(tokenize("10101010b").expect("toks"), vec![Tok::Int(0xAA)]);
        assert_eq!(tokenize("3.5").expect("toks"), vec![Tok::Float(3.5)]);
    }

    #[test]
    fn percent_with_space_is_modulo() {
        assert_eq!(
            tokenize("10 % 3").expect("toks"),
            vec![Tok::Int(10), Tok::Punct("%"), Tok::Int(3)]
        );
    }

    #[test]
    fn dollar_forms() {
        assert_eq!(tokenize("$").expect("toks"), vec![Tok::Dollar]);
        assert_eq!(tokenize("$$").expect("toks"), vec![Tok::DollarDollar]);
        assert_eq!(
            tokenize("$PHASE").expect("toks"),
            vec![Tok::Ident("$PHASE".to_string())]
        );
    }

    #[test]
    fn identifiers_keep_suffix_marks() {
        assert_eq!(
            tokenize("loop? loop@ .local Outer.Inner").expect("toks"),
            vec![
                Tok::Ident("loop?".to_string()),
                Tok::Ident("loop@".to_string()),
                Tok::Ident(".local".to_string()),
                Tok::Ident("Outer.Inner".to_string()),
            ]
        );
    }

    #[test]
    fn af_prime_is_one_token() {
        assert_eq!(
            tokenize("AF'").expect("toks"),
            vec![Tok::Ident("AF'".to_string())]
        );
    }

    #[test]
    fn escape_decoding() {
        assert_eq!(tokenize(r#""\n""#).expect("toks"), vec![Tok::Str("\n".to_string())]);
        assert_eq!(tokenize(r#""\x41""#).expect("toks"), vec![Tok::Str("A".to_string())]);
        assert_eq!(tokenize(r#""\x""#).expect("toks"), vec![Tok::Str("x".to_string())]);
        assert_eq!(tokenize(r#""\x61B""#).expect("toks"), vec![Tok::Str("aB".to_string())]);
    }
}
