//! Tokenizer for the script language.
//!
//! Statements are newline-terminated; `#` starts a comment that runs to the
//! end of the line. Line numbers are 1-based and attached to every token so
//! the parser and the trace dispatcher can report accurate locations.

use crate::errors::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Fn,
    While,
    If,
    Else,
    Try,
    Catch,
    Return,
    Break,
    Continue,
    True,
    False,

    // Punctuation and operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,

    Newline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "fn" => Tok::Fn,
        "while" => Tok::While,
        "if" => Tok::If,
        "else" => Tok::Else,
        "try" => Tok::Try,
        "catch" => Tok::Catch,
        "return" => Tok::Return,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "true" => Tok::True,
        "false" => Tok::False,
        _ => return None,
    })
}

pub fn lex(src: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line: u32 = 1;

    macro_rules! push {
        ($tok:expr) => {
            tokens.push(Token { tok: $tok, line })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                push!(Tok::Newline);
                line += 1;
            }
            ';' => {
                chars.next();
                push!(Tok::Newline);
            }
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' => {
                chars.next();
                push!(Tok::LParen);
            }
            ')' => {
                chars.next();
                push!(Tok::RParen);
            }
            '{' => {
                chars.next();
                push!(Tok::LBrace);
            }
            '}' => {
                chars.next();
                push!(Tok::RBrace);
            }
            ',' => {
                chars.next();
                push!(Tok::Comma);
            }
            '%' => {
                chars.next();
                push!(Tok::Percent);
            }
            '+' | '-' | '*' | '/' => {
                chars.next();
                let assign = chars.peek() == Some(&'=');
                if assign {
                    chars.next();
                }
                push!(match (c, assign) {
                    ('+', false) => Tok::Plus,
                    ('+', true) => Tok::PlusAssign,
                    ('-', false) => Tok::Minus,
                    ('-', true) => Tok::MinusAssign,
                    ('*', false) => Tok::Star,
                    ('*', true) => Tok::StarAssign,
                    ('/', false) => Tok::Slash,
                    (_, true) => Tok::SlashAssign,
                    _ => unreachable!(),
                });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::EqEq);
                } else {
                    push!(Tok::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::NotEq);
                } else {
                    push!(Tok::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Le);
                } else {
                    push!(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(Tok::Ge);
                } else {
                    push!(Tok::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(syntax(line, "expected `&&`"));
                }
                push!(Tok::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(syntax(line, "expected `||`"));
                }
                push!(Tok::OrOr);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None | Some('\n') => {
                            return Err(syntax(line, "unterminated string literal"));
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('r') => text.push('\r'),
                            Some('\\') => text.push('\\'),
                            Some('"') => text.push('"'),
                            other => {
                                return Err(syntax(
                                    line,
                                    &format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                                ));
                            }
                        },
                        Some(other) => text.push(other),
                    }
                }
                push!(Tok::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        number.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let parsed = number
                        .parse::<f64>()
                        .map_err(|_| syntax(line, &format!("bad float literal `{}`", number)))?;
                    push!(Tok::Float(parsed));
                } else {
                    let parsed = number
                        .parse::<i64>()
                        .map_err(|_| syntax(line, &format!("bad int literal `{}`", number)))?;
                    push!(Tok::Int(parsed));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match keyword(&word) {
                    Some(tok) => push!(tok),
                    None => push!(Tok::Ident(word)),
                }
            }
            other => {
                return Err(syntax(line, &format!("unexpected character `{}`", other)));
            }
        }
    }
    tokens.push(Token {
        tok: Tok::Newline,
        line,
    });
    Ok(tokens)
}

fn syntax(line: u32, message: &str) -> EngineError {
    EngineError::Syntax {
        line,
        message: message.to_string(),
    }
}
