//! Token definitions

use logos::{Filter, FilterResult, Lexer, Logos};

/// Lexical token of a `.ck` compilation unit
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    // Keywords
    #[token("fn")]
    Fn,
    #[token("struct")]
    Struct,
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("loop")]
    Loop,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("defer")]
    Defer,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("nil")]
    Nil,

    // Annotation comments. Plain line comments are filtered out here so the
    // parser only ever sees `// +...` directives.
    #[regex(r"//[^\n]*", directive)]
    Directive(String),
    // Never emitted: the callback skips through the closing `*/`
    #[token("/*", block_comment)]
    BlockComment,

    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok(), priority = 2)]
    IntLit(i64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    StringLit(String),
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    // Symbols
    #[token(":")]
    Colon,
    #[token("->")]
    Arrow,
    #[token(".")]
    Dot,
    #[token("=")]
    Eq,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("&")]
    Ampersand,

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("!")]
    Bang,
}

/// Keep `// +...` comments as directives, drop every other comment
fn directive(lex: &mut Lexer<Token>) -> Filter<String> {
    let text = lex.slice()[2..].trim();
    match text.strip_prefix('+') {
        Some(body) => Filter::Emit(body.trim().to_string()),
        None => Filter::Skip,
    }
}

/// Skip a block comment; an unterminated one is a lexer error
fn block_comment(lex: &mut Lexer<Token>) -> FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            FilterResult::Error(())
        }
    }
}

fn unescape(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('0') => result.push('\0'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Fn => write!(f, "`fn`"),
            Token::Struct => write!(f, "`struct`"),
            Token::Let => write!(f, "`let`"),
            Token::If => write!(f, "`if`"),
            Token::Else => write!(f, "`else`"),
            Token::While => write!(f, "`while`"),
            Token::Loop => write!(f, "`loop`"),
            Token::Break => write!(f, "`break`"),
            Token::Continue => write!(f, "`continue`"),
            Token::Return => write!(f, "`return`"),
            Token::Defer => write!(f, "`defer`"),
            Token::True => write!(f, "`true`"),
            Token::False => write!(f, "`false`"),
            Token::Nil => write!(f, "`nil`"),
            Token::Directive(text) => write!(f, "directive `+{text}`"),
            Token::BlockComment => write!(f, "block comment"),
            Token::IntLit(n) => write!(f, "integer `{n}`"),
            Token::StringLit(s) => write!(f, "string {s:?}"),
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Colon => write!(f, "`:`"),
            Token::Arrow => write!(f, "`->`"),
            Token::Dot => write!(f, "`.`"),
            Token::Eq => write!(f, "`=`"),
            Token::Semi => write!(f, "`;`"),
            Token::Comma => write!(f, "`,`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::LBrace => write!(f, "`{{`"),
            Token::RBrace => write!(f, "`}}`"),
            Token::LBracket => write!(f, "`[`"),
            Token::RBracket => write!(f, "`]`"),
            Token::Ampersand => write!(f, "`&`"),
            Token::Plus => write!(f, "`+`"),
            Token::Minus => write!(f, "`-`"),
            Token::Star => write!(f, "`*`"),
            Token::Slash => write!(f, "`/`"),
            Token::Percent => write!(f, "`%`"),
            Token::EqEq => write!(f, "`==`"),
            Token::NotEq => write!(f, "`!=`"),
            Token::Lt => write!(f, "`<`"),
            Token::Gt => write!(f, "`>`"),
            Token::LtEq => write!(f, "`<=`"),
            Token::GtEq => write!(f, "`>=`"),
            Token::AmpAmp => write!(f, "`&&`"),
            Token::PipePipe => write!(f, "`||`"),
            Token::Bang => write!(f, "`!`"),
        }
    }
}
