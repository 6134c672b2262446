//! Tokenizer.

use std::iter::Peekable;
use std::str::CharIndices;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Bare or backtick-quoted field name
    Name(String),
    /// `$name`
    Function(String),
    /// Lone `$`
    Root,
    Str(String),
    Number(f64),
    True,
    False,
    Null,
    And,
    Or,
    Dot,
    Comma,
    Amp,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Split `source` into tokens.
///
/// Returns the offending character position and a reason on failure.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut lexer = Lexer {
        chars: source.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

struct Lexer<'a> {
    chars: Peekable<CharIndices<'a>>,
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Option<Token>, String> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((pos, c)) = self.chars.next() else {
            return Ok(None);
        };

        let token = match c {
            '.' => Token::Dot,
            ',' => Token::Comma,
            '&' => Token::Amp,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '=' => Token::Eq,
            '!' if self.chars.next_if(|(_, c)| *c == '=').is_some() => Token::Ne,
            '<' if self.chars.next_if(|(_, c)| *c == '=').is_some() => Token::Le,
            '<' => Token::Lt,
            '>' if self.chars.next_if(|(_, c)| *c == '=').is_some() => Token::Ge,
            '>' => Token::Gt,
            '"' | '\'' => Token::Str(self.string(c, pos)?),
            '`' => Token::Name(self.quoted_name(pos)?),
            '$' => match self.word() {
                name if name.is_empty() => Token::Root,
                name => Token::Function(name),
            },
            '-' if self.chars.peek().is_some_and(|(_, c)| c.is_ascii_digit()) => {
                Token::Number(-self.number(None)?)
            }
            c if c.is_ascii_digit() => Token::Number(self.number(Some(c))?),
            c if is_name_char(c) => {
                let mut word = String::from(c);
                word.push_str(&self.word());
                match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Name(word),
                }
            }
            other => return Err(format!("unexpected character '{other}' at {pos}")),
        };
        Ok(Some(token))
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some((_, c)) = self.chars.next_if(|(_, c)| is_name_char(*c)) {
            word.push(c);
        }
        word
    }

    fn number(&mut self, first: Option<char>) -> Result<f64, String> {
        let mut text = first.map(String::from).unwrap_or_default();
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_ascii_digit() || *c == '.')
        {
            text.push(c);
        }
        text.parse()
            .map_err(|_| format!("invalid number literal '{text}'"))
    }

    fn string(&mut self, quote: char, start: usize) -> Result<String, String> {
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(text),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => text.push('\n'),
                    Some((_, 't')) => text.push('\t'),
                    Some((_, c)) => text.push(c),
                    None => break,
                },
                Some((_, c)) => text.push(c),
                None => break,
            }
        }
        Err(format!("unterminated string starting at {start}"))
    }

    fn quoted_name(&mut self, start: usize) -> Result<String, String> {
        let mut name = String::new();
        for (_, c) in self.chars.by_ref() {
            if c == '`' {
                return Ok(name);
            }
            name.push(c);
        }
        Err(format!("unterminated quoted name starting at {start}"))
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn tokenizes_paths_and_calls() {
        let tokens = tokenize("$uppercase(payload.name) & ' ' & items[0]").unwrap();
        assert_eq!(tokens[0], Token::Function("uppercase".to_string()));
        assert_eq!(tokens[2], Token::Name("payload".to_string()));
        assert!(tokens.contains(&Token::Str(" ".to_string())));
        assert!(tokens.contains(&Token::Number(0.0)));
    }

    #[test]
    fn rejects_url_text() {
        assert!(tokenize("http://registry/patients").is_err());
        assert!(tokenize("application/json").is_err());
    }

    #[test]
    fn quoted_names_allow_dashes() {
        let tokens = tokenize("requestHeaders.`x-trace-id`").unwrap();
        assert_eq!(tokens[2], Token::Name("x-trace-id".to_string()));
    }
}
