//! Recursive-descent parser producing the compiled [`Node`] tree.
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := compare ("and" compare)*
//! compare := concat (op concat)?
//! concat  := postfix ("&" postfix)*
//! postfix := primary ("." name | "[" number "]")*
//! primary := literal | name | "$" | "$fn(" args ")" | "(" expr ")"
//! ```

use crate::lexer::Token;
use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Uppercase,
    Lowercase,
    Trim,
    String,
    Number,
    Boolean,
    Not,
    Exists,
    Count,
    Length,
    Join,
    Contains,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        let builtin = match name {
            "uppercase" => Self::Uppercase,
            "lowercase" => Self::Lowercase,
            "trim" => Self::Trim,
            "string" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "not" => Self::Not,
            "exists" => Self::Exists,
            "count" => Self::Count,
            "length" => Self::Length,
            "join" => Self::Join,
            "contains" => Self::Contains,
            _ => return None,
        };
        Some(builtin)
    }

    /// Accepted argument counts, inclusive.
    const fn arity(self) -> (usize, usize) {
        match self {
            Self::Join => (1, 2),
            Self::Contains => (2, 2),
            _ => (1, 1),
        }
    }
}

/// One navigation step of a path.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Field(String),
    Index(i64),
}

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Literal(Value),
    /// The data the expression runs against
    Context,
    Path(Box<Node>, Vec<Step>),
    Call(Builtin, Vec<Node>),
    Concat(Vec<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// Parse a token stream into a tree. The whole stream must be consumed.
pub(crate) fn parse(tokens: Vec<Token>) -> Result<Node, String> {
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.or()?;
    match parser.peek() {
        None => Ok(node),
        Some(token) => Err(format!("unexpected {token:?} after end of expression")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn or(&mut self) -> Result<Node, String> {
        let mut node = self.and()?;
        while self.eat(&Token::Or) {
            node = Node::Or(Box::new(node), Box::new(self.and()?));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, String> {
        let mut node = self.compare()?;
        while self.eat(&Token::And) {
            node = Node::And(Box::new(node), Box::new(self.compare()?));
        }
        Ok(node)
    }

    fn compare(&mut self) -> Result<Node, String> {
        let lhs = self.concat()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.concat()?;
        Ok(Node::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn concat(&mut self) -> Result<Node, String> {
        let first = self.postfix()?;
        if self.peek() != Some(&Token::Amp) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&Token::Amp) {
            parts.push(self.postfix()?);
        }
        Ok(Node::Concat(parts))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn postfix(&mut self) -> Result<Node, String> {
        let (base, mut steps) = match self.primary()? {
            Node::Path(base, steps) => (*base, steps),
            other => (other, Vec::new()),
        };

        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Name(name)) => steps.push(Step::Field(name)),
                    other => return Err(format!("expected field name after '.', found {other:?}")),
                }
            } else if self.eat(&Token::LBracket) {
                match self.advance() {
                    Some(Token::Number(n)) if n.fract() == 0.0 => steps.push(Step::Index(n as i64)),
                    other => return Err(format!("expected integer index, found {other:?}")),
                }
                self.expect(&Token::RBracket)?;
            } else {
                break;
            }
        }

        if steps.is_empty() {
            Ok(base)
        } else {
            Ok(Node::Path(Box::new(base), steps))
        }
    }

    fn primary(&mut self) -> Result<Node, String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Node::Literal(number(n))),
            Some(Token::True) => Ok(Node::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Literal(Value::Null)),
            Some(Token::Root) => Ok(Node::Context),
            Some(Token::Name(name)) => Ok(Node::Path(Box::new(Node::Context), vec![Step::Field(name)])),
            Some(Token::Function(name)) => self.call(&name),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected {other:?}")),
        }
    }

    fn call(&mut self, name: &str) -> Result<Node, String> {
        let builtin = Builtin::lookup(name).ok_or_else(|| format!("unknown function ${name}"))?;
        self.expect(&Token::LParen)?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.or()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }

        let (min, max) = builtin.arity();
        if args.len() < min || args.len() > max {
            return Err(format!("${name} takes {min}..={max} arguments, got {}", args.len()));
        }
        Ok(Node::Call(builtin, args))
    }
}

/// Integral literals become JSON integers so `5` compares and renders as `5`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn compile(source: &str) -> Result<Node, String> {
        parse(tokenize(source)?)
    }

    #[test]
    fn paths_collect_steps() {
        let node = compile("payload.items[1].name").unwrap();
        assert_eq!(
            node,
            Node::Path(
                Box::new(Node::Context),
                vec![
                    Step::Field("payload".to_string()),
                    Step::Field("items".to_string()),
                    Step::Index(1),
                    Step::Field("name".to_string()),
                ]
            )
        );
    }

    #[test]
    fn rejects_trailing_tokens_and_unknown_functions() {
        assert!(compile("Bearer token").is_err());
        assert!(compile("$shout(payload)").is_err());
        assert!(compile("$contains('a')").is_err());
        assert!(compile("").is_err());
    }

    #[test]
    fn precedence_binds_concat_tighter_than_compare() {
        let node = compile("a & b = 'xy' and c").unwrap();
        assert!(matches!(node, Node::And(lhs, _) if matches!(*lhs, Node::Compare(CompareOp::Eq, _, _))));
    }
}
