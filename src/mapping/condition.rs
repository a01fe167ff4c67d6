//! Conditional (`if` / `elseif` / `else`) mapping rules.
//!
//! Expression strings such as `STATUS = 'A' AND AMOUNT >= 100` are parsed once,
//! when a mapping set is resolved, into an [`Expression`] tree that is then
//! evaluated against every source record.
//!
//! Grammar:
//!
//! ```text
//! or_expr    := and_expr ( (OR | "||") and_expr )*
//! and_expr   := unary ( (AND | "&&") unary )*
//! unary      := (NOT | "!") unary | "(" or_expr ")" | comparison
//! comparison := operand ( op operand | IS [NOT] NULL )?
//! op         := "=" | "==" | "!=" | "<>" | ">" | ">=" | "<" | "<="
//! operand    := FIELD | 'literal' | "literal" | number | TRUE | FALSE
//! ```

use std::{cmp::Ordering, fmt};

use crate::error::ConfigurationError;

use super::record::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn matches(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(String),
    Number(f64),
}

impl Operand {
    fn resolve<'r>(&'r self, record: &'r Record) -> Option<Resolved<'r>> {
        match self {
            Operand::Field(name) => record.get_present(name).map(Resolved::Value),
            Operand::Literal(text) => Some(Resolved::Text(text)),
            Operand::Number(n) => Some(Resolved::Number(*n)),
        }
    }
}

enum Resolved<'r> {
    Value(&'r Value),
    Text(&'r str),
    Number(f64),
}

impl Resolved<'_> {
    fn as_number(&self) -> Option<f64> {
        match self {
            Resolved::Value(v) => v.as_number(),
            Resolved::Text(t) => t.trim().parse().ok(),
            Resolved::Number(n) => Some(*n),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Resolved::Value(v) => v.to_string(),
            Resolved::Text(t) => t.to_string(),
            Resolved::Number(n) => Value::Number(*n).to_string(),
        }
    }
}

/// A parsed boolean expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    IsNull(Operand),
    IsNotNull(Operand),
    /// A bare operand; true for the literal `TRUE` or a field holding `true`/`Y`/`1`.
    Truthy(Operand),
    Constant(bool),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ConfigurationError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            source,
        };
        let expression = parser.or_expr()?;
        if parser.position != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expression)
    }

    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Expression::Compare { left, op, right } => compare(left, *op, right, record),
            Expression::IsNull(operand) => operand.resolve(record).is_none(),
            Expression::IsNotNull(operand) => operand.resolve(record).is_some(),
            Expression::Truthy(operand) => operand.resolve(record).is_some_and(|r| {
                matches!(
                    r.as_text().trim().to_ascii_uppercase().as_str(),
                    "TRUE" | "Y" | "YES" | "1"
                )
            }),
            Expression::Constant(value) => *value,
            Expression::And(l, r) => l.evaluate(record) && r.evaluate(record),
            Expression::Or(l, r) => l.evaluate(record) || r.evaluate(record),
            Expression::Not(inner) => !inner.evaluate(record),
        }
    }
}

/// Numeric comparison when both sides are numeric, string comparison otherwise.
/// A missing or null field compares as the empty string.
fn compare(left: &Operand, op: CompareOp, right: &Operand, record: &Record) -> bool {
    let left = left.resolve(record);
    let right = right.resolve(record);

    let numbers = (
        left.as_ref().and_then(Resolved::as_number),
        right.as_ref().and_then(Resolved::as_number),
    );
    if let (Some(l), Some(r)) = numbers {
        return l.partial_cmp(&r).is_some_and(|ordering| op.matches(ordering));
    }

    op.matches(text_of(left).cmp(&text_of(right)))
}

fn text_of(side: Option<Resolved<'_>>) -> String {
    side.map(|r| r.as_text()).unwrap_or_default()
}

/// The value produced by a branch: a quoted literal, or a bare word that is
/// read from the record when such a field exists and used verbatim otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchValue {
    Literal(String),
    FieldOrLiteral(String),
}

impl BranchValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match unquote(trimmed) {
            Some(literal) => BranchValue::Literal(literal.to_string()),
            None => BranchValue::FieldOrLiteral(trimmed.to_string()),
        }
    }

    pub fn resolve(&self, record: &Record) -> String {
        match self {
            BranchValue::Literal(text) => text.clone(),
            BranchValue::FieldOrLiteral(name) => match record.get(name) {
                Some(value) => value.to_string(),
                None => name.clone(),
            },
        }
    }
}

/// `if` / `elseif`* / `else` rule attached to a CONDITIONAL mapping.
///
/// Branches are tried in order: the `if`, then each `else_ifs` entry (its own
/// `if` and, recursively, its own `else_ifs`), then `else_value`. Only the
/// top-level `else_value` is used as the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub if_source: String,
    pub if_expr: Expression,
    pub then: BranchValue,
    pub else_ifs: Vec<Condition>,
    pub else_value: Option<BranchValue>,
}

impl Condition {
    pub fn new(if_expr: &str, then: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            if_source: if_expr.to_string(),
            if_expr: Expression::parse(if_expr)?,
            then: BranchValue::parse(then),
            else_ifs: Vec::new(),
            else_value: None,
        })
    }

    pub fn else_if(mut self, condition: Condition) -> Self {
        self.else_ifs.push(condition);
        self
    }

    pub fn otherwise(mut self, value: &str) -> Self {
        self.else_value = Some(BranchValue::parse(value));
        self
    }

    pub fn has_else(&self) -> bool {
        self.else_value.is_some()
    }

    /// Value of the first satisfied branch, or `None` when no branch matches
    /// and there is no `else`.
    pub fn evaluate(&self, record: &Record) -> Option<String> {
        self.first_match(record)
            .or_else(|| self.else_value.as_ref().map(|v| v.resolve(record)))
    }

    fn first_match(&self, record: &Record) -> Option<String> {
        if self.if_expr.evaluate(record) {
            return Some(self.then.resolve(record));
        }
        self.else_ifs.iter().find_map(|c| c.first_match(record))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if {}", self.if_source)?;
        for else_if in &self.else_ifs {
            write!(f, " elseif {}", else_if.if_source)?;
        }
        if self.else_value.is_some() {
            f.write_str(" else ...")?;
        }
        Ok(())
    }
}

fn unquote(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Text(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConfigurationError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let invalid = |message: String| {
        ConfigurationError::Invalid(format!("condition `{source}`: {message}"))
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| invalid("unterminated string literal".to_string()))?;
                tokens.push(Token::Text(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('=', _) => (Token::Op(CompareOp::Eq), 1),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('<', Some('>')) => (Token::Op(CompareOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    ('>', _) => (Token::Op(CompareOp::Gt), 1),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    _ => return Err(invalid(format!("unexpected character `{c}`"))),
                };
                tokens.push(token);
                i += width;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse()
                    .map_err(|_| invalid(format!("invalid number `{text}`")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(invalid(format!("unexpected character `{other}`"))),
        }
    }

    if tokens.is_empty() {
        return Err(invalid("empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser<'s> {
    tokens: Vec<Token>,
    position: usize,
    source: &'s str,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ConfigurationError {
        ConfigurationError::Invalid(format!(
            "condition `{}`: {} at token {}",
            self.source, message, self.position
        ))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<Expression, ConfigurationError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression, ConfigurationError> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression, ConfigurationError> {
        if self.eat(&Token::Not) {
            return Ok(Expression::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.or_expr()?;
            if !self.eat(&Token::RParen) {
                return Err(self.error("expected `)`"));
            }
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expression, ConfigurationError> {
        let left = match self.advance() {
            Some(Token::True) => return Ok(Expression::Constant(true)),
            Some(Token::False) => return Ok(Expression::Constant(false)),
            Some(token) => self.operand(token)?,
            None => return Err(self.error("expected operand")),
        };

        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.position += 1;
                let right = match self.advance() {
                    Some(Token::True) => Operand::Literal("true".to_string()),
                    Some(Token::False) => Operand::Literal("false".to_string()),
                    Some(token) => self.operand(token)?,
                    None => return Err(self.error("expected right operand")),
                };
                Ok(Expression::Compare { left, op, right })
            }
            Some(Token::Is) => {
                self.position += 1;
                let negated = self.eat(&Token::Not);
                if !self.eat(&Token::Null) {
                    return Err(self.error("expected NULL"));
                }
                Ok(if negated {
                    Expression::IsNotNull(left)
                } else {
                    Expression::IsNull(left)
                })
            }
            _ => Ok(Expression::Truthy(left)),
        }
    }

    fn operand(&self, token: Token) -> Result<Operand, ConfigurationError> {
        match token {
            Token::Ident(name) => Ok(Operand::Field(name)),
            Token::Text(text) => Ok(Operand::Literal(text)),
            Token::Number(n) => Ok(Operand::Number(n)),
            _ => Err(self.error("expected field, literal or number")),
        }
    }
}
