//! Compiled boolean expressions
//!
//! Alarm conditions are compiled once, when the alarm is created, into an
//! immutable syntax tree. Each evaluation tick only binds variables.
//!
//! ## Grammar
//!
//! Binding power from loosest to tightest:
//!
//! ```text
//! ||
//! &&
//! == != =            (= is an alias of ==)
//! > >= < <=
//! + -
//! * / %
//! unary - !
//! ```
//!
//! All binary operators are left-associative. Operands are numbers,
//! `true`/`false`, variables (`mean_temperature`) and parenthesised groups.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
    Bang,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Token::Number(n) => return write!(f, "{n}"),
            Token::Ident(name) => return f.write_str(name),
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::And => "&&",
            Token::Or => "||",
            Token::Bang => "!",
            Token::LParen => "(",
            Token::RParen => ")",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<Self> {
        Some(match token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Rem,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::And => BinaryOp::And,
            Token::Or => BinaryOp::Or,
            _ => return None,
        })
    }

    /// (left, right) binding power; right = left + 1 makes the operator left-associative
    fn binding_power(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::Eq | BinaryOp::Ne => (5, 6),
            BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => (7, 8),
            BinaryOp::Add | BinaryOp::Sub => (9, 10),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => (11, 12),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

const PREFIX_BINDING_POWER: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Bool(bool),
    Variable(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
}

/// Value produced while evaluating an expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn type_name(self) -> &'static str {
        match self {
            Value::Number(_) => "a number",
            Value::Bool(_) => "a boolean",
        }
    }
}

/// A compiled, immutable boolean expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
    variables: BTreeSet<String>,
}

impl Expression {
    /// Compile an expression such as `mean_temperature+max_temperature>35`
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let root = parser.expression(0)?;
        if let Some((token, position)) = parser.tokens.get(parser.position) {
            return Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
                position: *position,
            });
        }

        let mut variables = BTreeSet::new();
        collect_variables(&root, &mut variables);

        Ok(Self {
            source: source.to_string(),
            root,
            variables,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variable names referenced by the expression
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }

    /// Evaluate with variables resolved through `lookup`
    pub fn evaluate<F>(&self, lookup: F) -> Result<Value, ExpressionError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        eval(&self.root, &lookup)
    }

    /// Evaluate and require a boolean result
    pub fn evaluate_bool<F>(&self, lookup: F) -> Result<bool, ExpressionError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self.evaluate(lookup)? {
            Value::Bool(result) => Ok(result),
            Value::Number(_) => Err(ExpressionError::NotBoolean),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_variables(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::Variable(name) => {
            out.insert(name.clone());
        }
        Node::Unary(_, operand) => collect_variables(operand, out),
        Node::Binary(_, lhs, rhs) => {
            collect_variables(lhs, out);
            collect_variables(rhs, out);
        }
        Node::Number(_) | Node::Bool(_) => {}
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&(_, d)) = chars.peek() {
                let exponent_sign = (d == '+' || d == '-') && literal.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let number = literal
                .parse::<f64>()
                .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
            tokens.push((Token::Number(number), position));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut name = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    name.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((Token::Ident(name), position));
            continue;
        }

        chars.next();
        let next = chars.peek().map(|&(_, d)| d);
        let (token, double) = match (c, next) {
            ('>', Some('=')) => (Token::Ge, true),
            ('<', Some('=')) => (Token::Le, true),
            ('=', Some('=')) => (Token::Eq, true),
            ('!', Some('=')) => (Token::Ne, true),
            ('&', Some('&')) => (Token::And, true),
            ('|', Some('|')) => (Token::Or, true),
            ('>', _) => (Token::Gt, false),
            ('<', _) => (Token::Lt, false),
            ('=', _) => (Token::Eq, false),
            ('!', _) => (Token::Bang, false),
            ('+', _) => (Token::Plus, false),
            ('-', _) => (Token::Minus, false),
            ('*', _) => (Token::Star, false),
            ('/', _) => (Token::Slash, false),
            ('%', _) => (Token::Percent, false),
            ('(', _) => (Token::LParen, false),
            (')', _) => (Token::RParen, false),
            (found, _) => return Err(ExpressionError::UnexpectedCharacter { found, position }),
        };
        if double {
            chars.next();
        }
        tokens.push((token, position));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(token, _)| token)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        item
    }

    fn expression(&mut self, min_binding_power: u8) -> Result<Node, ExpressionError> {
        let mut lhs = self.prefix()?;

        while let Some(op) = self.peek().and_then(BinaryOp::from_token) {
            let (left, right) = op.binding_power();
            if left < min_binding_power {
                break;
            }
            self.next();
            let rhs = self.expression(right)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Node, ExpressionError> {
        let (token, position) = self.next().ok_or(ExpressionError::UnexpectedEnd)?;
        match token {
            Token::Number(n) => Ok(Node::Number(n)),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Node::Bool(true),
                "false" => Node::Bool(false),
                _ => Node::Variable(name),
            }),
            Token::Minus => {
                let operand = self.expression(PREFIX_BINDING_POWER)?;
                Ok(Node::Unary(UnaryOp::Neg, Box::new(operand)))
            }
            Token::Bang => {
                let operand = self.expression(PREFIX_BINDING_POWER)?;
                Ok(Node::Unary(UnaryOp::Not, Box::new(operand)))
            }
            Token::LParen => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((token, position)) => Err(ExpressionError::UnexpectedToken {
                        found: token.to_string(),
                        position,
                    }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            token => Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
        }
    }
}

fn eval<F>(node: &Node, lookup: &F) -> Result<Value, ExpressionError>
where
    F: Fn(&str) -> Option<f64>,
{
    match node {
        Node::Number(n) => Ok(Value::Number(*n)),
        Node::Bool(b) => Ok(Value::Bool(*b)),
        Node::Variable(name) => lookup(name)
            .map(Value::Number)
            .ok_or_else(|| ExpressionError::UnknownVariable(name.clone())),
        Node::Unary(UnaryOp::Neg, operand) => match eval(operand, lookup)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(ExpressionError::TypeMismatch {
                operator: "-",
                operand: other.type_name(),
            }),
        },
        Node::Unary(UnaryOp::Not, operand) => match eval(operand, lookup)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExpressionError::TypeMismatch {
                operator: "!",
                operand: other.type_name(),
            }),
        },
        Node::Binary(op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs) => {
            let lhs = expect_bool(*op, eval(lhs, lookup)?)?;
            // short-circuit
            match (op, lhs) {
                (BinaryOp::And, false) => Ok(Value::Bool(false)),
                (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                _ => Ok(Value::Bool(expect_bool(*op, eval(rhs, lookup)?)?)),
            }
        }
        Node::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, lookup)?;
            let rhs = eval(rhs, lookup)?;
            binary(*op, lhs, rhs)
        }
    }
}

fn expect_bool(op: BinaryOp, value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch {
            operator: op.symbol(),
            operand: other.type_name(),
        }),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExpressionError> {
    match (op, lhs, rhs) {
        (BinaryOp::Eq, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a == b)),
        (BinaryOp::Ne, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a != b)),
        (_, Value::Number(a), Value::Number(b)) => Ok(match op {
            BinaryOp::Add => Value::Number(a + b),
            BinaryOp::Sub => Value::Number(a - b),
            BinaryOp::Mul => Value::Number(a * b),
            BinaryOp::Div => Value::Number(a / b),
            BinaryOp::Rem => Value::Number(a % b),
            BinaryOp::Gt => Value::Bool(a > b),
            BinaryOp::Ge => Value::Bool(a >= b),
            BinaryOp::Lt => Value::Bool(a < b),
            BinaryOp::Le => Value::Bool(a <= b),
            BinaryOp::Eq => Value::Bool(a == b),
            BinaryOp::Ne => Value::Bool(a != b),
            BinaryOp::And | BinaryOp::Or => unreachable!("logical operators are evaluated lazily"),
        }),
        (op, Value::Bool(_), _) | (op, _, Value::Bool(_)) => Err(ExpressionError::TypeMismatch {
            operator: op.symbol(),
            operand: Value::Bool(false).type_name(),
        }),
    }
}
