//! Environment markers (`; python_version < "3.13"`) and their evaluation
//! against the target interpreter and platform.

use crate::python::PythonVersion;
use crate::version::{Specifier, Version};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid marker '{marker}': {reason}")]
pub struct MarkerError {
    pub marker: String,
    pub reason: String,
}

const VERSION_VARIABLES: [&str; 3] = [
    "python_version",
    "python_full_version",
    "implementation_version",
];

/// Values of marker variables for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEnvironment {
    values: BTreeMap<String, String>,
}

impl MarkerEnvironment {
    /// A CPython interpreter on Linux. The patch release is unknown until
    /// [`with_full_version`](Self::with_full_version) supplies it, so
    /// `python_full_version` and `implementation_version` start unset.
    pub fn linux(python: PythonVersion, arch: &str) -> Self {
        let values = [
            ("implementation_name", "cpython".to_string()),
            ("os_name", "posix".to_string()),
            ("platform_machine", arch.to_string()),
            ("platform_python_implementation", "CPython".to_string()),
            ("platform_system", "Linux".to_string()),
            ("python_version", python.to_string()),
            ("sys_platform", "linux".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { values }
    }

    /// Record the interpreter's full version, e.g. from a base image's
    /// `PYTHON_VERSION`. Ignored when it does not belong to the target
    /// `major.minor` or is not a valid version.
    pub fn with_full_version(mut self, full: &str) -> Self {
        let full = full.trim();
        let Some(python) = self.values.get("python_version") else {
            return self;
        };
        let same_minor = full == python || full.starts_with(&format!("{}.", python));
        if same_minor && Version::parse(full).is_ok() {
            for key in ["python_full_version", "implementation_version"] {
                self.values.insert(key.to_string(), full.to_string());
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerValue {
    Variable(String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Compatible,
    Arbitrary,
    In,
    NotIn,
}

impl MarkerOp {
    fn as_str(&self) -> &'static str {
        match self {
            MarkerOp::Equal => "==",
            MarkerOp::NotEqual => "!=",
            MarkerOp::Less => "<",
            MarkerOp::LessEqual => "<=",
            MarkerOp::Greater => ">",
            MarkerOp::GreaterEqual => ">=",
            MarkerOp::Compatible => "~=",
            MarkerOp::Arbitrary => "===",
            MarkerOp::In => "in",
            MarkerOp::NotIn => "not in",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerTree {
    Expression {
        left: MarkerValue,
        op: MarkerOp,
        right: MarkerValue,
    },
    And(Vec<MarkerTree>),
    Or(Vec<MarkerTree>),
}

impl MarkerTree {
    pub fn parse(raw: &str) -> Result<Self, MarkerError> {
        let error = |reason: &str| MarkerError {
            marker: raw.to_string(),
            reason: reason.to_string(),
        };
        let tokens = tokenize(raw).map_err(|r| error(&r))?;
        let mut parser = Parser { tokens, pos: 0 };
        let tree = parser.parse_or().map_err(|r| error(&r))?;
        if parser.pos != parser.tokens.len() {
            return Err(error("unexpected trailing input"));
        }
        Ok(tree)
    }

    /// Evaluate against `env`. Comparisons on variables the environment does
    /// not define hold, so such edges are kept rather than silently dropped.
    pub fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        match self {
            MarkerTree::And(items) => items.iter().all(|t| t.evaluate(env)),
            MarkerTree::Or(items) => items.iter().any(|t| t.evaluate(env)),
            MarkerTree::Expression { left, op, right } => evaluate_expression(left, *op, right, env),
        }
    }
}

fn evaluate_expression(
    left: &MarkerValue,
    op: MarkerOp,
    right: &MarkerValue,
    env: &MarkerEnvironment,
) -> bool {
    // Extras are never requested for installed dependencies.
    let resolve = |value: &MarkerValue| -> Option<String> {
        match value {
            MarkerValue::Literal(s) => Some(s.clone()),
            MarkerValue::Variable(name) if name == "extra" => Some(String::new()),
            MarkerValue::Variable(name) => env.get(name).map(String::from),
        }
    };
    let (Some(lhs), Some(rhs)) = (resolve(left), resolve(right)) else {
        return true;
    };

    let version_comparison = [left, right].iter().any(|v| {
        matches!(v, MarkerValue::Variable(name) if VERSION_VARIABLES.contains(&name.as_str()))
    });

    match op {
        MarkerOp::In => rhs.contains(&lhs),
        MarkerOp::NotIn => !rhs.contains(&lhs),
        _ if version_comparison => compare_versions(&lhs, op, &rhs)
            .unwrap_or_else(|| compare_strings(&lhs, op, &rhs)),
        _ => compare_strings(&lhs, op, &rhs),
    }
}

fn compare_versions(lhs: &str, op: MarkerOp, rhs: &str) -> Option<bool> {
    let candidate = Version::parse(lhs).ok()?;
    let specifier = Specifier::parse(&format!("{}{}", op.as_str(), rhs)).ok()?;
    Some(specifier.contains(&candidate))
}

fn compare_strings(lhs: &str, op: MarkerOp, rhs: &str) -> bool {
    match op {
        MarkerOp::Equal | MarkerOp::Arbitrary => lhs == rhs,
        MarkerOp::NotEqual => lhs != rhs,
        MarkerOp::Less => lhs < rhs,
        MarkerOp::LessEqual => lhs <= rhs,
        MarkerOp::Greater => lhs > rhs,
        MarkerOp::GreaterEqual => lhs >= rhs,
        MarkerOp::Compatible => false,
        MarkerOp::In => rhs.contains(lhs),
        MarkerOp::NotIn => !rhs.contains(lhs),
    }
}

impl fmt::Display for MarkerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerValue::Variable(name) => write!(f, "{}", name),
            MarkerValue::Literal(value) => write!(f, "'{}'", value),
        }
    }
}

impl fmt::Display for MarkerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, items: &[MarkerTree], sep: &str| {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                match item {
                    MarkerTree::Expression { .. } => write!(f, "{}", item)?,
                    _ => write!(f, "({})", item)?,
                }
            }
            Ok(())
        };
        match self {
            MarkerTree::Expression { left, op, right } => {
                write!(f, "{} {} {}", left, op.as_str(), right)
            }
            MarkerTree::And(items) => join(f, items, "and"),
            MarkerTree::Or(items) => join(f, items, "or"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Op(MarkerOp),
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(raw: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

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
                    .position(|ch| *ch == c)
                    .ok_or_else(|| "unterminated string".to_string())?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' | '~' => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let (op, len) = if rest.starts_with("===") {
                    (MarkerOp::Arbitrary, 3)
                } else if rest.starts_with("==") {
                    (MarkerOp::Equal, 2)
                } else if rest.starts_with("!=") {
                    (MarkerOp::NotEqual, 2)
                } else if rest.starts_with("<=") {
                    (MarkerOp::LessEqual, 2)
                } else if rest.starts_with(">=") {
                    (MarkerOp::GreaterEqual, 2)
                } else if rest.starts_with("~=") {
                    (MarkerOp::Compatible, 2)
                } else if rest.starts_with('<') {
                    (MarkerOp::Less, 1)
                } else if rest.starts_with('>') {
                    (MarkerOp::Greater, 1)
                } else {
                    return Err(format!("unknown operator at '{}'", rest));
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "in" => tokens.push(Token::Op(MarkerOp::In)),
                    "not" => tokens.push(Token::Op(MarkerOp::NotIn)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<MarkerTree, String> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            MarkerTree::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<MarkerTree, String> {
        let mut items = vec![self.parse_atom()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_atom()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            MarkerTree::And(items)
        })
    }

    fn parse_atom(&mut self) -> Result<MarkerTree, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing ')'".to_string()),
            };
        }

        let left = self.parse_value()?;
        let op = match self.next() {
            Some(Token::Op(MarkerOp::NotIn)) => match self.next() {
                Some(Token::Op(MarkerOp::In)) => MarkerOp::NotIn,
                _ => return Err("expected 'in' after 'not'".to_string()),
            },
            Some(Token::Op(op)) => op,
            _ => return Err("expected comparison operator".to_string()),
        };
        let right = self.parse_value()?;
        Ok(MarkerTree::Expression { left, op, right })
    }

    fn parse_value(&mut self) -> Result<MarkerValue, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(MarkerValue::Variable(name)),
            Some(Token::Str(value)) => Ok(MarkerValue::Literal(value)),
            _ => Err("expected variable or string".to_string()),
        }
    }
}
