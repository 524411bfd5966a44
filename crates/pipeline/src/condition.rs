//! Edge conditions and the deterministic expression language.
//!
//! An edge condition is one of three closed kinds: a deterministic
//! [`Expression`], an externally judged condition with a mandatory static
//! fallback, or a boolean composite over sub-conditions. Expressions are parsed
//! when the graph is loaded; a malformed expression is a validation error, never
//! a runtime error.
//!
//! ## Expression grammar
//!
//! ```text
//! expression := path [ operator literal ]
//! operator   := "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not in" | "contains"
//! literal    := string | number | "true" | "false" | "null" | "[" literal ("," literal)* "]"
//! path       := root ("." segment)*
//! root       := "output" | "alignment" | "run" | "nodes"
//! ```
//!
//! A bare path evaluates its truthiness. Numeric comparison of non-numbers is
//! `false`; a path that does not resolve compares as `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Condition descriptions (serde) and validated conditions
// ---------------------------------------------------------------------------

/// Condition as written in a graph description.
///
/// ```toml
/// condition = "always"
/// condition = { expression = "output.approved == false" }
/// condition = { judged = { prompt = "Does the plan need a security review?", fallback = true } }
/// condition = { any = [ { expression = "output.risk > 3" }, { expression = "alignment.aligned == false" } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionDescription {
    /// Always taken.
    #[default]
    Always,
    /// Deterministic expression.
    Expression(String),
    /// Judged by the LLM delegate.
    Judged(JudgedCondition),
    /// Conjunction, short-circuit.
    All(Vec<ConditionDescription>),
    /// Disjunction, short-circuit.
    Any(Vec<ConditionDescription>),
    /// Negation.
    Not(Box<ConditionDescription>),
}

/// A natural-language condition delegated to the LLM, with the value used when
/// the delegate is unavailable or its answer cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgedCondition {
    /// The question put to the delegate.
    pub prompt: String,
    /// Static fallback decision.
    pub fallback: bool,
}

/// A validated edge condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    Expression(Expression),
    Judged(JudgedCondition),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Parses every expression inside `description`.
    pub fn from_description(description: &ConditionDescription) -> Result<Self, ExpressionError> {
        Ok(match description {
            ConditionDescription::Always => Self::Always,
            ConditionDescription::Expression(source) => Self::Expression(Expression::parse(source)?),
            ConditionDescription::Judged(judged) => {
                if judged.prompt.trim().is_empty() {
                    return Err(ExpressionError::new("judged condition has an empty prompt"));
                }
                Self::Judged(judged.clone())
            }
            ConditionDescription::All(items) => Self::All(parse_all(items)?),
            ConditionDescription::Any(items) => Self::Any(parse_all(items)?),
            ConditionDescription::Not(inner) => Self::Not(Box::new(Self::from_description(inner)?)),
        })
    }

    /// Returns every node name referenced through `nodes.<name>` paths.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_referenced_nodes(&mut out);
        out
    }

    fn collect_referenced_nodes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Expression(expression) => {
                if let Some(node) = expression.path.referenced_node() {
                    out.push(node);
                }
            }
            Self::All(items) | Self::Any(items) => {
                for item in items {
                    item.collect_referenced_nodes(out);
                }
            }
            Self::Not(inner) => inner.collect_referenced_nodes(out),
            Self::Always | Self::Judged(_) => {}
        }
    }
}

fn parse_all(items: &[ConditionDescription]) -> Result<Vec<Condition>, ExpressionError> {
    if items.is_empty() {
        return Err(ExpressionError::new("composite condition has no sub-conditions"));
    }
    items.iter().map(Condition::from_description).collect()
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A malformed expression, reported at graph load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExpressionError {
    /// Description of the defect.
    pub message: String,
}

impl ExpressionError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Roots a field path may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// The completing node's output.
    Output,
    /// The completing node's last alignment result (`aligned`, `score`, `bias_risk`).
    Alignment,
    /// Run-wide values (`cost`, `safety_classified`).
    Run,
    /// Another node's state: `nodes.<name>.status|attempts|reworks|output...`.
    Nodes,
}

/// A dotted path into the evaluation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub root: PathRoot,
    pub segments: Vec<String>,
}

impl FieldPath {
    fn referenced_node(&self) -> Option<&str> {
        match self.root {
            PathRoot::Nodes => self.segments.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
}

/// A parsed deterministic expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    path: FieldPath,
    comparison: Option<(Operator, Value)>,
}

/// Resolves field paths against a pipeline state snapshot.
pub trait FieldResolver {
    /// Returns the value at `path`, or `None` when it does not exist.
    fn resolve(&self, path: &FieldPath) -> Option<Value>;
}

impl Expression {
    /// Parses `source`.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, position: 0 };
        let path = parser.path()?;
        let comparison = if parser.peek().is_none() {
            None
        } else {
            let operator = parser.operator()?;
            let literal = parser.literal()?;
            if matches!(operator, Operator::In | Operator::NotIn) && !literal.is_array() {
                return Err(ExpressionError::new(
                    "right-hand side of 'in' must be a list literal",
                ));
            }
            Some((operator, literal))
        };
        if parser.peek().is_some() {
            return Err(ExpressionError::new(format!(
                "unexpected trailing input in expression '{source}'"
            )));
        }
        Ok(Self {
            source: source.trim().to_string(),
            path,
            comparison,
        })
    }

    /// Returns the expression text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression. Total: never fails, never has side effects.
    pub fn evaluate(&self, resolver: &dyn FieldResolver) -> bool {
        let actual = resolver.resolve(&self.path).unwrap_or(Value::Null);
        let Some((operator, expected)) = &self.comparison else {
            return is_truthy(&actual);
        };
        match operator {
            Operator::Eq => values_equal(&actual, expected),
            Operator::Ne => !values_equal(&actual, expected),
            Operator::Lt => compare_numbers(&actual, expected, |a, b| a < b),
            Operator::Le => compare_numbers(&actual, expected, |a, b| a <= b),
            Operator::Gt => compare_numbers(&actual, expected, |a, b| a > b),
            Operator::Ge => compare_numbers(&actual, expected, |a, b| a >= b),
            Operator::In => list_contains(expected, &actual),
            Operator::NotIn => !list_contains(expected, &actual),
            Operator::Contains => match (&actual, expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(_), _) => list_contains(&actual, expected),
                _ => false,
            },
        }
    }
}

/// Looks up a dotted sequence of segments inside a JSON value. Numeric
/// segments index into arrays.
pub fn lookup<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare_numbers(left: &Value, right: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn list_contains(list: &Value, item: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|candidate| values_equal(candidate, item)),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(inner) => *inner,
        Value::String(inner) => !inner.is_empty(),
        Value::Number(inner) => inner.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(inner) => !inner.is_empty(),
        Value::Object(inner) => !inner.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Op(&'static str),
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => {
                        return Err(ExpressionError::new(format!(
                            "unexpected character '{c}' at offset {i}"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += op.len();
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        ch => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ExpressionError::new("unterminated string literal"));
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::new(format!("invalid number '{raw}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExpressionError::new(format!(
                    "unexpected character '{other}' at offset {i}"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn path(&mut self) -> Result<FieldPath, ExpressionError> {
        let Some(Token::Ident(raw)) = self.next() else {
            return Err(ExpressionError::new("expression must start with a field path"));
        };
        let mut parts = raw.split('.').map(str::to_string);
        let root = match parts.next().as_deref() {
            Some("output") => PathRoot::Output,
            Some("alignment") => PathRoot::Alignment,
            Some("run") => PathRoot::Run,
            Some("nodes") => PathRoot::Nodes,
            Some(other) => {
                return Err(ExpressionError::new(format!(
                    "unknown path root '{other}' (expected output, alignment, run or nodes)"
                )))
            }
            None => return Err(ExpressionError::new("empty field path")),
        };
        let segments: Vec<String> = parts.collect();
        if segments.iter().any(String::is_empty) {
            return Err(ExpressionError::new(format!("field path '{raw}' has an empty segment")));
        }
        if root == PathRoot::Nodes && segments.len() < 2 {
            return Err(ExpressionError::new(format!(
                "field path '{raw}' must name a node and a field"
            )));
        }
        if matches!(root, PathRoot::Alignment | PathRoot::Run) && segments.len() != 1 {
            return Err(ExpressionError::new(format!(
                "field path '{raw}' must name exactly one field"
            )));
        }
        Ok(FieldPath { root, segments })
    }

    fn operator(&mut self) -> Result<Operator, ExpressionError> {
        match self.next() {
            Some(Token::Op("==")) => Ok(Operator::Eq),
            Some(Token::Op("!=")) => Ok(Operator::Ne),
            Some(Token::Op("<")) => Ok(Operator::Lt),
            Some(Token::Op("<=")) => Ok(Operator::Le),
            Some(Token::Op(">")) => Ok(Operator::Gt),
            Some(Token::Op(">=")) => Ok(Operator::Ge),
            Some(Token::Ident(word)) if word == "in" => Ok(Operator::In),
            Some(Token::Ident(word)) if word == "contains" => Ok(Operator::Contains),
            Some(Token::Ident(word)) if word == "not" => match self.next() {
                Some(Token::Ident(next)) if next == "in" => Ok(Operator::NotIn),
                _ => Err(ExpressionError::new("expected 'in' after 'not'")),
            },
            other => Err(ExpressionError::new(format!("expected an operator, found {other:?}"))),
        }
    }

    fn literal(&mut self) -> Result<Value, ExpressionError> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Value::String(text)),
            Some(Token::Number(number)) => Ok(number_value(number)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                other => Err(ExpressionError::new(format!(
                    "bare word '{other}' is not a literal; quote strings"
                ))),
            },
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.next();
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.literal()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => return Err(ExpressionError::new("unterminated list literal")),
                    }
                }
                Ok(Value::Array(items))
            }
            other => Err(ExpressionError::new(format!("expected a literal, found {other:?}"))),
        }
    }
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::Number((number as i64).into())
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct OutputOnly(Value);

    impl FieldResolver for OutputOnly {
        fn resolve(&self, path: &FieldPath) -> Option<Value> {
            match path.root {
                PathRoot::Output => lookup(&self.0, &path.segments).cloned(),
                _ => None,
            }
        }
    }

    fn eval(source: &str, output: Value) -> bool {
        Expression::parse(source)
            .expect("expression should parse")
            .evaluate(&OutputOnly(output))
    }

    #[test]
    fn evaluate_equality_bool_expected_match() {
        assert!(eval("output.approved == false", json!({"approved": false})));
        assert!(!eval("output.approved == false", json!({"approved": true})));
    }

    #[test]
    fn evaluate_numeric_comparison_expected_numeric_semantics() {
        assert!(eval("output.risk >= 3", json!({"risk": 3.0})));
        assert!(eval("output.risk < 10", json!({"risk": 2})));
        assert!(!eval("output.risk > 1", json!({"risk": "high"})));
    }

    #[test]
    fn evaluate_membership_expected_list_semantics() {
        assert!(eval("output.class in ['safety', 'security']", json!({"class": "safety"})));
        assert!(eval("output.class not in [\"docs\"]", json!({"class": "safety"})));
        assert!(eval("output.tags contains 'urgent'", json!({"tags": ["urgent", "ui"]})));
    }

    #[test]
    fn evaluate_missing_path_expected_null_semantics() {
        assert!(eval("output.missing == null", json!({})));
        assert!(!eval("output.missing", json!({})));
        assert!(eval("output.items.0.name == 'a'", json!({"items": [{"name": "a"}]})));
    }

    #[test]
    fn parse_unknown_root_expected_error() {
        let error = Expression::parse("context.ready == true").expect_err("should fail");
        assert!(error.message.contains("unknown path root"));
    }

    #[test]
    fn parse_in_without_list_expected_error() {
        assert!(Expression::parse("output.a in 'x'").is_err());
        assert!(Expression::parse("output.a == ").is_err());
        assert!(Expression::parse("output.a == 1 extra").is_err());
        assert!(Expression::parse("output.a == bare").is_err());
    }

    #[test]
    fn condition_from_description_nested_expected_referenced_nodes() {
        let description = ConditionDescription::All(vec![
            ConditionDescription::Expression("nodes.review.status == 'completed'".into()),
            ConditionDescription::Not(Box::new(ConditionDescription::Expression(
                "output.approved".into(),
            ))),
        ]);
        let condition = Condition::from_description(&description).expect("valid");
        assert_eq!(condition.referenced_nodes(), vec!["review"]);
    }

    #[test]
    fn condition_description_toml_shapes_expected_deserialise() {
        let parsed: ConditionDescription =
            serde_json::from_value(json!({"judged": {"prompt": "needs review?", "fallback": true}}))
                .expect("judged");
        assert!(matches!(parsed, ConditionDescription::Judged(ref j) if j.fallback));
        let always: ConditionDescription = serde_json::from_value(json!("always")).expect("always");
        assert_eq!(always, ConditionDescription::Always);
    }
}
