//! Predicate expressions used for pause matching.
//!
//! Pauses carry small boolean expressions over two roots: `event.*` (the
//! run's triggering event, specialized to literals at save time) and
//! `async.*` (the incoming event being matched). The engine needs four
//! operations over them: validation, evaluation against a JSON environment,
//! interpolation of one root into literal form, and extraction of the
//! attribute subset an expression references.
//!
//! The grammar is deliberately small: `||`, `&&`, parentheses, and
//! comparisons `path op literal` with `op ∈ {==, !=, >, >=, <, <=}`.
//! Literals are `null`, booleans, numbers, and quoted strings.
//!
//! ```rust
//! use stepline::expr::Expression;
//! use serde_json::json;
//!
//! let expr = Expression::parse("async.ts == null || async.ts > 1000").unwrap();
//! assert!(expr.evaluate(&json!({"async": {"ts": 2000}})));
//! assert!(expr.evaluate(&json!({"async": {}})));
//! assert!(!expr.evaluate(&json!({"async": {"ts": 500}})));
//! ```

pub mod aggregate;

use miette::Diagnostic;
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        };
        write!(f, "{s}")
    }
}

/// Parsed expression tree.
#[derive(Clone, Debug, PartialEq)]
enum Node {
    Or(Vec<Node>),
    And(Vec<Node>),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    /// A bare operand in boolean position, e.g. `event.data.flag`.
    Truthy(Operand),
}

#[derive(Clone, Debug, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Literal(Value),
}

/// Expression errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ExprError {
    #[error("failed to compile expression {source_text:?}: {message}")]
    #[diagnostic(
        code(stepline::expr::compile),
        help("Expressions combine comparisons with && and ||, e.g. `event.data.id == \"x\" && async.ts > 0`.")
    )]
    Compile {
        source_text: String,
        message: String,
    },
}

/// A compiled predicate expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    root: Node,
}

impl Expression {
    /// Compile an expression, failing on any syntax error.
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = lex(src).map_err(|message| ExprError::Compile {
            source_text: src.to_string(),
            message,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or().map_err(|message| ExprError::Compile {
            source_text: src.to_string(),
            message: message.clone(),
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Compile {
                source_text: src.to_string(),
                message: "trailing input after expression".into(),
            });
        }
        Ok(Self { root })
    }

    /// Evaluate against a JSON environment; unresolvable paths read as null.
    #[must_use]
    pub fn evaluate(&self, env: &Value) -> bool {
        eval(&self.root, env)
    }

    /// All dotted paths the expression references, in source order.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.root, &mut out);
        out
    }

    /// Replace every path rooted at `root` with the literal value found in
    /// `data`, producing a specialized expression.
    ///
    /// Paths that do not resolve, or that resolve to non-scalar values, are
    /// left symbolic.
    #[must_use]
    pub fn interpolate(&self, root: &str, data: &Value) -> Expression {
        Expression {
            root: interpolate_node(&self.root, root, data),
        }
    }

    /// The subset of `env` the expression actually references, as a nested
    /// JSON object. This is what pauses persist as `expression_data`.
    #[must_use]
    pub fn filtered_attributes(&self, env: &Value) -> Value {
        let mut out = Value::Object(Map::new());
        for path in self.references() {
            let segments: Vec<&str> = path.split('.').collect();
            if let Some(found) = resolve(env, &segments) {
                insert_path(&mut out, &segments, found.clone());
            }
        }
        out
    }

    /// Constant equality tuples `(path, value)` from the expression's
    /// top-level conjunction. These are what the aggregate index keys on;
    /// an empty result means the expression is not indexable.
    #[must_use]
    pub fn conjunctive_equalities(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        collect_equalities(&self.root, &mut out);
        out
    }

    /// Conjoin two expressions: `(self) && (other)`.
    #[must_use]
    pub fn and(self, other: Expression) -> Expression {
        Expression {
            root: Node::And(vec![self.root, other.root]),
        }
    }

    /// Evaluate the expression to a *value* rather than a boolean.
    ///
    /// Key expressions (concurrency, throttle, priority) are usually a bare
    /// path like `event.data.customer_id`; those resolve to the referenced
    /// value. Anything else collapses to the boolean result.
    #[must_use]
    pub fn resolve_value(&self, env: &Value) -> Value {
        match &self.root {
            Node::Truthy(operand) => resolve_operand(operand, env),
            other => Value::Bool(eval(other, env)),
        }
    }
}

/// Validate without keeping the compiled form.
pub fn validate(src: &str) -> Result<(), ExprError> {
    Expression::parse(src).map(|_| ())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(f, &self.root, false)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Op(CmpOp),
    Dot,
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err("single '&' is not an operator".into());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err("single '|' is not an operator".into());
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err("assignment is not supported; use '=='".into());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err("negation is not supported".into());
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                                i += 2;
                            } else {
                                return Err("unterminated escape".into());
                            }
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(s)));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                }
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .ok_or_else(|| format!("invalid number {text:?}"))?;
                // Keep integers integral for clean round-tripping.
                let value = text
                    .parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .unwrap_or(Value::Number(number));
                tokens.push(Token::Literal(value));
            }
            _ if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "null" => tokens.push(Token::Literal(Value::Null)),
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => return Err(format!("unexpected character {c:?}")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let mut nodes = vec![self.parse_and()?];
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            nodes.push(self.parse_and()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().unwrap_or(Node::Truthy(Operand::Literal(Value::Null)))
        } else {
            Node::Or(nodes)
        })
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut nodes = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            nodes.push(self.parse_unary()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().unwrap_or(Node::Truthy(Operand::Literal(Value::Null)))
        } else {
            Node::And(nodes)
        })
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("expected ')'".into()),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Node, String> {
        let left = self.parse_operand()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.next();
                let right = self.parse_operand()?;
                Ok(Node::Compare { left, op, right })
            }
            _ => Ok(Node::Truthy(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(seg)) => segments.push(seg),
                        _ => return Err("expected identifier after '.'".into()),
                    }
                }
                Ok(Operand::Path(segments))
            }
            other => Err(format!("expected operand, found {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(node: &Node, env: &Value) -> bool {
    match node {
        Node::Or(children) => children.iter().any(|c| eval(c, env)),
        Node::And(children) => children.iter().all(|c| eval(c, env)),
        Node::Compare { left, op, right } => {
            let l = resolve_operand(left, env);
            let r = resolve_operand(right, env);
            compare(&l, *op, &r)
        }
        Node::Truthy(operand) => truthy(&resolve_operand(operand, env)),
    }
}

fn resolve_operand(operand: &Operand, env: &Value) -> Value {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Path(segments) => {
            let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
            resolve(env, &refs).cloned().unwrap_or(Value::Null)
        }
    }
}

fn resolve<'a>(env: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = env;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => json_eq(left, right),
        CmpOp::Ne => !json_eq(left, right),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                None => false,
                Some(ord) => match op {
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Eq | CmpOp::Ne => false,
                },
            }
        }
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

// ---------------------------------------------------------------------------
// Tree walks
// ---------------------------------------------------------------------------

fn collect_paths(node: &Node, out: &mut Vec<String>) {
    let mut push = |operand: &Operand| {
        if let Operand::Path(segments) = operand {
            let joined = segments.join(".");
            if !out.contains(&joined) {
                out.push(joined);
            }
        }
    };
    match node {
        Node::Or(children) | Node::And(children) => {
            for c in children {
                collect_paths(c, out);
            }
        }
        Node::Compare { left, right, .. } => {
            push(left);
            push(right);
        }
        Node::Truthy(operand) => push(operand),
    }
}

fn collect_equalities(node: &Node, out: &mut Vec<(String, Value)>) {
    match node {
        Node::And(children) => {
            for c in children {
                collect_equalities(c, out);
            }
        }
        Node::Compare {
            left: Operand::Path(path),
            op: CmpOp::Eq,
            right: Operand::Literal(v),
        }
        | Node::Compare {
            left: Operand::Literal(v),
            op: CmpOp::Eq,
            right: Operand::Path(path),
        } if !v.is_null() => {
            out.push((path.join("."), v.clone()));
        }
        _ => {}
    }
}

fn interpolate_node(node: &Node, root: &str, data: &Value) -> Node {
    let subst = |operand: &Operand| -> Operand {
        if let Operand::Path(segments) = operand {
            if segments.first().map(String::as_str) == Some(root) {
                let rest: Vec<&str> = segments[1..].iter().map(String::as_str).collect();
                if let Some(found) = resolve(data, &rest) {
                    if !found.is_object() && !found.is_array() {
                        return Operand::Literal(found.clone());
                    }
                }
            }
        }
        operand.clone()
    };
    match node {
        Node::Or(children) => Node::Or(
            children
                .iter()
                .map(|c| interpolate_node(c, root, data))
                .collect(),
        ),
        Node::And(children) => Node::And(
            children
                .iter()
                .map(|c| interpolate_node(c, root, data))
                .collect(),
        ),
        Node::Compare { left, op, right } => Node::Compare {
            left: subst(left),
            op: *op,
            right: subst(right),
        },
        Node::Truthy(operand) => Node::Truthy(subst(operand)),
    }
}

fn insert_path(target: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let map = match target {
        Value::Object(map) => map,
        _ => return,
    };
    if rest.is_empty() {
        map.insert((*first).to_string(), value);
        return;
    }
    let child = map
        .entry((*first).to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    insert_path(child, rest, value);
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, parenthesize: bool) -> fmt::Result {
    match node {
        Node::Or(children) => {
            if parenthesize {
                write!(f, "(")?;
            }
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " || ")?;
                }
                write_node(f, c, true)?;
            }
            if parenthesize {
                write!(f, ")")?;
            }
            Ok(())
        }
        Node::And(children) => {
            if parenthesize {
                write!(f, "(")?;
            }
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " && ")?;
                }
                write_node(f, c, true)?;
            }
            if parenthesize {
                write!(f, ")")?;
            }
            Ok(())
        }
        Node::Compare { left, op, right } => {
            write_operand(f, left)?;
            write!(f, " {op} ")?;
            write_operand(f, right)
        }
        Node::Truthy(operand) => write_operand(f, operand),
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Operand) -> fmt::Result {
    match operand {
        Operand::Path(segments) => write!(f, "{}", segments.join(".")),
        Operand::Literal(v) => write!(f, "{v}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_round_trips() {
        let expr = Expression::parse("(async.ts == null || async.ts > 100) && async.data.id == 'x'")
            .unwrap();
        let rendered = expr.to_string();
        let reparsed = Expression::parse(&rendered).unwrap();
        assert_eq!(expr, reparsed);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Expression::parse("async.ts = 1").is_err());
        assert!(Expression::parse("async.ts == ").is_err());
        assert!(Expression::parse("(async.ts == 1").is_err());
        assert!(Expression::parse("a == 1 extra").is_err());
    }

    #[test]
    fn evaluates_missing_paths_as_null() {
        let expr = Expression::parse("async.data.missing == null").unwrap();
        assert!(expr.evaluate(&json!({"async": {"data": {}}})));
    }

    #[test]
    fn interpolates_event_paths_into_literals() {
        let expr = Expression::parse("async.data.id == event.data.id").unwrap();
        let event = json!({"data": {"id": "abc"}});
        let specialized = expr.interpolate("event", &event);
        assert_eq!(specialized.to_string(), "async.data.id == \"abc\"");
        assert!(specialized.evaluate(&json!({"async": {"data": {"id": "abc"}}})));
    }

    #[test]
    fn filtered_attributes_keeps_only_referenced_values() {
        let expr = Expression::parse("event.data.id == 'x' && event.data.count > 2").unwrap();
        let env = json!({"event": {"data": {"id": "x", "count": 3, "noise": true}}});
        assert_eq!(
            expr.filtered_attributes(&env),
            json!({"event": {"data": {"id": "x", "count": 3}}})
        );
    }

    #[test]
    fn conjunctive_equalities_skip_disjunctions() {
        let expr =
            Expression::parse("async.data.id == 'x' && (async.a == 1 || async.b == 2)").unwrap();
        assert_eq!(
            expr.conjunctive_equalities(),
            vec![("async.data.id".to_string(), json!("x"))]
        );
    }

    #[test]
    fn numeric_comparison_coerces_int_and_float() {
        let expr = Expression::parse("async.ts > 10").unwrap();
        assert!(expr.evaluate(&json!({"async": {"ts": 10.5}})));
        assert!(!expr.evaluate(&json!({"async": {"ts": "10.5"}})));
    }
}
