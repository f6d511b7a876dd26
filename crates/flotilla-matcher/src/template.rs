//! `${ }` templating of helm values against the target cluster.
//!
//! A deliberately small engine: field access on the cluster context, a
//! closed set of helper functions, pipelines, and `if`/`range` blocks.
//! Unknown function names are rejected while parsing, before anything is
//! evaluated.

use std::collections::BTreeMap;

use flotilla_core::crd::{Bundle, Cluster, FleetResource as _};
use flotilla_core::patch::deep_merge;
use serde_json::{Map, Value, json};
use snafu::Snafu;

const OPEN_DELIMITER: &str = "${";
const CLOSE_DELIMITER: char = '}';

/// Literal label references substituted before templating, kept for
/// backwards compatibility.
pub const CLUSTER_LABEL_PREFIX: &str = "global.fleet.clusterLabels.";

/// Bound on label-interpolation passes.
const MAX_INTERPOLATION_DEPTH: usize = 10;

const FUNCTIONS: &[&str] = &["index", "hasKey", "upper", "join", "list", "toJson", "quote"];

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("unterminated template expression"))]
    UnterminatedExpression,

    #[snafu(display("unknown function {name:?}"))]
    UnknownFunction { name: String },

    #[snafu(display("template parse error: {message}"))]
    Parse { message: String },

    #[snafu(display("{name} called with unsupported arguments"))]
    BadArguments { name: String },

    #[snafu(display("unexpected {found:?}, expected {expected}"))]
    UnexpectedToken { found: String, expected: String },

    #[snafu(display("{keyword:?} without a matching block"))]
    UnbalancedBlock { keyword: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The object `${ }` expressions evaluate against.
pub fn template_context(cluster: &Cluster, bundle: &Bundle) -> Value {
    let mut cluster_values = Value::Object(
        cluster
            .spec
            .template_values
            .clone()
            .unwrap_or_default(),
    );
    if let Some(bundle_values) = &bundle.spec.template_values {
        deep_merge(&mut cluster_values, &Value::Object(bundle_values.clone()));
    }

    json!({
        "ClusterName": cluster.name(),
        "ClusterNamespace": cluster.namespace().unwrap_or_default(),
        "ClusterLabels": cluster.labels(),
        "ClusterAnnotations": cluster.annotations(),
        "ClusterValues": cluster_values,
    })
}

/// Replaces string leaves of the form `global.fleet.clusterLabels.<key>`
/// with the cluster's label value, bounded by a fixed recursion depth.
pub fn interpolate_labels(value: &mut Value, labels: &BTreeMap<String, String>) {
    for _ in 0..MAX_INTERPOLATION_DEPTH {
        if !interpolate_once(value, labels) {
            return;
        }
    }
}

fn interpolate_once(value: &mut Value, labels: &BTreeMap<String, String>) -> bool {
    match value {
        Value::String(leaf) => {
            if let Some(key) = leaf.strip_prefix(CLUSTER_LABEL_PREFIX) {
                if let Some(replacement) = labels.get(key) {
                    *leaf = replacement.clone();
                    return true;
                }
            }
            false
        }
        Value::Object(map) => {
            let mut changed = false;
            for entry in map.values_mut() {
                changed |= interpolate_once(entry, labels);
            }
            changed
        }
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= interpolate_once(item, labels);
            }
            changed
        }
        _ => false,
    }
}

/// Renders one template string against the context.
pub fn render(template: &str, context: &Value) -> Result<String> {
    let nodes = parse(template)?;
    let mut out = String::new();
    render_nodes(&nodes, context, context, &mut out)?;
    Ok(out)
}

/// Evaluates every string leaf of a values map that contains a template
/// expression, in place.
pub fn render_value_leaves(value: &mut Value, context: &Value) -> Result<()> {
    match value {
        Value::String(leaf) => {
            if leaf.contains(OPEN_DELIMITER) {
                *leaf = render(leaf, context)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for entry in map.values_mut() {
                render_value_leaves(entry, context)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                render_value_leaves(item, context)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Folds `templateValues` into a values map: top-level string entries are
/// rendered, their output parsed as YAML and merged; everything else merges
/// verbatim.
pub fn fold_template_values(
    values: &mut Map<String, Value>,
    template_values: &Map<String, Value>,
    context: &Value,
) -> Result<()> {
    for (key, entry) in template_values {
        let resolved = match entry {
            Value::String(template) => {
                let rendered = render(template, context)?;
                serde_yaml::from_str(&rendered).map_err(|err| Error::Parse {
                    message: format!("templateValues.{key}: {err}"),
                })?
            }
            other => other.clone(),
        };
        let mut merged = Value::Object(std::mem::take(values));
        deep_merge(&mut merged, &Value::Object(Map::from_iter([(key.clone(), resolved)])));
        if let Value::Object(map) = merged {
            *values = map;
        }
    }
    Ok(())
}

// --- parsing ---------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(Expr),
    If {
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        over: Expr,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone)]
enum Expr {
    /// `.A.B.C`; the empty path is the current value.
    Field(Vec<String>),
    Literal(Value),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Action(String),
}

fn split_segments(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN_DELIMITER) {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + OPEN_DELIMITER.len()..];

        // Find the closing brace outside string literals.
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (idx, c) in after.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == CLOSE_DELIMITER && !in_string => {
                    end = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        let end = end.ok_or(Error::UnterminatedExpression)?;
        segments.push(Segment::Action(after[..end].trim().to_string()));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

fn parse(template: &str) -> Result<Vec<Node>> {
    let segments = split_segments(template)?;
    let mut iter = segments.into_iter().peekable();
    let nodes = parse_block(&mut iter, None)?;
    if iter.next().is_some() {
        return Err(Error::UnbalancedBlock {
            keyword: "end".to_string(),
        });
    }
    Ok(nodes)
}

/// Parses until the matching `end`/`else` of the enclosing block (or until
/// the input runs out at top level).
fn parse_block(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Segment>>,
    enclosing: Option<&str>,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    while let Some(segment) = iter.peek() {
        match segment {
            Segment::Text(text) => {
                nodes.push(Node::Text(text.clone()));
                iter.next();
            }
            Segment::Action(code) => {
                let code = code.clone();
                if code == "end" || code == "else" {
                    if enclosing.is_none() {
                        return Err(Error::UnbalancedBlock { keyword: code });
                    }
                    return Ok(nodes);
                }
                iter.next();

                if let Some(cond) = code.strip_prefix("if ") {
                    let cond = parse_pipeline(cond)?;
                    let then = parse_block(iter, Some("if"))?;
                    let otherwise = match iter.next() {
                        Some(Segment::Action(tail)) if tail == "else" => {
                            let otherwise = parse_block(iter, Some("if"))?;
                            match iter.next() {
                                Some(Segment::Action(tail)) if tail == "end" => otherwise,
                                _ => {
                                    return Err(Error::UnbalancedBlock {
                                        keyword: "if".to_string(),
                                    });
                                }
                            }
                        }
                        Some(Segment::Action(tail)) if tail == "end" => Vec::new(),
                        _ => {
                            return Err(Error::UnbalancedBlock {
                                keyword: "if".to_string(),
                            });
                        }
                    };
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                } else if let Some(over) = code.strip_prefix("range ") {
                    let over = parse_pipeline(over)?;
                    let body = parse_block(iter, Some("range"))?;
                    match iter.next() {
                        Some(Segment::Action(tail)) if tail == "end" => {}
                        _ => {
                            return Err(Error::UnbalancedBlock {
                                keyword: "range".to_string(),
                            });
                        }
                    }
                    nodes.push(Node::Range { over, body });
                } else {
                    nodes.push(Node::Output(parse_pipeline(&code)?));
                }
            }
        }
    }
    if enclosing.is_some() {
        return Err(Error::UnbalancedBlock {
            keyword: "end".to_string(),
        });
    }
    Ok(nodes)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
    LParen,
    RParen,
}

fn tokenize(code: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = code.char_indices().peekable();

    while let Some(&(idx, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                tokens.push(Token::Pipe);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '"' => {
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                literal.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => literal.push(c),
                    }
                }
                if !closed {
                    return Err(Error::Parse {
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Literal(Value::String(literal)));
            }
            '.' => {
                chars.next();
                let mut path = Vec::new();
                loop {
                    let mut part = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '-' {
                            part.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if part.is_empty() {
                        break;
                    }
                    path.push(part);
                    if chars.peek().is_some_and(|&(_, c)| c == '.') {
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Field(path));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = idx;
                chars.next();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let end = chars.peek().map_or(code.len(), |&(idx, _)| idx);
                let raw = &code[start..end];
                let number: Value = serde_json::from_str(raw).map_err(|_| Error::Parse {
                    message: format!("bad number literal {raw:?}"),
                })?;
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = idx;
                chars.next();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let end = chars.peek().map_or(code.len(), |&(idx, _)| idx);
                match &code[start..end] {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    ident => tokens.push(Token::Ident(ident.to_string())),
                }
            }
            other => {
                return Err(Error::Parse {
                    message: format!("unexpected character {other:?}"),
                });
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
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// `command (| command)*`; each pipe stage receives the previous result
    /// as its final argument.
    fn pipeline(&mut self) -> Result<Expr> {
        let mut expr = self.command()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            let stage = self.command()?;
            expr = match stage {
                Expr::Call { name, mut args } => {
                    args.push(expr);
                    Expr::Call { name, args }
                }
                other => {
                    return Err(Error::UnexpectedToken {
                        found: format!("{other:?}"),
                        expected: "function after |".to_string(),
                    });
                }
            };
        }
        Ok(expr)
    }

    /// A function applied to arguments, or a bare term.
    fn command(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.next();
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(Error::UnknownFunction { name });
                }
                let mut args = Vec::new();
                while matches!(
                    self.peek(),
                    Some(Token::Field(_) | Token::Literal(_) | Token::LParen)
                ) {
                    args.push(self.term()?);
                }
                Ok(Expr::Call { name, args })
            }
            _ => self.term(),
        }
    }

    fn term(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Field(path)) => Ok(Expr::Field(path)),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.pipeline()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(Error::UnexpectedToken {
                        found: format!("{other:?}"),
                        expected: ")".to_string(),
                    }),
                }
            }
            other => Err(Error::UnexpectedToken {
                found: format!("{other:?}"),
                expected: "field, literal or (".to_string(),
            }),
        }
    }
}

fn parse_pipeline(code: &str) -> Result<Expr> {
    let tokens = tokenize(code)?;
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.pipeline()?;
    if let Some(extra) = parser.peek() {
        return Err(Error::UnexpectedToken {
            found: format!("{extra:?}"),
            expected: "end of expression".to_string(),
        });
    }
    Ok(expr)
}

// --- evaluation ------------------------------------------------------------

fn render_nodes(nodes: &[Node], context: &Value, dot: &Value, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output(expr) => {
                let value = eval(expr, context, dot)?;
                out.push_str(&stringify(&value));
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if truthy(&eval(cond, context, dot)?) {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, context, dot, out)?;
            }
            Node::Range { over, body } => match eval(over, context, dot)? {
                Value::Array(items) => {
                    for item in items {
                        render_nodes(body, context, &item, out)?;
                    }
                }
                Value::Object(map) => {
                    for value in map.values() {
                        render_nodes(body, context, value, out)?;
                    }
                }
                Value::Null => {}
                other => {
                    return Err(Error::BadArguments {
                        name: format!("range over {}", type_name(&other)),
                    });
                }
            },
        }
    }
    Ok(())
}

fn eval(expr: &Expr, context: &Value, dot: &Value) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(path) => {
            // Fields resolve on the current value; inside `range` that is
            // the element, everywhere else the cluster context.
            let mut current = dot;
            for part in path {
                current = current.get(part).unwrap_or(&Value::Null);
            }
            Ok(current.clone())
        }
        Expr::Call { name, args } => {
            let values = args
                .iter()
                .map(|arg| eval(arg, context, dot))
                .collect::<Result<Vec<_>>>()?;
            call(name, values)
        }
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    match name {
        "upper" => match args.as_slice() {
            [Value::String(s)] => Ok(Value::String(s.to_uppercase())),
            [other] => Ok(Value::String(stringify(other).to_uppercase())),
            _ => Err(Error::BadArguments { name: name.into() }),
        },
        "quote" => match args.as_slice() {
            [value] => Ok(Value::String(format!(
                "\"{}\"",
                stringify(value).replace('"', "\\\"")
            ))),
            _ => Err(Error::BadArguments { name: name.into() }),
        },
        "toJson" => match args.as_slice() {
            [value] => serde_json::to_string(value)
                .map(Value::String)
                .map_err(|_| Error::BadArguments { name: name.into() }),
            _ => Err(Error::BadArguments { name: name.into() }),
        },
        "list" => Ok(Value::Array(args)),
        "hasKey" => {
            let map = args.iter().find_map(Value::as_object);
            let key = args.iter().find_map(Value::as_str);
            match (map, key) {
                (Some(map), Some(key)) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(Error::BadArguments { name: name.into() }),
            }
        }
        "join" => {
            let sep = args
                .iter()
                .find_map(Value::as_str)
                .unwrap_or("")
                .to_string();
            let items = args
                .iter()
                .find_map(Value::as_array)
                .ok_or_else(|| Error::BadArguments { name: name.into() })?;
            Ok(Value::String(
                items
                    .iter()
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(&sep),
            ))
        }
        "index" => {
            let mut args = args.into_iter();
            let mut current = args.next().ok_or_else(|| Error::BadArguments {
                name: name.to_string(),
            })?;
            for key in args {
                current = match (&current, &key) {
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().unwrap_or(Value::Null)
                    }
                    (Value::Array(items), Value::Number(index)) => index
                        .as_u64()
                        .and_then(|index| items.get(index as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Ok(current)
        }
        _ => Err(Error::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
