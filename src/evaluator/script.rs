//! The bundled script dialect.
//!
//! Map sources are a restricted JavaScript subset: an optional
//! `function (doc) { ... }` wrapper around a sequence of `if` and
//! `emit(key, value)` statements, with expressions over the document
//! parameter (dotted field paths), literals, array literals, comparisons
//! and boolean operators. `undefined` is a first-class literal so the
//! common `doc.field !== undefined` guard works; JS truthiness applies in
//! conditions. Logical operators yield booleans, not operands.
//!
//! Reduce sources are the builtin reducer names `_count`, `_sum` and
//! `_stats`.

use serde_json::{json, Number, Value};

use super::{Emit, EvalError, Evaluator, MapFn, ReduceFn};
use crate::storage::cmp_keys;

/// Compiles the bundled dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEvaluator;

impl ScriptEvaluator {
    pub fn new() -> Self {
        ScriptEvaluator
    }
}

impl Evaluator for ScriptEvaluator {
    fn compile_map(&self, source: &str) -> Result<Box<dyn MapFn>, EvalError> {
        let program = Parser::new(source).parse_map()?;
        Ok(Box::new(program))
    }

    fn compile_reduce(&self, source: &str) -> Result<Box<dyn ReduceFn>, EvalError> {
        let reducer = match source.trim() {
            "_count" => Builtin::Count,
            "_sum" => Builtin::Sum,
            "_stats" => Builtin::Stats,
            other => {
                return Err(EvalError::Parse(format!(
                    "unknown reduce function: {:?}",
                    other
                )))
            }
        };
        Ok(Box::new(reducer))
    }
}

// ============================================================================
// Builtin reducers
// ============================================================================

enum Builtin {
    Count,
    Sum,
    Stats,
}

fn num(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

fn to_number(value: f64) -> Value {
    // Integral results stay integral so `_count` over 3 rows reads as 3.
    if value.fract() == 0.0 && value.abs() < 9e15 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl ReduceFn for Builtin {
    fn reduce(
        &self,
        _keys: &[Value],
        values: &[Value],
        rereduce: bool,
    ) -> Result<Value, EvalError> {
        match self {
            Builtin::Count => {
                if rereduce {
                    Ok(to_number(values.iter().map(num).sum()))
                } else {
                    Ok(to_number(values.len() as f64))
                }
            }
            Builtin::Sum => Ok(to_number(values.iter().map(num).sum())),
            Builtin::Stats => {
                let mut sum = 0.0;
                let mut count = 0.0;
                let mut sumsqr = 0.0;
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for value in values {
                    if rereduce {
                        sum += num(&value["sum"]);
                        count += num(&value["count"]);
                        sumsqr += num(&value["sumsqr"]);
                        min = min.min(num(&value["min"]));
                        max = max.max(num(&value["max"]));
                    } else {
                        let v = num(value);
                        sum += v;
                        count += 1.0;
                        sumsqr += v * v;
                        min = min.min(v);
                        max = max.max(v);
                    }
                }
                Ok(json!({
                    "sum": to_number(sum),
                    "count": to_number(count),
                    "sumsqr": to_number(sumsqr),
                    "min": to_number(min),
                    "max": to_number(max),
                }))
            }
        }
    }
}

// ============================================================================
// Map dialect: AST
// ============================================================================

#[derive(Debug, Clone)]
enum Stmt {
    Emit(Expr, Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Undefined,
    /// Dotted path rooted at the document parameter.
    Path(Vec<String>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct MapProgram {
    stmts: Vec<Stmt>,
}

impl MapFn for MapProgram {
    fn map(&self, doc: &Value) -> Result<Vec<Emit>, EvalError> {
        let mut emits = Vec::new();
        run_stmts(&self.stmts, doc, &mut emits)?;
        Ok(emits)
    }
}

// ============================================================================
// Map dialect: interpreter
// ============================================================================

/// `undefined` is distinct from JSON null: a missing field is undefined,
/// an explicit null is null. Emitting undefined degrades to null.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Undefined,
    Json(Value),
}

impl Slot {
    fn truthy(&self) -> bool {
        match self {
            Slot::Undefined => false,
            Slot::Json(Value::Null) => false,
            Slot::Json(Value::Bool(b)) => *b,
            Slot::Json(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Slot::Json(Value::String(s)) => !s.is_empty(),
            Slot::Json(_) => true,
        }
    }

    fn into_json(self) -> Value {
        match self {
            Slot::Undefined => Value::Null,
            Slot::Json(v) => v,
        }
    }
}

fn run_stmts(stmts: &[Stmt], doc: &Value, emits: &mut Vec<Emit>) -> Result<(), EvalError> {
    for stmt in stmts {
        match stmt {
            Stmt::Emit(key, value) => {
                let key = eval(key, doc)?.into_json();
                let value = eval(value, doc)?.into_json();
                emits.push(Emit { key, value });
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if eval(cond, doc)?.truthy() {
                    run_stmts(then, doc, emits)?;
                } else {
                    run_stmts(otherwise, doc, emits)?;
                }
            }
        }
    }
    Ok(())
}

fn eval(expr: &Expr, doc: &Value) -> Result<Slot, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(Slot::Json(v.clone())),
        Expr::Undefined => Ok(Slot::Undefined),
        Expr::Path(path) => {
            let mut cursor = doc;
            for segment in path {
                match cursor.get(segment) {
                    Some(next) => cursor = next,
                    None => return Ok(Slot::Undefined),
                }
            }
            Ok(Slot::Json(cursor.clone()))
        }
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, doc)?.into_json());
            }
            Ok(Slot::Json(Value::Array(values)))
        }
        Expr::Not(inner) => Ok(Slot::Json(Value::Bool(!eval(inner, doc)?.truthy()))),
        Expr::Neg(inner) => match eval(inner, doc)? {
            Slot::Json(Value::Number(n)) => {
                let negated = -n.as_f64().unwrap_or(0.0);
                Ok(Slot::Json(to_number(negated)))
            }
            _ => Err(EvalError::Eval("cannot negate a non-number".to_string())),
        },
        Expr::And(left, right) => Ok(Slot::Json(Value::Bool(
            eval(left, doc)?.truthy() && eval(right, doc)?.truthy(),
        ))),
        Expr::Or(left, right) => Ok(Slot::Json(Value::Bool(
            eval(left, doc)?.truthy() || eval(right, doc)?.truthy(),
        ))),
        Expr::Cmp(op, left, right) => {
            let left = eval(left, doc)?;
            let right = eval(right, doc)?;
            let result = match op {
                CmpOp::Eq => slots_equal(&left, &right),
                CmpOp::Ne => !slots_equal(&left, &right),
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match (&left, &right) {
                    (Slot::Json(a), Slot::Json(b)) => {
                        let ord = cmp_keys(a, b);
                        match op {
                            CmpOp::Lt => ord == std::cmp::Ordering::Less,
                            CmpOp::Le => ord != std::cmp::Ordering::Greater,
                            CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                            CmpOp::Ge => ord != std::cmp::Ordering::Less,
                            _ => unreachable!(),
                        }
                    }
                    // Relational comparison against undefined is false.
                    _ => false,
                },
            };
            Ok(Slot::Json(Value::Bool(result)))
        }
    }
}

fn slots_equal(a: &Slot, b: &Slot) -> bool {
    match (a, b) {
        (Slot::Undefined, Slot::Undefined) => true,
        (Slot::Json(x), Slot::Json(y)) => cmp_keys(x, y) == std::cmp::Ordering::Equal,
        _ => false,
    }
}

// ============================================================================
// Map dialect: parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Punct(&'static str),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Parser {
            tokens: tokenize(source),
            pos: 0,
        }
    }

    fn parse_map(mut self) -> Result<MapProgram, EvalError> {
        let mut param = "doc".to_string();
        let wrapped = matches!(self.peek(), Some(Token::Ident(name)) if name == "function");
        if wrapped {
            self.advance();
            self.expect_punct("(")?;
            match self.advance() {
                Some(Token::Ident(name)) => param = name,
                _ => return Err(self.unexpected("parameter name")),
            }
            self.expect_punct(")")?;
            self.expect_punct("{")?;
        }
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(Token::Punct("}")) if wrapped => break,
                _ => stmts.push(self.parse_stmt(&param)?),
            }
        }
        if wrapped {
            self.expect_punct("}")?;
        }
        if self.peek().is_some() {
            return Err(self.unexpected("end of source"));
        }
        Ok(MapProgram { stmts })
    }

    fn parse_stmt(&mut self, param: &str) -> Result<Stmt, EvalError> {
        match self.peek() {
            Some(Token::Ident(name)) if name == "if" => {
                self.advance();
                self.expect_punct("(")?;
                let cond = self.parse_expr(param)?;
                self.expect_punct(")")?;
                let then = self.parse_block_or_stmt(param)?;
                let otherwise = if matches!(self.peek(), Some(Token::Ident(n)) if n == "else") {
                    self.advance();
                    self.parse_block_or_stmt(param)?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            Some(Token::Ident(name)) if name == "emit" => {
                self.advance();
                self.expect_punct("(")?;
                let key = self.parse_expr(param)?;
                self.expect_punct(",")?;
                let value = self.parse_expr(param)?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                Ok(Stmt::Emit(key, value))
            }
            _ => Err(self.unexpected("`if` or `emit`")),
        }
    }

    fn parse_block_or_stmt(&mut self, param: &str) -> Result<Vec<Stmt>, EvalError> {
        if self.eat_punct("{") {
            let mut stmts = Vec::new();
            while !matches!(self.peek(), Some(Token::Punct("}"))) {
                if self.peek().is_none() {
                    return Err(self.unexpected("`}`"));
                }
                stmts.push(self.parse_stmt(param)?);
            }
            self.expect_punct("}")?;
            Ok(stmts)
        } else {
            Ok(vec![self.parse_stmt(param)?])
        }
    }

    fn parse_expr(&mut self, param: &str) -> Result<Expr, EvalError> {
        self.parse_or(param)
    }

    fn parse_or(&mut self, param: &str) -> Result<Expr, EvalError> {
        let mut left = self.parse_and(param)?;
        while self.eat_punct("||") {
            let right = self.parse_and(param)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, param: &str) -> Result<Expr, EvalError> {
        let mut left = self.parse_cmp(param)?;
        while self.eat_punct("&&") {
            let right = self.parse_cmp(param)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self, param: &str) -> Result<Expr, EvalError> {
        let left = self.parse_unary(param)?;
        let op = match self.peek() {
            Some(Token::Punct("===")) | Some(Token::Punct("==")) => CmpOp::Eq,
            Some(Token::Punct("!==")) | Some(Token::Punct("!=")) => CmpOp::Ne,
            Some(Token::Punct("<")) => CmpOp::Lt,
            Some(Token::Punct("<=")) => CmpOp::Le,
            Some(Token::Punct(">")) => CmpOp::Gt,
            Some(Token::Punct(">=")) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary(param)?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self, param: &str) -> Result<Expr, EvalError> {
        if self.eat_punct("!") {
            return Ok(Expr::Not(Box::new(self.parse_unary(param)?)));
        }
        if self.eat_punct("-") {
            return Ok(Expr::Neg(Box::new(self.parse_unary(param)?)));
        }
        self.parse_primary(param)
    }

    fn parse_primary(&mut self, param: &str) -> Result<Expr, EvalError> {
        match self.advance() {
            Some(Token::Punct("(")) => {
                let inner = self.parse_expr(param)?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::Punct("]"))) {
                    loop {
                        items.push(self.parse_expr(param)?);
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::Array(items))
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(to_number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "null" => Ok(Expr::Literal(Value::Null)),
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "undefined" => Ok(Expr::Undefined),
                _ if name == param => {
                    let mut path = Vec::new();
                    while self.eat_punct(".") {
                        match self.advance() {
                            Some(Token::Ident(segment)) => path.push(segment),
                            _ => return Err(self.unexpected("field name")),
                        }
                    }
                    Ok(Expr::Path(path))
                }
                other => Err(EvalError::Parse(format!(
                    "unknown identifier: {:?}",
                    other
                ))),
            },
            _ => Err(self.unexpected("expression")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), EvalError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", punct)))
        }
    }

    fn unexpected(&self, wanted: &str) -> EvalError {
        match self.peek() {
            Some(token) => EvalError::Parse(format!("expected {}, found {:?}", wanted, token)),
            None => EvalError::Parse(format!("expected {}, found end of source", wanted)),
        }
    }
}

const PUNCTS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "{", "}", "[", "]", ",", ";",
    ".", "!", "<", ">", "-",
];

fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(text.parse().unwrap_or(f64::NAN)));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut text = String::new();
            while i < chars.len() && chars[i] != quote {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                    text.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    text.push(chars[i]);
                }
                i += 1;
            }
            i += 1; // closing quote
            tokens.push(Token::Str(text));
            continue;
        }
        for punct in PUNCTS.iter().copied() {
            if chars[i..].iter().collect::<String>().starts_with(punct) {
                tokens.push(Token::Punct(punct));
                i += punct.len();
                continue 'outer;
            }
        }
        // Unknown character: emit an impossible punct so parsing fails
        // with a position-bearing error instead of silently skipping.
        tokens.push(Token::Str(format!("\u{0}{}", c)));
        i += 1;
    }
    tokens
}
