//! Expression parser and evaluator for workflow conditions and templates.
//!
//! Expressions reference run state through a read-only JSON context object
//! (`inputs`, `steps.<name>.output`, the innermost loop frame's `item` and
//! `index`, `workflow`). The grammar is deliberately small:
//!
//! - literals: strings, numbers, booleans, `null`, `[a, b, c]`
//! - dotted property access and `[...]` indexing
//! - comparisons: `==`, `!=`, `<`, `>`, `<=`, `>=`, `in`, `not in`
//! - boolean operators: `and`, `or`, `not` (short-circuit, JS truthiness)
//! - conditional: `value if condition else fallback`
//!
//! Identifiers may contain hyphens (step names like `open-pr`); there is no
//! arithmetic, so `a-b` is a single identifier.
//!
//! Evaluation is pure: identical `(expression, context)` pairs always produce
//! identical results. A reference to a step name absent from the context is an
//! authoring error and fails with [`ExpressionError::UnknownStep`] -- it never
//! degrades to `null`. Missing leaf properties on an existing object evaluate
//! to `null` (payload shapes vary between handlers).

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression syntax error: {0}")]
    Syntax(String),

    #[error("unknown identifier '{0}' in expression context")]
    UnknownIdentifier(String),

    #[error("expression references unknown step '{0}'")]
    UnknownStep(String),

    #[error("expression type error: {0}")]
    Type(String),
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    If,
    Else,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Dot,
    Comma,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax(
                        "single '=' is not an operator (use '==')".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax(
                        "'!' is not an operator (use 'not')".to_string(),
                    ));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExpressionError::Syntax(
                                "unterminated string literal".to_string(),
                            ));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                ExpressionError::Syntax("dangling escape in string".to_string())
                            })?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot followed by a non-digit is member access, not a decimal point
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    ExpressionError::Syntax(format!("invalid number literal '{text}'"))
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch.is_alphanumeric() || ch == '_' {
                        i += 1;
                    } else if ch == '-' && chars.get(i + 1).is_some_and(|c| c.is_alphanumeric()) {
                        // hyphenated identifiers (step names); no subtraction exists
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExpressionError::Syntax(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    /// `base.field`
    Member(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `[a, b, c]`
    List(Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `value if cond else fallback`
    Conditional {
        value: Box<Expr>,
        cond: Box<Expr>,
        fallback: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Parser (recursive descent)
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
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

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExpressionError::Syntax(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    /// expr := or_expr ("if" or_expr "else" expr)?
    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let value = self.or_expr()?;
        if self.eat(&Token::If) {
            let cond = self.or_expr()?;
            self.expect(Token::Else)?;
            let fallback = self.expr()?;
            Ok(Expr::Conditional {
                value: Box::new(value),
                cond: Box::new(cond),
                fallback: Box::new(fallback),
            })
        } else {
            Ok(value)
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.not_expr()?)))
        } else {
            self.comparison()
        }
    }

    /// comparison := postfix (cmp_op postfix)?
    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.postfix()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinOp::Eq),
            Some(Token::Ne) => Some(BinOp::Ne),
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Ge) => Some(BinOp::Ge),
            Some(Token::In) => Some(BinOp::In),
            // `a not in b`
            Some(Token::Not) if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                self.pos += 1;
                Some(BinOp::NotIn)
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.postfix()?;
                Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(field)) => {
                        expr = Expr::Member(Box::new(expr), field);
                    }
                    other => {
                        return Err(ExpressionError::Syntax(format!(
                            "expected property name after '.', found {other:?}"
                        )));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(json!(n))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Num(n)) => Ok(Expr::Literal(json!(-n))),
                other => Err(ExpressionError::Syntax(format!(
                    "expected number after '-', found {other:?}"
                ))),
            },
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(ExpressionError::Syntax(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Parse an expression string into an AST.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    if input.trim().is_empty() {
        return Err(ExpressionError::Syntax("empty expression".to_string()));
    }
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExpressionError::Syntax(format!(
            "trailing tokens after expression: {:?}",
            parser.tokens[parser.pos..].to_vec()
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// AST inspection (used by the validator)
// ---------------------------------------------------------------------------

/// Collect every `steps.<name>` reference in the expression.
pub fn referenced_steps(expr: &Expr) -> Vec<String> {
    let mut refs = Vec::new();
    collect_step_refs(expr, &mut refs);
    refs
}

fn collect_step_refs(expr: &Expr, refs: &mut Vec<String>) {
    match expr {
        Expr::Member(base, field) => {
            if matches!(base.as_ref(), Expr::Ident(root) if root == "steps") {
                refs.push(field.clone());
            }
            collect_step_refs(base, refs);
        }
        Expr::Index(base, index) => {
            if matches!(base.as_ref(), Expr::Ident(root) if root == "steps") {
                if let Expr::Literal(Value::String(name)) = index.as_ref() {
                    refs.push(name.clone());
                }
            }
            collect_step_refs(base, refs);
            collect_step_refs(index, refs);
        }
        Expr::List(items) => {
            for item in items {
                collect_step_refs(item, refs);
            }
        }
        Expr::Not(inner) => collect_step_refs(inner, refs),
        Expr::Binary(_, left, right) => {
            collect_step_refs(left, refs);
            collect_step_refs(right, refs);
        }
        Expr::Conditional {
            value,
            cond,
            fallback,
        } => {
            collect_step_refs(value, refs);
            collect_step_refs(cond, refs);
            collect_step_refs(fallback, refs);
        }
        Expr::Literal(_) | Expr::Ident(_) => {}
    }
}

/// Whether the expression reads the loop variables `item` or `index`.
pub fn uses_loop_variables(expr: &Expr, item_var: &str) -> bool {
    match expr {
        Expr::Ident(name) => name == item_var || name == "index" || name == "item",
        Expr::Member(base, _) => uses_loop_variables(base, item_var),
        Expr::Index(base, index) => {
            uses_loop_variables(base, item_var) || uses_loop_variables(index, item_var)
        }
        Expr::List(items) => items.iter().any(|e| uses_loop_variables(e, item_var)),
        Expr::Not(inner) => uses_loop_variables(inner, item_var),
        Expr::Binary(_, left, right) => {
            uses_loop_variables(left, item_var) || uses_loop_variables(right, item_var)
        }
        Expr::Conditional {
            value,
            cond,
            fallback,
        } => {
            uses_loop_variables(value, item_var)
                || uses_loop_variables(cond, item_var)
                || uses_loop_variables(fallback, item_var)
        }
        Expr::Literal(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Pure expression evaluator over a JSON context object.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression string against a context object.
    pub fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        let expr = parse(expression)?;
        self.eval(&expr, context)
    }

    /// Evaluate and coerce to boolean with JS-like truthiness.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate(expression, context)?))
    }

    /// Evaluate a parsed AST against a context object.
    pub fn eval(&self, expr: &Expr, context: &Value) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => match context.get(name.as_str()) {
                Some(value) => Ok(value.clone()),
                None => Err(ExpressionError::UnknownIdentifier(name.clone())),
            },
            Expr::Member(base, field) => self.access(base, field, context),
            Expr::Index(base, index) => {
                let index_value = self.eval(index, context)?;
                match &index_value {
                    Value::String(field) => self.access(base, field, context),
                    Value::Number(n) => {
                        let base_value = self.eval(base, context)?;
                        let idx = n.as_f64().unwrap_or(-1.0);
                        if idx < 0.0 || idx.fract() != 0.0 {
                            return Err(ExpressionError::Type(format!(
                                "invalid array index {idx}"
                            )));
                        }
                        match base_value {
                            Value::Array(items) => {
                                Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
                            }
                            other => Err(ExpressionError::Type(format!(
                                "cannot index {} with a number",
                                type_name(&other)
                            ))),
                        }
                    }
                    other => Err(ExpressionError::Type(format!(
                        "invalid index type {}",
                        type_name(other)
                    ))),
                }
            }
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, context)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner, context)?))),
            Expr::Binary(op, left, right) => self.binary(*op, left, right, context),
            Expr::Conditional {
                value,
                cond,
                fallback,
            } => {
                if truthy(&self.eval(cond, context)?) {
                    self.eval(value, context)
                } else {
                    self.eval(fallback, context)
                }
            }
        }
    }

    /// Property access with the unknown-step special case.
    ///
    /// `steps.<name>` for a name not present in the context is an authoring
    /// error; any other missing property evaluates to null.
    fn access(&self, base: &Expr, field: &str, context: &Value) -> Result<Value, ExpressionError> {
        let is_steps_root = matches!(base, Expr::Ident(root) if root == "steps");
        let base_value = self.eval(base, context)?;
        match base_value.get(field) {
            Some(value) => Ok(value.clone()),
            None if is_steps_root => Err(ExpressionError::UnknownStep(field.to_string())),
            None => Ok(Value::Null),
        }
    }

    fn binary(
        &self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        // Short-circuit boolean operators first
        match op {
            BinOp::And => {
                let l = self.eval(left, context)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(truthy(&self.eval(right, context)?)));
            }
            BinOp::Or => {
                let l = self.eval(left, context)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(truthy(&self.eval(right, context)?)));
            }
            _ => {}
        }

        let l = self.eval(left, context)?;
        let r = self.eval(right, context)?;
        let result = match op {
            BinOp::Eq => values_equal(&l, &r),
            BinOp::Ne => !values_equal(&l, &r),
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let ordering = compare_values(&l, &r)?;
                match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                }
            }
            BinOp::In => contains(&r, &l)?,
            BinOp::NotIn => !contains(&r, &l)?,
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        Ok(Value::Bool(result))
    }
}

// ---------------------------------------------------------------------------
// Template interpolation
// ---------------------------------------------------------------------------

impl Evaluator {
    /// Resolve `{{ expr }}` markers in a template string.
    ///
    /// A template that is exactly one marker yields the evaluated value with
    /// its JSON type intact; markers embedded in surrounding text are
    /// stringified in place. Strings without markers pass through untouched.
    pub fn render_template(
        &self,
        template: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        let spans = template_spans(template)?;
        if spans.is_empty() {
            return Ok(Value::String(template.to_string()));
        }

        // Whole-string marker: preserve the value's type
        let trimmed = template.trim();
        if spans.len() == 1 {
            let (start, end, expr) = &spans[0];
            if trimmed == &template[*start..*end] {
                return self.evaluate(expr, context);
            }
        }

        let mut result = String::new();
        let mut last = 0;
        for (start, end, expr) in &spans {
            result.push_str(&template[last..*start]);
            let value = self.evaluate(expr, context)?;
            result.push_str(&value_to_string(&value));
            last = *end;
        }
        result.push_str(&template[last..]);
        Ok(Value::String(result))
    }

    /// Recursively resolve templates in every string of a JSON value.
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.render_template(s, context),
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.render_value(item, context)?);
                }
                Ok(Value::Array(rendered))
            }
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    rendered.insert(key.clone(), self.render_value(val, context)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Extract the inner expressions of every `{{ ... }}` marker in a template.
pub fn template_expressions(template: &str) -> Result<Vec<String>, ExpressionError> {
    Ok(template_spans(template)?
        .into_iter()
        .map(|(_, _, expr)| expr)
        .collect())
}

/// Locate `{{ ... }}` spans as (start, end, inner expression).
fn template_spans(template: &str) -> Result<Vec<(usize, usize, String)>, ExpressionError> {
    let mut spans = Vec::new();
    let mut search = 0;
    while let Some(rel_start) = template[search..].find("{{") {
        let start = search + rel_start;
        let Some(rel_end) = template[start..].find("}}") else {
            return Err(ExpressionError::Syntax(format!(
                "unclosed '{{{{' in template: {template}"
            )));
        };
        let end = start + rel_end + 2;
        let inner = template[start + 2..end - 2].trim().to_string();
        spans.push((start, end, inner));
        search = end;
    }
    Ok(spans)
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// JS-like truthiness coercion.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Convert a value to a display string for template interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays interpolate as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality with numeric comparison across integer/float representations.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            l.partial_cmp(&r).ok_or_else(|| {
                ExpressionError::Type("cannot order NaN".to_string())
            })
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (l, r) => Err(ExpressionError::Type(format!(
            "cannot order {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

/// Membership test for the `in` operator.
fn contains(container: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(haystack) => match needle {
            Value::String(sub) => Ok(haystack.contains(sub.as_str())),
            other => Err(ExpressionError::Type(format!(
                "cannot search a string for {}",
                type_name(other)
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key.as_str())),
            other => Err(ExpressionError::Type(format!(
                "object membership requires a string key, got {}",
                type_name(other)
            ))),
        },
        other => Err(ExpressionError::Type(format!(
            "'in' requires an array, string, or object, got {}",
            type_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
