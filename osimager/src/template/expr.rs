//! A small, sandboxed expression evaluator for template conditionals.
//!
//! The grammar covers the corpus of expressions that actually appear in spec
//! files: literals, defs names, arithmetic, comparisons, boolean operators,
//! the conditional form `a if cond else b`, membership (`in`), and the string
//! helpers `startswith`/`endswith`/`len`.  Anything else is rejected at parse
//! time; there is deliberately no general-purpose interpreter here.

use serde_json::{Map, Value};
use snafu::{ensure, OptionExt};
use std::fmt;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unexpected character '{}' at offset {}", ch, offset))]
        UnexpectedChar { ch: char, offset: usize },

        #[snafu(display("Unterminated string literal starting at offset {}", offset))]
        UnterminatedString { offset: usize },

        #[snafu(display("Unexpected token '{}'", token))]
        UnexpectedToken { token: String },

        #[snafu(display("Expression ended unexpectedly"))]
        UnexpectedEnd,

        #[snafu(display("'{}' is not defined", name))]
        UnknownName { name: String },

        #[snafu(display("Operator '{}' cannot be applied to {} and {}", op, left, right))]
        BadOperands {
            op: &'static str,
            left: &'static str,
            right: &'static str,
        },

        #[snafu(display("'{}' expects {}", what, expects))]
        BadCall {
            what: &'static str,
            expects: &'static str,
        },

        #[snafu(display("Division by zero"))]
        DivisionByZero,

        #[snafu(display("Result '{}' is not an integer", value))]
        NotAnInteger { value: String },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

/// The value domain of the evaluator.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ExprValue>),
}

impl ExprValue {
    fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Bool(_) => "bool",
            ExprValue::Int(_) => "int",
            ExprValue::Float(_) => "float",
            ExprValue::Str(_) => "string",
            ExprValue::List(_) => "list",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Int(n) => *n != 0,
            ExprValue::Float(f) => *f != 0.0,
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::List(l) => !l.is_empty(),
        }
    }

    fn from_json(value: &Value) -> Option<ExprValue> {
        match value {
            Value::Bool(b) => Some(ExprValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ExprValue::Int(i))
                } else {
                    n.as_f64().map(ExprValue::Float)
                }
            }
            Value::String(s) => Some(ExprValue::Str(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(ExprValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ExprValue::List),
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Converts back into the JSON value model for the template walker.
    pub fn into_json(self) -> Value {
        match self {
            ExprValue::Bool(b) => Value::Bool(b),
            ExprValue::Int(n) => Value::from(n),
            ExprValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ExprValue::Str(s) => Value::String(s),
            ExprValue::List(items) => {
                Value::Array(items.into_iter().map(ExprValue::into_json).collect())
            }
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Bool(b) => write!(f, "{}", b),
            ExprValue::Int(n) => write!(f, "{}", n),
            ExprValue::Float(x) => write!(f, "{}", x),
            ExprValue::Str(s) => write!(f, "{}", s),
            ExprValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

/// Evaluates an expression against the defs bindings.
pub fn evaluate(source: &str, defs: &Map<String, Value>) -> Result<ExprValue> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.ternary(defs)?;
    ensure!(
        parser.pos == parser.tokens.len(),
        error::UnexpectedTokenSnafu {
            token: parser.tokens[parser.pos].describe(),
        }
    );
    Ok(value)
}

/// Evaluates an arithmetic expression and requires an integer result.
pub fn evaluate_numeric(source: &str, defs: &Map<String, Value>) -> Result<i64> {
    match evaluate(source, defs)? {
        ExprValue::Int(n) => Ok(n),
        ExprValue::Float(f) if f.fract() == 0.0 => Ok(f as i64),
        other => error::NotAnIntegerSnafu {
            value: other.to_string(),
        }
        .fail(),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Dot,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Int(n) => n.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(s) => format!("'{}'", s),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Le => "<=".into(),
            Token::Ge => ">=".into(),
            Token::Lt => "<".into(),
            Token::Gt => ">".into(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if i + 1 < chars.len() && chars[i + 1].is_ascii_alphabetic() => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
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
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return error::UnterminatedStringSnafu { offset: start }.fail(),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' => {
                let start = i;
                let mut saw_dot = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !saw_dot))
                {
                    if chars[i] == '.' {
                        saw_dot = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if saw_dot {
                    let f = text
                        .parse::<f64>()
                        .ok()
                        .context(error::UnexpectedTokenSnafu { token: text.clone() })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n = text
                        .parse::<i64>()
                        .ok()
                        .context(error::UnexpectedTokenSnafu { token: text.clone() })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return error::UnexpectedCharSnafu { ch: other, offset: i }.fail(),
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

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .context(error::UnexpectedEndSnafu)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        let found = self.next()?;
        ensure!(
            found == token,
            error::UnexpectedTokenSnafu {
                token: found.describe(),
            }
        );
        Ok(())
    }

    /// `value_if_true if condition else value_if_false`
    fn ternary(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let value = self.or_expr(defs)?;
        if self.eat_ident("if") {
            let condition = self.or_expr(defs)?;
            ensure!(
                self.eat_ident("else"),
                error::UnexpectedTokenSnafu {
                    token: self
                        .peek()
                        .map(Token::describe)
                        .unwrap_or_else(|| "end of expression".to_string()),
                }
            );
            let fallback = self.ternary(defs)?;
            return Ok(if condition.truthy() { value } else { fallback });
        }
        Ok(value)
    }

    fn or_expr(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let mut value = self.and_expr(defs)?;
        while self.eat_ident("or") {
            let rhs = self.and_expr(defs)?;
            value = ExprValue::Bool(value.truthy() || rhs.truthy());
        }
        Ok(value)
    }

    fn and_expr(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let mut value = self.not_expr(defs)?;
        while self.eat_ident("and") {
            let rhs = self.not_expr(defs)?;
            value = ExprValue::Bool(value.truthy() && rhs.truthy());
        }
        Ok(value)
    }

    fn not_expr(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        if self.eat_ident("not") {
            let value = self.not_expr(defs)?;
            return Ok(ExprValue::Bool(!value.truthy()));
        }
        self.comparison(defs)
    }

    fn comparison(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let left = self.additive(defs)?;

        let op = match self.peek() {
            Some(Token::Eq) => "==",
            Some(Token::Ne) => "!=",
            Some(Token::Le) => "<=",
            Some(Token::Ge) => ">=",
            Some(Token::Lt) => "<",
            Some(Token::Gt) => ">",
            Some(Token::Ident(w)) if w == "in" => "in",
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive(defs)?;
        compare(op, left, right)
    }

    fn additive(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let mut value = self.term(defs)?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value = add(value, self.term(defs)?)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value = arith("-", value, self.term(defs)?)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let mut value = self.unary(defs)?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value = arith("*", value, self.unary(defs)?)?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value = arith("/", value, self.unary(defs)?)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return match self.unary(defs)? {
                ExprValue::Int(n) => Ok(ExprValue::Int(-n)),
                ExprValue::Float(f) => Ok(ExprValue::Float(-f)),
                other => error::BadOperandsSnafu {
                    op: "-",
                    left: "unary",
                    right: other.type_name(),
                }
                .fail(),
            };
        }
        self.postfix(defs)
    }

    /// Method-call form of the string helpers: `name.startswith('x')`.
    fn postfix(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        let mut value = self.primary(defs)?;
        while matches!(self.peek(), Some(Token::Dot)) {
            self.pos += 1;
            let method = match self.next()? {
                Token::Ident(name) => name,
                other => {
                    return error::UnexpectedTokenSnafu {
                        token: other.describe(),
                    }
                    .fail()
                }
            };
            self.expect(Token::LParen)?;
            let arg = self.ternary(defs)?;
            self.expect(Token::RParen)?;

            let (subject, probe) = match (&value, &arg) {
                (ExprValue::Str(s), ExprValue::Str(p)) => (s.clone(), p.clone()),
                _ => {
                    return error::BadCallSnafu {
                        what: "startswith/endswith",
                        expects: "a string subject and a string argument",
                    }
                    .fail()
                }
            };
            value = match method.as_str() {
                "startswith" => ExprValue::Bool(subject.starts_with(&probe)),
                "endswith" => ExprValue::Bool(subject.ends_with(&probe)),
                _ => {
                    return error::UnexpectedTokenSnafu { token: method }.fail();
                }
            };
        }
        Ok(value)
    }

    fn primary(&mut self, defs: &Map<String, Value>) -> Result<ExprValue> {
        match self.next()? {
            Token::Int(n) => Ok(ExprValue::Int(n)),
            Token::Float(f) => Ok(ExprValue::Float(f)),
            Token::Str(s) => Ok(ExprValue::Str(s)),
            Token::LParen => {
                let value = self.ternary(defs)?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Token::Ident(name) => match name.as_str() {
                "True" | "true" => Ok(ExprValue::Bool(true)),
                "False" | "false" => Ok(ExprValue::Bool(false)),
                "len" => {
                    self.expect(Token::LParen)?;
                    let arg = self.ternary(defs)?;
                    self.expect(Token::RParen)?;
                    match arg {
                        ExprValue::Str(s) => Ok(ExprValue::Int(s.chars().count() as i64)),
                        ExprValue::List(l) => Ok(ExprValue::Int(l.len() as i64)),
                        _ => error::BadCallSnafu {
                            what: "len",
                            expects: "a string or list",
                        }
                        .fail(),
                    }
                }
                "startswith" | "endswith" => {
                    // Function-call form: startswith(subject, prefix)
                    let helper = name.clone();
                    self.expect(Token::LParen)?;
                    let subject = self.ternary(defs)?;
                    self.expect(Token::Comma)?;
                    let probe = self.ternary(defs)?;
                    self.expect(Token::RParen)?;
                    match (subject, probe) {
                        (ExprValue::Str(s), ExprValue::Str(p)) => {
                            if helper == "startswith" {
                                Ok(ExprValue::Bool(s.starts_with(&p)))
                            } else {
                                Ok(ExprValue::Bool(s.ends_with(&p)))
                            }
                        }
                        _ => error::BadCallSnafu {
                            what: "startswith/endswith",
                            expects: "a string subject and a string argument",
                        }
                        .fail(),
                    }
                }
                _ => {
                    let value = defs
                        .get(&name)
                        .context(error::UnknownNameSnafu { name: name.clone() })?;
                    ExprValue::from_json(value).context(error::UnknownNameSnafu { name })
                }
            },
            other => error::UnexpectedTokenSnafu {
                token: other.describe(),
            }
            .fail(),
        }
    }
}

fn add(left: ExprValue, right: ExprValue) -> Result<ExprValue> {
    match (&left, &right) {
        (ExprValue::Str(a), ExprValue::Str(b)) => Ok(ExprValue::Str(format!("{}{}", a, b))),
        (ExprValue::List(a), ExprValue::List(b)) => {
            let mut joined = a.clone();
            joined.extend(b.clone());
            Ok(ExprValue::List(joined))
        }
        _ => arith("+", left, right),
    }
}

fn arith(op: &'static str, left: ExprValue, right: ExprValue) -> Result<ExprValue> {
    match (&left, &right) {
        (ExprValue::Int(a), ExprValue::Int(b)) => {
            let (a, b) = (*a, *b);
            Ok(ExprValue::Int(match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                _ => {
                    ensure!(b != 0, error::DivisionByZeroSnafu);
                    a / b
                }
            }))
        }
        (ExprValue::Int(_) | ExprValue::Float(_), ExprValue::Int(_) | ExprValue::Float(_)) => {
            let a = match &left {
                ExprValue::Int(n) => *n as f64,
                ExprValue::Float(f) => *f,
                _ => unreachable!(),
            };
            let b = match &right {
                ExprValue::Int(n) => *n as f64,
                ExprValue::Float(f) => *f,
                _ => unreachable!(),
            };
            Ok(ExprValue::Float(match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                _ => {
                    ensure!(b != 0.0, error::DivisionByZeroSnafu);
                    a / b
                }
            }))
        }
        _ => error::BadOperandsSnafu {
            op,
            left: left.type_name(),
            right: right.type_name(),
        }
        .fail(),
    }
}

fn compare(op: &'static str, left: ExprValue, right: ExprValue) -> Result<ExprValue> {
    use std::cmp::Ordering;

    if op == "in" {
        return match (&left, &right) {
            (ExprValue::Str(needle), ExprValue::Str(haystack)) => {
                Ok(ExprValue::Bool(haystack.contains(needle.as_str())))
            }
            (needle, ExprValue::List(items)) => Ok(ExprValue::Bool(items.contains(needle))),
            _ => error::BadOperandsSnafu {
                op,
                left: left.type_name(),
                right: right.type_name(),
            }
            .fail(),
        };
    }

    let ordering: Option<Ordering> = match (&left, &right) {
        (ExprValue::Int(a), ExprValue::Int(b)) => Some(a.cmp(b)),
        (ExprValue::Int(_) | ExprValue::Float(_), ExprValue::Int(_) | ExprValue::Float(_)) => {
            let a = match &left {
                ExprValue::Int(n) => *n as f64,
                ExprValue::Float(f) => *f,
                _ => unreachable!(),
            };
            let b = match &right {
                ExprValue::Int(n) => *n as f64,
                ExprValue::Float(f) => *f,
                _ => unreachable!(),
            };
            a.partial_cmp(&b)
        }
        (ExprValue::Str(a), ExprValue::Str(b)) => Some(a.cmp(b)),
        (ExprValue::Bool(a), ExprValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        "==" => Ok(ExprValue::Bool(ordering == Some(Ordering::Equal) || left == right)),
        "!=" => Ok(ExprValue::Bool(!(ordering == Some(Ordering::Equal) || left == right))),
        _ => {
            let ordering = ordering.context(error::BadOperandsSnafu {
                op,
                left: left.type_name(),
                right: right.type_name(),
            })?;
            Ok(ExprValue::Bool(match op {
                "<" => ordering == Ordering::Less,
                "<=" => ordering != Ordering::Greater,
                ">" => ordering == Ordering::Greater,
                ">=" => ordering != Ordering::Less,
                _ => unreachable!(),
            }))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn defs() -> Map<String, Value> {
        json!({
            "major": 9,
            "minor": 5,
            "dist": "rhel",
            "arch": "x86_64",
            "memory_mb": 2048,
            "dns": ["10.0.0.2", "10.0.0.3"],
            "thin_disk": false,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn conditional_expression() {
        let v = evaluate("'efi' if major >= 7 else 'bios'", &defs()).unwrap();
        assert_eq!(v, ExprValue::Str("efi".into()));
        let mut d = defs();
        d.insert("major".into(), json!(6));
        let v = evaluate("'efi' if major >= 7 else 'bios'", &d).unwrap();
        assert_eq!(v, ExprValue::Str("bios".into()));
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(evaluate("1 + 2 * 3", &defs()).unwrap(), ExprValue::Int(7));
        assert_eq!(evaluate("(1 + 2) * 3", &defs()).unwrap(), ExprValue::Int(9));
        assert_eq!(
            evaluate("memory_mb / 2", &defs()).unwrap(),
            ExprValue::Int(1024)
        );
    }

    #[test]
    fn string_helpers_both_forms() {
        assert_eq!(
            evaluate("dist.startswith('rh')", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
        assert_eq!(
            evaluate("endswith(arch, '_64')", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
        assert_eq!(evaluate("len(dns)", &defs()).unwrap(), ExprValue::Int(2));
        assert_eq!(evaluate("len('abc')", &defs()).unwrap(), ExprValue::Int(3));
    }

    #[test]
    fn membership() {
        assert_eq!(
            evaluate("'10.0.0.2' in dns", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
        assert_eq!(
            evaluate("'86' in arch", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
    }

    #[test]
    fn boolean_logic() {
        assert_eq!(
            evaluate("major == 9 and not thin_disk", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
        assert_eq!(
            evaluate("dist == 'sles' or dist == 'rhel'", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
    }

    #[test]
    fn float_comparison() {
        assert_eq!(
            evaluate("9.5 >= 7", &defs()).unwrap(),
            ExprValue::Bool(true)
        );
    }

    #[test]
    fn unknown_name_errors() {
        assert!(matches!(
            evaluate("nonesuch + 1", &defs()).unwrap_err(),
            Error::UnknownName { .. }
        ));
    }

    #[test]
    fn numeric_helper_requires_integer() {
        assert_eq!(evaluate_numeric("major + minor", &defs()).unwrap(), 14);
        assert!(matches!(
            evaluate_numeric("dist + '!'", &defs()).unwrap_err(),
            Error::NotAnInteger { .. }
        ));
        assert!(matches!(
            evaluate_numeric("1 / 0", &defs()).unwrap_err(),
            Error::DivisionByZero
        ));
    }

    #[test]
    fn rejects_anything_else_at_parse_time() {
        assert!(evaluate("__import__('os')", &defs()).is_err());
        assert!(evaluate("major; minor", &defs()).is_err());
        assert!(evaluate("[1, 2]", &defs()).is_err());
        assert!(evaluate("'unterminated", &defs()).is_err());
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(matches!(
            evaluate("1 + 1 1", &defs()).unwrap_err(),
            Error::UnexpectedToken { .. }
        ));
    }
}
