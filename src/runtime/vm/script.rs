//! A small expression language used as [`LocalVm`](super::LocalVm)'s
//! scripting engine.
//!
//! Programs are `;`-separated statements. A statement is an assignment
//! (`var x = expr` or `x = expr`), `throw expr`, or a bare expression; the
//! value of the last statement is the program's result. Expressions support
//! string, number, `true`/`false`/`null` literals, variables, parentheses,
//! unary minus, and `+ - * / %`. `+` concatenates when either side is a
//! string.

use crate::runtime::error::{classes, ForeignException};
use crate::runtime::value::Value;
use indexmap::IndexMap;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Str(String),
    Int(i64),
    Float(f64),
    Ident(String),
    Op(char),
}

/// Deepest nesting of parentheses and unary operators accepted.
const MAX_DEPTH: usize = 128;

fn syntax_error(message: impl Into<String>) -> ForeignException {
    ForeignException::new(classes::SCRIPT_EXCEPTION, format!("SyntaxError: {}", message.into()))
}

fn type_error(message: impl Into<String>) -> ForeignException {
    ForeignException::new(classes::SCRIPT_EXCEPTION, format!("TypeError: {}", message.into()))
}

fn tokenize(source: &str) -> Result<Vec<Token>, ForeignException> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == quote => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, other)) => text.push(other),
                            None => return Err(syntax_error("unterminated string literal")),
                        },
                        Some((_, ch)) => text.push(ch),
                        None => return Err(syntax_error("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_digit() || next == '.' {
                        literal.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if literal.contains('.') {
                    literal.parse().map(Token::Float)
                        .map_err(|_| syntax_error(format!("bad number '{}'", literal)))?
                } else {
                    match literal.parse() {
                        Ok(i) => Token::Int(i),
                        Err(_) => literal.parse().map(Token::Float)
                            .map_err(|_| syntax_error(format!("bad number '{}'", literal)))?,
                    }
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' || next == '$' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '+' | '-' | '*' | '/' | '%' | '(' | ')' | '=' | ';' => tokens.push(Token::Op(c)),
            other => {
                return Err(syntax_error(format!(
                    "unexpected character '{}' at offset {}",
                    other, offset
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    scope: &'a mut IndexMap<String, Value>,
    display: &'a dyn Fn(&Value) -> String,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self, op: char) -> bool {
        matches!(self.peek(), Some(Token::Op(c)) if *c == op)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_op(&mut self, op: char) -> Result<(), ForeignException> {
        match self.advance() {
            Some(Token::Op(c)) if c == op => Ok(()),
            other => Err(syntax_error(format!("expected '{}', found {:?}", op, other))),
        }
    }

    fn program(&mut self) -> Result<Value, ForeignException> {
        let mut last = Value::Null;
        while self.peek().is_some() {
            if self.peek_op(';') {
                self.advance();
                continue;
            }
            last = self.statement()?;
            if self.peek().is_some() {
                self.expect_op(';')?;
            }
        }
        Ok(last)
    }

    fn statement(&mut self) -> Result<Value, ForeignException> {
        let keyword = match self.peek() {
            Some(Token::Ident(word)) => Some(word.clone()),
            _ => None,
        };
        if let Some(word) = keyword {
            match word.as_str() {
                "throw" => {
                    self.advance();
                    let thrown = self.expression()?;
                    let inner = ForeignException::runtime((self.display)(&thrown));
                    return Err(ForeignException::new(
                        classes::WRAPPED_EXCEPTION,
                        format!("script threw: {}", inner.message()),
                    )
                    .with_cause(inner));
                }
                "var" => {
                    self.advance();
                    return self.assignment();
                }
                _ => {
                    let is_assignment = matches!(self.tokens.get(self.pos + 1), Some(Token::Op('=')));
                    if is_assignment {
                        return self.assignment();
                    }
                }
            }
        }
        self.expression()
    }

    fn assignment(&mut self) -> Result<Value, ForeignException> {
        let name = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => return Err(syntax_error(format!("expected a name, found {:?}", other))),
        };
        self.expect_op('=')?;
        let value = self.expression()?;
        self.scope.insert(name, value.clone());
        Ok(value)
    }

    fn expression(&mut self) -> Result<Value, ForeignException> {
        let mut left = self.term()?;
        while self.peek_op('+') || self.peek_op('-') {
            let op = match self.advance() {
                Some(Token::Op(op)) => op,
                _ => unreachable!("peeked an operator"),
            };
            let right = self.term()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Value, ForeignException> {
        let mut left = self.unary()?;
        while self.peek_op('*') || self.peek_op('/') || self.peek_op('%') {
            let op = match self.advance() {
                Some(Token::Op(op)) => op,
                _ => unreachable!("peeked an operator"),
            };
            let right = self.unary()?;
            left = self.binary(op, left, right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ForeignException> {
        if self.depth == MAX_DEPTH {
            return Err(ForeignException::new(
                classes::SCRIPT_EXCEPTION,
                "RangeError: expression nested too deeply",
            ));
        }
        self.depth += 1;
        let value = self.negation();
        self.depth -= 1;
        value
    }

    fn negation(&mut self) -> Result<Value, ForeignException> {
        if self.peek_op('-') {
            self.advance();
            return match self.unary()? {
                Value::Int(i) => Ok(i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(type_error(format!("cannot negate {}", other.type_name()))),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, ForeignException> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => self.scope.get(&word).cloned().ok_or_else(|| {
                    ForeignException::new(
                        classes::SCRIPT_EXCEPTION,
                        format!("ReferenceError: \"{}\" is not defined", word),
                    )
                }),
            },
            Some(Token::Op('(')) => {
                let value = self.expression()?;
                self.expect_op(')')?;
                Ok(value)
            }
            other => Err(syntax_error(format!("unexpected token {:?}", other))),
        }
    }

    fn binary(&self, op: char, left: Value, right: Value) -> Result<Value, ForeignException> {
        if op == '+' && (matches!(left, Value::String(_)) || matches!(right, Value::String(_))) {
            return Ok(Value::String(format!(
                "{}{}",
                (self.display)(&left),
                (self.display)(&right)
            )));
        }
        match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                let exact = match op {
                    '+' => a.checked_add(b),
                    '-' => a.checked_sub(b),
                    '*' => a.checked_mul(b),
                    '/' if a.checked_rem(b) == Some(0) => a.checked_div(b),
                    '%' => a.checked_rem(b),
                    _ => None,
                };
                match exact {
                    Some(i) => Ok(Value::Int(i)),
                    None => float_op(op, a as f64, b as f64),
                }
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => float_op(op, a, b),
                _ => Err(type_error(format!(
                    "unsupported operands for '{}': {} and {}",
                    op,
                    left.type_name(),
                    right.type_name()
                ))),
            },
        }
    }
}

fn float_op(op: char, a: f64, b: f64) -> Result<Value, ForeignException> {
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => a / b,
        '%' => a % b,
        other => return Err(syntax_error(format!("unknown operator '{}'", other))),
    };
    Ok(Value::Float(result))
}

/// Evaluate `source` against `scope`, which receives any assignments.
///
/// `display` renders values when they are concatenated into strings, so the
/// caller can resolve object handles.
pub fn evaluate(
    source: &str,
    scope: &mut IndexMap<String, Value>,
    display: &dyn Fn(&Value) -> String,
) -> Result<Value, ForeignException> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        scope,
        display,
    };
    parser.program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Result<Value, ForeignException> {
        let mut scope = IndexMap::new();
        evaluate(source, &mut scope, &|v| v.to_string())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::Int(9));
        assert_eq!(eval("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval("8 / 2").unwrap(), Value::Int(4));
        assert_eq!(eval("-3 + 1.5").unwrap(), Value::Float(-1.5));
        assert_eq!(eval("10 % 4").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval("'a' + 1 + 2").unwrap(), Value::from("a12"));
        assert_eq!(eval("1 + 2 + \"a\"").unwrap(), Value::from("3a"));
        assert_eq!(eval("\"line\\n\"").unwrap(), Value::from("line\n"));
    }

    #[test]
    fn test_bindings_and_assignment() {
        let mut scope = IndexMap::new();
        scope.insert("name".to_string(), Value::from("world"));
        let result = evaluate(
            "var greeting = 'Hello, ' + name; greeting + '!'",
            &mut scope,
            &|v| v.to_string(),
        )
        .unwrap();
        assert_eq!(result, Value::from("Hello, world!"));
        assert_eq!(scope.get("greeting"), Some(&Value::from("Hello, world")));
    }

    #[test]
    fn test_reference_error() {
        let err = eval("missing + 1").unwrap_err();
        assert_eq!(err.class_name, classes::SCRIPT_EXCEPTION);
        assert!(err.message().contains("\"missing\" is not defined"));
    }

    #[test]
    fn test_throw_wraps_exception() {
        let err = eval("throw 'bad ' + 1").unwrap_err();
        assert_eq!(err.class_name, classes::WRAPPED_EXCEPTION);
        let inner = err.unwrap_script();
        assert_eq!(inner.class_name, classes::RUNTIME_EXCEPTION);
        assert_eq!(inner.message(), "bad 1");
    }

    #[test]
    fn test_syntax_errors() {
        assert!(eval("'unterminated").is_err());
        assert!(eval("1 +").is_err());
        assert!(eval("(1").is_err());
        assert!(eval("1 # 2").is_err());
        assert!(eval("true - 'x'").is_err());
    }

    #[test]
    fn test_negating_min_int_widens_to_float() {
        assert_eq!(
            eval("-(-9223372036854775807 - 1)").unwrap(),
            Value::Float(9223372036854775808.0)
        );
        assert_eq!(eval("--5").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = eval(&parens).unwrap_err();
        assert_eq!(err.class_name, classes::SCRIPT_EXCEPTION);
        assert!(err.message().contains("nested too deeply"));

        let minus = format!("{}1", "-".repeat(10_000));
        assert!(eval(&minus).unwrap_err().message().contains("nested too deeply"));

        assert_eq!(eval(&format!("{}1{}", "(".repeat(50), ")".repeat(50))).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_empty_program_is_null() {
        assert_eq!(eval("").unwrap(), Value::Null);
        assert_eq!(eval(";;").unwrap(), Value::Null);
    }
}
