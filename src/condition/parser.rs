use super::{Expression, FieldPath, Literal};
use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eof,
}

/// Parses a condition such as `state.count >= 3 and "done" in state.flags`.
///
/// Accepts both word (`and`, `or`, `not`) and symbol (`&&`, `||`, `!`) logic, Python style
/// literals (`True`, `None`), subscripts (`state["key"]`) and `state.get("key", default)`.
pub fn parse_expression(source: &str) -> Result<Expression, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected trailing token {:?}", other))),
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text.parse::<f64>().map_err(|_| ExpressionError::Parse {
                position: start,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push((Token::Number(number), start));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
            continue;
        }
        if c == '"' || c == '\'' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        return Err(ExpressionError::Parse {
                            position: start,
                            message: "unterminated string literal".to_string(),
                        });
                    }
                    Some('\\') => {
                        if let Some(escaped) = chars.get(i + 1) {
                            text.push(*escaped);
                        }
                        i += 2;
                    }
                    Some(q) if *q == c => {
                        i += 1;
                        break;
                    }
                    Some(other) => {
                        text.push(*other);
                        i += 1;
                    }
                }
            }
            tokens.push((Token::Text(text), start));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Op("=="), 2),
            ('!', Some('=')) => (Token::Op("!="), 2),
            ('>', Some('=')) => (Token::Op(">="), 2),
            ('<', Some('=')) => (Token::Op("<="), 2),
            ('&', Some('&')) => (Token::Op("and"), 2),
            ('|', Some('|')) => (Token::Op("or"), 2),
            ('>', _) => (Token::Op(">"), 1),
            ('<', _) => (Token::Op("<"), 1),
            ('!', _) => (Token::Op("not"), 1),
            ('+', _) => (Token::Op("+"), 1),
            ('-', _) => (Token::Op("-"), 1),
            ('*', _) => (Token::Op("*"), 1),
            ('/', _) => (Token::Op("/"), 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            _ => {
                return Err(ExpressionError::Parse {
                    position: start,
                    message: format!("unexpected character '{}'", c),
                });
            }
        };
        tokens.push((token, start));
        i += width;
    }

    tokens.push((Token::Eof, chars.len()));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: String) -> ExpressionError {
        ExpressionError::Parse {
            position: self.position(),
            message,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    /// Matches a keyword written either as an identifier or as the equivalent symbol.
    fn eat_keyword(&mut self, word: &str) -> bool {
        let matched = match self.peek() {
            Token::Ident(ident) => ident == word,
            Token::Op(op) => *op == word,
            _ => false,
        };
        if matched {
            self.advance();
        }
        matched
    }

    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression, ExpressionError> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.parse_additive()?;

        if self.eat_keyword("in") {
            let right = self.parse_additive()?;
            return Ok(Expression::Contains(Box::new(right), Box::new(left)));
        }
        if matches!(self.peek(), Token::Ident(w) if w == "not")
            && matches!(self.tokens.get(self.pos + 1), Some((Token::Ident(w), _)) if w == "in")
        {
            self.pos += 2;
            let right = self.parse_additive()?;
            return Ok(Expression::Not(Box::new(Expression::Contains(
                Box::new(right),
                Box::new(left),
            ))));
        }

        let op = match self.peek() {
            Token::Op(op @ ("==" | "!=" | ">" | ">=" | "<" | "<=")) => *op,
            _ => return Ok(left),
        };
        self.advance();
        let right = Box::new(self.parse_additive()?);
        let left = Box::new(left);
        Ok(match op {
            "==" => Expression::Equal(left, right),
            "!=" => Expression::NotEqual(left, right),
            ">" => Expression::GreaterThan(left, right),
            ">=" => Expression::GreaterThanOrEqual(left, right),
            "<" => Expression::SmallerThan(left, right),
            _ => Expression::SmallerThanOrEqual(left, right),
        })
    }

    fn parse_additive(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Op(op @ ("+" | "-")) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = Box::new(self.parse_term()?);
            left = if op == "+" {
                Expression::Sum(Box::new(left), right)
            } else {
                Expression::Subtract(Box::new(left), right)
            };
        }
    }

    fn parse_term(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Op(op @ ("*" | "/")) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = Box::new(self.parse_unary()?);
            left = if op == "*" {
                Expression::Multiply(Box::new(left), right)
            } else {
                Expression::Divide(Box::new(left), right)
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expression, ExpressionError> {
        if *self.peek() == Token::Op("-") {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expression::Subtract(
                Box::new(Expression::Literal(Literal::Number(0.0))),
                Box::new(inner),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ExpressionError> {
        match self.advance() {
            Token::Number(n) => Ok(Expression::Literal(Literal::Number(n))),
            Token::Text(s) => Ok(Expression::Literal(Literal::Text(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(ident) => self.parse_identifier(ident),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_identifier(&mut self, ident: String) -> Result<Expression, ExpressionError> {
        if let Some(literal) = keyword_literal(&ident) {
            return Ok(Expression::Literal(literal));
        }
        if ident == "len" && *self.peek() == Token::LParen {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(Expression::Length(Box::new(inner)));
        }

        let mut path = if ident == "state" {
            FieldPath::new(Vec::new())
        } else {
            FieldPath::new(vec![ident])
        };

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(self.error(format!("expected field name, found {:?}", other)));
                        }
                    };
                    if name == "get" && path.segments.is_empty() && *self.peek() == Token::LParen {
                        self.parse_get_call(&mut path)?;
                    } else {
                        path.segments.push(name);
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let key = match self.advance() {
                        Token::Text(s) => s,
                        Token::Number(n) => format!("{}", n as i64),
                        other => {
                            return Err(self.error(format!("expected subscript key, found {:?}", other)));
                        }
                    };
                    self.expect(Token::RBracket)?;
                    path.segments.push(key);
                }
                _ => break,
            }
        }

        if path.segments.is_empty() {
            return Err(self.error("'state' must be followed by a field access".to_string()));
        }
        Ok(Expression::Field(path))
    }

    /// Parses the argument list of `state.get("key")` or `state.get("key", default)`.
    fn parse_get_call(&mut self, path: &mut FieldPath) -> Result<(), ExpressionError> {
        self.expect(Token::LParen)?;
        let key = match self.advance() {
            Token::Text(s) => s,
            other => return Err(self.error(format!("expected field name string, found {:?}", other))),
        };
        path.segments.push(key);
        if *self.peek() == Token::Comma {
            self.advance();
            let default = match self.advance() {
                Token::Number(n) => Literal::Number(n),
                Token::Text(s) => Literal::Text(s),
                Token::Ident(word) => keyword_literal(&word)
                    .ok_or_else(|| self.error(format!("unsupported default value '{}'", word)))?,
                Token::Op("-") => match self.advance() {
                    Token::Number(n) => Literal::Number(-n),
                    other => return Err(self.error(format!("expected number, found {:?}", other))),
                },
                other => return Err(self.error(format!("unsupported default value {:?}", other))),
            };
            path.default = Some(default);
        } else {
            path.default = Some(Literal::Null);
        }
        self.expect(Token::RParen)
    }
}

fn keyword_literal(word: &str) -> Option<Literal> {
    match word {
        "true" | "True" => Some(Literal::Bool(true)),
        "false" | "False" => Some(Literal::Bool(false)),
        "null" | "None" => Some(Literal::Null),
        _ => None,
    }
}
