use crate::conditions::{
    ast::{BinaryOp, Node, UnaryOp},
    lexer::{tokenize, Token, TokenKind},
    ConditionError,
};

/// Deepest nesting accepted before giving up, so hostile input cannot exhaust the stack.
const MAX_DEPTH: usize = 128;

pub(crate) fn parse(source: &str) -> Result<Node, ConditionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let node = parser.expression()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(parser.error_at(trailing.offset, "unexpected token after end of expression"));
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_second(&self) -> &TokenKind {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ConditionError> {
        let token = self.peek();
        if token.kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at(token.offset, &format!("expected {what}")))
        }
    }

    fn error_at(&self, offset: usize, message: &str) -> ConditionError {
        ConditionError::Parse {
            offset,
            message: message.to_owned(),
        }
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_at(self.peek().offset, "expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Node, ConditionError> {
        self.enter()?;
        let condition = self.binary(0)?;
        let result = if self.peek().kind == TokenKind::Question {
            self.advance();
            let then = self.expression()?;
            self.expect(TokenKind::Colon, "':' in conditional expression")?;
            let otherwise = self.expression()?;
            Node::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }
        } else {
            condition
        };
        self.depth -= 1;
        Ok(result)
    }

    /// Returns the operator at the cursor and how many tokens it spans.
    fn peek_binary_op(&self) -> Option<(BinaryOp, usize)> {
        let op = match &self.peek().kind {
            TokenKind::Operator(op) => match *op {
                "||" => BinaryOp::Or,
                "&&" => BinaryOp::And,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "%" => BinaryOp::Mod,
                "??" => BinaryOp::Coalesce,
                _ => return None,
            },
            TokenKind::Ident(word) => match word.as_str() {
                "or" => BinaryOp::Or,
                "and" => BinaryOp::And,
                "in" => BinaryOp::In,
                "contains" => BinaryOp::Contains,
                "startsWith" => BinaryOp::StartsWith,
                "endsWith" => BinaryOp::EndsWith,
                "matches" => BinaryOp::Matches,
                "not" if matches!(self.peek_second(), TokenKind::Ident(next) if next == "in") => {
                    return Some((BinaryOp::NotIn, 2));
                }
                _ => return None,
            },
            _ => return None,
        };
        Some((op, 1))
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Node, ConditionError> {
        let mut left = self.unary()?;
        while let Some((op, width)) = self.peek_binary_op() {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            for _ in 0..width {
                self.advance();
            }
            self.enter()?;
            let right = self.binary(precedence + 1)?;
            self.depth -= 1;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, ConditionError> {
        let op = match &self.peek().kind {
            TokenKind::Operator("!") => Some(UnaryOp::Not),
            TokenKind::Operator("-") => Some(UnaryOp::Neg),
            TokenKind::Ident(word) if word == "not" => Some(UnaryOp::Not),
            _ => None,
        };
        let Some(op) = op else {
            return self.primary();
        };
        self.advance();
        self.enter()?;
        let operand = self.binary(op.precedence())?;
        self.depth -= 1;

        // Fold negative literals directly so `-1` stays a literal.
        Ok(match (op, operand) {
            (UnaryOp::Neg, Node::Int(i)) => Node::Int(i.wrapping_neg()),
            (UnaryOp::Neg, Node::Float(f)) => Node::Float(-f),
            (op, operand) => Node::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn primary(&mut self) -> Result<Node, ConditionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Int(i) => Ok(Node::Int(i)),
            TokenKind::Float(f) => Ok(Node::Float(f)),
            TokenKind::Str(s) => Ok(Node::Str(s)),
            TokenKind::LeftParen => {
                let node = self.expression()?;
                self.expect(TokenKind::RightParen, "')'")?;
                Ok(node)
            }
            TokenKind::LeftBracket => {
                let items = self.list(TokenKind::RightBracket, "']'")?;
                Ok(Node::Array(items))
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Node::Bool(true)),
                "false" => Ok(Node::Bool(false)),
                "nil" => Ok(Node::Nil),
                "and" | "or" | "in" | "not" | "contains" | "startsWith" | "endsWith"
                | "matches" => Err(self.error_at(
                    token.offset,
                    &format!("unexpected keyword '{name}'"),
                )),
                _ => {
                    if self.peek().kind == TokenKind::LeftParen {
                        self.advance();
                        let args = self.list(TokenKind::RightParen, "')'")?;
                        Ok(Node::Call { name, args })
                    } else {
                        Ok(Node::Ident(name))
                    }
                }
            },
            TokenKind::Eof => Err(self.error_at(token.offset, "unexpected end of expression")),
            _ => Err(self.error_at(token.offset, "unexpected token")),
        }
    }

    /// Comma separated expressions up to (and consuming) `close`.
    fn list(&mut self, close: TokenKind, what: &str) -> Result<Vec<Node>, ConditionError> {
        let mut items = Vec::new();
        if self.peek().kind == close {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
                continue;
            }
            self.expect(close.clone(), what)?;
            return Ok(items);
        }
    }
}
