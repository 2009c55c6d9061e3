use super::ast::{BinaryOp, Builtin, CastType, Expr, Literal, Stmt, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::{Result, RuleflowError};

/// Parse a script snippet into statements.
pub fn parse_program(src: &str) -> Result<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut stmts = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        if let Some(stmt) = parser.statement()? {
            stmts.push(stmt);
        }
    }
    Ok(stmts)
}

/// Parse a single expression; trailing tokens are an error.
#[cfg(test)]
pub(super) fn parse_expression(src: &str) -> Result<Expr> {
    let mut parser = Parser::new(tokenize(src)?);
    let expr = parser.expression()?;
    parser.expect(&TokenKind::Eof, "end of expression")?;
    Ok(expr)
}

const DECL_KEYWORDS: &[&str] = &[
    "var", "string", "int", "long", "double", "decimal", "float", "bool",
];

/// Deepest nesting of blocks, parentheses and unary operators accepted.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Run one level of recursive descent, failing instead of recursing
    /// past [`MAX_NESTING`].
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // -----------------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(w) if w == word)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> RuleflowError {
        RuleflowError::Expression {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            TokenKind::Ident(name) => Ok(name),
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn string_literal(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            TokenKind::Str(s) => Ok(s),
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn block_or_statement(&mut self) -> Result<Vec<Stmt>> {
        self.nested(Self::block_body)
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>> {
        if self.eat(&TokenKind::LBrace) {
            let mut stmts = Vec::new();
            while !self.eat(&TokenKind::RBrace) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.error("unterminated block"));
                }
                if let Some(stmt) = self.statement()? {
                    stmts.push(stmt);
                }
            }
            Ok(stmts)
        } else {
            Ok(self.statement()?.into_iter().collect())
        }
    }

    fn statement(&mut self) -> Result<Option<Stmt>> {
        if self.eat(&TokenKind::Semicolon) {
            return Ok(None);
        }

        if self.at(&TokenKind::LBrace) {
            // Nested bare block: flatten into an always-true branch.
            let body = self.block_or_statement()?;
            return Ok(Some(Stmt::If {
                condition: Expr::Literal(Literal::Bool(true)),
                then_branch: body,
                else_branch: Vec::new(),
            }));
        }

        if self.at_ident("if") {
            self.advance();
            self.expect(&TokenKind::LParen, "'(' after if")?;
            let condition = self.expression()?;
            self.expect(&TokenKind::RParen, "')' after if condition")?;
            let then_branch = self.block_or_statement()?;
            let else_branch = if self.at_ident("else") {
                self.advance();
                self.block_or_statement()?
            } else {
                Vec::new()
            };
            return Ok(Some(Stmt::If {
                condition,
                then_branch,
                else_branch,
            }));
        }

        if self.at_ident("return") {
            self.advance();
            if !self.at(&TokenKind::Semicolon) {
                self.expression()?;
            }
            self.expect(&TokenKind::Semicolon, "';'")?;
            return Ok(Some(Stmt::Return));
        }

        if self.at_ident("self") {
            self.advance();
            let field = self
                .field_after_self()?
                .ok_or_else(|| self.error("only field assignments are supported on self"))?;
            self.expect(&TokenKind::Assign, "'=' in field assignment")?;
            let value = self.expression()?;
            self.expect(&TokenKind::Semicolon, "';'")?;
            return Ok(Some(Stmt::SetField { field, value }));
        }

        if let TokenKind::Ident(word) = self.peek().clone() {
            let is_decl = DECL_KEYWORDS.contains(&word.as_str())
                && matches!(self.peek_at(1), TokenKind::Ident(_));
            if is_decl {
                self.advance();
                let name = self.ident("variable name")?;
                let value = if self.eat(&TokenKind::Assign) {
                    self.expression()?
                } else {
                    Expr::Literal(Literal::Null)
                };
                self.expect(&TokenKind::Semicolon, "';'")?;
                return Ok(Some(Stmt::Declare { name, value }));
            }

            let compound = match self.peek_at(1) {
                TokenKind::Plus if self.peek_at(2) == &TokenKind::Assign => Some(BinaryOp::Add),
                TokenKind::Minus if self.peek_at(2) == &TokenKind::Assign => Some(BinaryOp::Sub),
                TokenKind::Star if self.peek_at(2) == &TokenKind::Assign => Some(BinaryOp::Mul),
                _ => None,
            };
            if let Some(op) = compound {
                self.advance();
                self.advance();
                self.advance();
                let rhs = self.expression()?;
                self.expect(&TokenKind::Semicolon, "';'")?;
                let value = Expr::Binary(op, Box::new(Expr::Var(word.clone())), Box::new(rhs));
                return Ok(Some(Stmt::Assign { name: word, value }));
            }

            if self.peek_at(1) == &TokenKind::Assign {
                self.advance();
                self.advance();
                let value = self.expression()?;
                self.expect(&TokenKind::Semicolon, "';'")?;
                return Ok(Some(Stmt::Assign { name: word, value }));
            }
        }

        Err(self.error(format!("unsupported statement starting at {:?}", self.peek())))
    }

    /// After `self`: `["Name"]`, `.Fields["Name"]` or `.Fields["Name"].Value`.
    fn field_after_self(&mut self) -> Result<Option<String>> {
        if self.eat(&TokenKind::LBracket) {
            let name = self.string_literal("field name")?;
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(Some(name));
        }
        if self.at(&TokenKind::Dot)
            && matches!(self.peek_at(1), TokenKind::Ident(w) if w == "Fields")
            && self.peek_at(2) == &TokenKind::LBracket
        {
            self.advance();
            self.advance();
            self.advance();
            let name = self.string_literal("field name")?;
            self.expect(&TokenKind::RBracket, "']'")?;
            if self.at(&TokenKind::Dot)
                && matches!(self.peek_at(1), TokenKind::Ident(w) if w == "Value")
            {
                self.advance();
                self.advance();
            }
            return Ok(Some(name));
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Expressions, lowest precedence first
    // -----------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr> {
        self.nested(Self::or)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.nested(Self::unary)?)));
        }
        if self.eat(&TokenKind::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::unary)?)));
        }
        if let Some(cast) = self.cast_ahead() {
            self.advance();
            self.advance();
            self.advance();
            return Ok(Expr::Cast(cast, Box::new(self.nested(Self::unary)?)));
        }
        self.postfix()
    }

    /// `(type)` directly followed by the start of an operand.
    fn cast_ahead(&self) -> Option<CastType> {
        if self.peek() != &TokenKind::LParen || self.peek_at(2) != &TokenKind::RParen {
            return None;
        }
        let TokenKind::Ident(word) = self.peek_at(1) else {
            return None;
        };
        let cast = CastType::from_keyword(word)?;
        match self.peek_at(3) {
            TokenKind::Ident(_)
            | TokenKind::Str(_)
            | TokenKind::Number(_)
            | TokenKind::LParen
            | TokenKind::Not
            | TokenKind::Minus => Some(cast),
            _ => None,
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let name = self.ident("member name")?;
                if self.eat(&TokenKind::LParen) {
                    let args = self.arguments()?;
                    expr = Expr::Method {
                        target: Box::new(expr),
                        name,
                        args,
                    };
                } else {
                    expr = Expr::Property {
                        target: Box::new(expr),
                        name,
                    };
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated arguments after an opening parenthesis.
    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&TokenKind::RParen) {
                return Ok(args);
            }
            self.expect(&TokenKind::Comma, "',' or ')'")?;
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            TokenKind::Number(n) => Ok(Expr::Literal(Literal::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(word) => self.identifier(word),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn identifier(&mut self, word: String) -> Result<Expr> {
        match word.as_str() {
            "true" => return Ok(Expr::Literal(Literal::Bool(true))),
            "false" => return Ok(Expr::Literal(Literal::Bool(false))),
            "null" => return Ok(Expr::Literal(Literal::Null)),
            "self" => {
                return self
                    .field_after_self()?
                    .map(Expr::Field)
                    .ok_or_else(|| self.error("expected field access after self"));
            }
            _ => {}
        }

        if self.at(&TokenKind::Dot) {
            if let TokenKind::Ident(member) = self.peek_at(1).clone() {
                if let Some(builtin) = Builtin::lookup(&word, &member) {
                    self.advance();
                    self.advance();
                    self.expect(&TokenKind::LParen, "'(' after function name")?;
                    let args = self.arguments()?;
                    return Ok(Expr::Call(builtin, args));
                }
            }
        }

        Ok(Expr::Var(word))
    }
}
