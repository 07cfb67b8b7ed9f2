//! Recursive-descent parser (component B, §4.2) turning a token stream into
//! an AST. Precedence, low to high:
//! `or` < `and` < `not` < compare < `+ -` < `* / ::` < unary (`~ - +`) < atom.

use crate::ast::*;
use crate::error::{SourceRange, WandelscriptError};
use crate::lexer::{migrate_legacy_pose_syntax, Lexer};
use crate::token::{Token, TokenKind};

pub fn parse_program(source: &str) -> Result<Program, WandelscriptError> {
    let migrated = migrate_legacy_pose_syntax(source);
    let tokens = Lexer::new(&migrated).tokenize()?;
    let mut parser = Parser::new(tokens);
    let body = parser.parse_block_toplevel()?;
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_range(&self) -> SourceRange {
        self.tokens[self.pos.min(self.tokens.len() - 1)].range
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, WandelscriptError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(WandelscriptError::syntax(
                self.peek_range(),
                format!("expected {:?}, found {:?}", kind, self.peek()),
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn expect_name(&mut self) -> Result<String, WandelscriptError> {
        match self.peek().clone() {
            TokenKind::Name(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(WandelscriptError::syntax(self.peek_range(), format!("expected identifier, found {other:?}"))),
        }
    }

    // ---- blocks -----------------------------------------------------

    fn parse_block_toplevel(&mut self) -> Result<Block, WandelscriptError> {
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.at_eof() {
            statements.push(self.parse_statement()?);
            self.skip_newlines();
        }
        Ok(statements)
    }

    fn parse_suite(&mut self) -> Result<Block, WandelscriptError> {
        self.expect(TokenKind::Colon)?;
        // Either a single simple statement on the same line, or an indented
        // block starting on the next line.
        if self.check(&TokenKind::Newline) {
            self.advance();
            self.skip_newlines();
            self.expect(TokenKind::Indent)?;
            let mut statements = Vec::new();
            self.skip_newlines();
            while !self.check(&TokenKind::Dedent) && !self.at_eof() {
                statements.push(self.parse_statement()?);
                self.skip_newlines();
            }
            self.expect(TokenKind::Dedent)?;
            Ok(statements)
        } else {
            let stmt = self.parse_simple_statement()?;
            Ok(vec![stmt])
        }
    }

    // ---- statements ---------------------------------------------------

    fn parse_statement(&mut self) -> Result<Statement, WandelscriptError> {
        match self.peek() {
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Def => self.parse_function_def(),
            TokenKind::MoveDef => self.parse_move_def(),
            TokenKind::Interrupt => self.parse_interrupt(),
            TokenKind::With => self.parse_with_context(),
            TokenKind::Sync => self.parse_sync(),
            TokenKind::Do => self.parse_do(),
            _ => {
                let stmt = self.parse_simple_statement()?;
                self.skip_newlines();
                Ok(stmt)
            }
        }
    }

    fn parse_simple_statement(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        let kind = match self.peek().clone() {
            TokenKind::Move => {
                self.advance();
                return self.finish_move(start);
            }
            TokenKind::Wait => {
                self.advance();
                let duration = self.parse_expr()?;
                StatementKind::Wait { duration }
            }
            TokenKind::Raise => {
                self.advance();
                let value = self.parse_expr()?;
                StatementKind::Raise { value }
            }
            TokenKind::Break => {
                self.advance();
                StatementKind::Break
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Newline) || self.at_eof() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                StatementKind::Return { value }
            }
            TokenKind::Stop => {
                self.advance();
                StatementKind::Stop
            }
            TokenKind::Pass => {
                self.advance();
                StatementKind::Pass
            }
            TokenKind::Print => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let value = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                StatementKind::Print { value }
            }
            TokenKind::Write => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let device = self.parse_expr()?;
                self.expect(TokenKind::Comma)?;
                let key = self.parse_expr()?;
                self.expect(TokenKind::Comma)?;
                let value = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                StatementKind::Write { device, key, value }
            }
            TokenKind::Call => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let device = self.parse_expr()?;
                self.expect(TokenKind::Comma)?;
                let key = self.parse_expr()?;
                let mut args = Vec::new();
                while self.check(&TokenKind::Comma) {
                    self.advance();
                    args.push(self.parse_expr()?);
                }
                self.expect(TokenKind::RParen)?;
                StatementKind::CallStatement { device, key, args }
            }
            TokenKind::Activate => {
                self.advance();
                let name = self.expect_name()?;
                StatementKind::Activate { name }
            }
            TokenKind::Deactivate => {
                self.advance();
                let name = self.expect_name()?;
                StatementKind::Deactivate { name }
            }
            TokenKind::LBracket => {
                return self.finish_frame_relation_or_expr_statement(start);
            }
            _ => return self.finish_assignment_or_expr(start),
        };
        Ok(Statement { kind, range: start })
    }

    fn finish_frame_relation_or_expr_statement(&mut self, start: SourceRange) -> Result<Statement, WandelscriptError> {
        let expr = self.parse_expr()?;
        if self.check(&TokenKind::Equal) {
            self.advance();
            let value = self.parse_expr()?;
            if let ExprKind::FrameRelation { target, source } = expr.kind {
                return Ok(Statement {
                    kind: StatementKind::FrameRelationAssignment { target: *target, source: *source, value },
                    range: start,
                });
            }
            return Err(WandelscriptError::syntax(start, "left-hand side of '=' must be a frame relation or name"));
        }
        Ok(Statement { kind: StatementKind::Expression(expr), range: start })
    }

    fn finish_assignment_or_expr(&mut self, start: SourceRange) -> Result<Statement, WandelscriptError> {
        // Try `name (, name)* =` destructuring assignment; fall back to a
        // plain expression statement if no top-level '=' follows.
        let checkpoint = self.pos;
        if let TokenKind::Name(_) = self.peek().clone() {
            let mut targets = Vec::new();
            loop {
                match self.peek().clone() {
                    TokenKind::Name(n) => {
                        self.advance();
                        targets.push(AssignTarget::Name(n));
                    }
                    _ => {
                        self.pos = checkpoint;
                        targets.clear();
                        break;
                    }
                }
                if self.check(&TokenKind::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
            if !targets.is_empty() && self.check(&TokenKind::Equal) {
                self.advance();
                let value = self.parse_expr()?;
                return Ok(Statement { kind: StatementKind::Assignment { targets, value }, range: start });
            }
            self.pos = checkpoint;
        }
        let expr = self.parse_expr()?;
        Ok(Statement { kind: StatementKind::Expression(expr), range: start })
    }

    fn finish_move(&mut self, start: SourceRange) -> Result<Statement, WandelscriptError> {
        let frame = if let TokenKind::Name(n) = self.peek().clone() {
            if !matches!(self.tokens.get(self.pos + 1).map(|t| &t.kind), Some(TokenKind::LParen)) {
                self.advance();
                Some(n)
            } else {
                None
            }
        } else {
            None
        };
        self.expect(TokenKind::Via)?;
        let connector_name = self.expect_name()?;
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.parse_expr()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                args.push(self.parse_expr()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::To)?;
        let target = self.parse_expr()?;
        let mut modifiers = Vec::new();
        if self.check(&TokenKind::With) {
            self.advance();
            modifiers.push(self.parse_expr()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                modifiers.push(self.parse_expr()?);
            }
        }
        Ok(Statement {
            kind: StatementKind::Move { frame, connector: Connector { name: connector_name, args }, target, modifiers },
            range: start,
        })
    }

    fn parse_if(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::If)?;
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        let body = self.parse_suite()?;
        branches.push((cond, body));
        let mut else_block = None;
        loop {
            if self.check(&TokenKind::Elif) {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_suite()?;
                branches.push((cond, body));
            } else if self.check(&TokenKind::Else) {
                self.advance();
                else_block = Some(self.parse_suite()?);
                break;
            } else {
                break;
            }
        }
        Ok(Statement { kind: StatementKind::If { branches, else_block }, range: start })
    }

    fn parse_for(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::For)?;
        let var = self.expect_name()?;
        self.expect(TokenKind::In)?;
        let start_expr = self.parse_additive()?;
        let inclusive = if self.check(&TokenKind::DotDot) {
            self.advance();
            true
        } else {
            self.expect(TokenKind::DotDotLess)?;
            false
        };
        let end_expr = self.parse_additive()?;
        let body = self.parse_suite()?;
        Ok(Statement {
            kind: StatementKind::For { var, start: start_expr, end: end_expr, inclusive, body },
            range: start,
        })
    }

    fn parse_while(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::While)?;
        let condition = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::While { condition, body }, range: start })
    }

    fn parse_repeat(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Repeat)?;
        let count = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::Repeat { count, body }, range: start })
    }

    fn parse_switch(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Switch)?;
        let value = self.parse_expr()?;
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::Newline)?;
        self.skip_newlines();
        self.expect(TokenKind::Indent)?;
        let mut cases = Vec::new();
        let mut default = None;
        self.skip_newlines();
        while self.check(&TokenKind::Case) || self.check(&TokenKind::Default) {
            if self.check(&TokenKind::Case) {
                self.advance();
                let case_value = self.parse_expr()?;
                let body = self.parse_suite()?;
                cases.push((case_value, body));
            } else {
                self.advance();
                default = Some(self.parse_suite()?);
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::Dedent)?;
        Ok(Statement { kind: StatementKind::Switch { value, cases, default }, range: start })
    }

    fn parse_params(&mut self) -> Result<Vec<String>, WandelscriptError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.expect_name()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                params.push(self.expect_name()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_function_def(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Def)?;
        let name = self.expect_name()?;
        let params = self.parse_params()?;
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::FunctionDef { name, params, body }, range: start })
    }

    /// `name` or `name '>-->' name` parameters, the latter binding a
    /// connector's start/end poses inside a `moveDef` body (§4.1).
    fn parse_move_def_params(&mut self) -> Result<Vec<MoveDefParam>, WandelscriptError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.parse_move_def_param()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                params.push(self.parse_move_def_param()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_move_def_param(&mut self) -> Result<MoveDefParam, WandelscriptError> {
        let first = self.expect_name()?;
        if self.check(&TokenKind::Arrow) {
            self.advance();
            let second = self.expect_name()?;
            return Ok(MoveDefParam::Connector { start: first, end: second });
        }
        Ok(MoveDefParam::Value(first))
    }

    fn parse_move_def(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::MoveDef)?;
        let name = self.expect_name()?;
        let params = self.parse_move_def_params()?;
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::MoveDef { name, params, body }, range: start })
    }

    fn parse_interrupt(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Interrupt)?;
        let name = self.expect_name()?;
        self.expect(TokenKind::When)?;
        let when = self.parse_expr()?;
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::Interrupt { name, when, body }, range: start })
    }

    fn parse_with_context(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::With)?;
        let mut modifiers = vec![self.parse_expr()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            modifiers.push(self.parse_expr()?);
        }
        let body = self.parse_suite()?;
        Ok(Statement { kind: StatementKind::WithContext { modifiers, body }, range: start })
    }

    fn parse_sync(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Sync)?;
        if self.check(&TokenKind::Colon) {
            let sync_then = Some(self.parse_suite()?);
            let except = if self.check(&TokenKind::Name("except".to_owned())) {
                // `except` is not a reserved keyword in the lexer (kept as a
                // plain name to avoid growing the keyword table); recognize
                // it positionally here.
                self.advance();
                Some(self.parse_suite()?)
            } else {
                None
            };
            return Ok(Statement { kind: StatementKind::SyncBlock { body: None, sync_then, except }, range: start });
        }
        self.skip_newlines();
        Ok(Statement { kind: StatementKind::Sync, range: start })
    }

    fn parse_do(&mut self) -> Result<Statement, WandelscriptError> {
        let start = self.peek_range();
        self.expect(TokenKind::Do)?;
        if self.check(&TokenKind::With) {
            let mut arms = Vec::new();
            self.advance();
            let robot = self.parse_expr()?;
            let body = self.parse_suite()?;
            arms.push((robot, body));
            while self.check(&TokenKind::And) {
                self.advance();
                self.expect(TokenKind::Do)?;
                self.expect(TokenKind::With)?;
                let robot = self.parse_expr()?;
                let body = self.parse_suite()?;
                arms.push((robot, body));
            }
            return Ok(Statement { kind: StatementKind::RobotBlock { arms }, range: start });
        }
        // bare `do: suite [sync: suite] [except: suite]`
        let body = Some(self.parse_suite()?);
        let (sync_then, except) = if self.check(&TokenKind::Sync) {
            self.advance();
            let then = Some(self.parse_suite()?);
            let except = if self.check(&TokenKind::Name("except".to_owned())) {
                self.advance();
                Some(self.parse_suite()?)
            } else {
                None
            };
            (then, except)
        } else {
            (None, None)
        };
        Ok(Statement { kind: StatementKind::SyncBlock { body, sync_then, except }, range: start })
    }

    // ---- expressions ----------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, WandelscriptError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, WandelscriptError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            let range = self.peek_range();
            self.advance();
            let right = self.parse_and()?;
            left = Expr { kind: ExprKind::Binary { op: BinOp::Or, left: Box::new(left), right: Box::new(right) }, range };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, WandelscriptError> {
        let mut left = self.parse_not()?;
        while self.check(&TokenKind::And) {
            let range = self.peek_range();
            self.advance();
            let right = self.parse_not()?;
            left = Expr { kind: ExprKind::Binary { op: BinOp::And, left: Box::new(left), right: Box::new(right) }, range };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, WandelscriptError> {
        if self.check(&TokenKind::Not) {
            let range = self.peek_range();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnOp::Not, operand: Box::new(operand) }, range });
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, WandelscriptError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            TokenKind::Less => BinOp::Lt,
            TokenKind::LessEqual => BinOp::Le,
            TokenKind::Greater => BinOp::Gt,
            TokenKind::GreaterEqual => BinOp::Ge,
            TokenKind::EqualEqual => BinOp::Eq,
            TokenKind::NotEqual => BinOp::Ne,
            _ => return Ok(left),
        };
        let range = self.peek_range();
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, range })
    }

    fn parse_additive(&mut self) -> Result<Expr, WandelscriptError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let range = self.peek_range();
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, range };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, WandelscriptError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleColon => BinOp::Compose,
                _ => break,
            };
            let range = self.peek_range();
            self.advance();
            let right = self.parse_unary()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, range };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, WandelscriptError> {
        let range = self.peek_range();
        let op = match self.peek() {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Plus => Some(UnOp::Pos),
            TokenKind::Tilde => Some(UnOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op, operand: Box::new(operand) }, range });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, WandelscriptError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                TokenKind::LBracket => {
                    let range = self.peek_range();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr { kind: ExprKind::Index { base: Box::new(expr), index: Box::new(index) }, range };
                }
                TokenKind::Dot => {
                    let range = self.peek_range();
                    self.advance();
                    let name = self.expect_name()?;
                    expr = Expr { kind: ExprKind::Attribute { base: Box::new(expr), name }, range };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr, WandelscriptError> {
        let range = self.peek_range();
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Int(v), range })
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Float(v), range })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(true), range })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(false), range })
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::String(s), range })
            }
            TokenKind::Read => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let device = self.parse_expr()?;
                self.expect(TokenKind::Comma)?;
                let key = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr { kind: ExprKind::Read { device: Box::new(device), key: Box::new(key) }, range })
            }
            TokenKind::Name(name) => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        while self.check(&TokenKind::Comma) {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    return Ok(Expr { kind: ExprKind::Call { name, args }, range });
                }
                Ok(Expr { kind: ExprKind::Reference(name), range })
            }
            TokenKind::LParen => {
                self.advance();
                let mut items = vec![self.parse_expr()?];
                let mut is_tuple = false;
                while self.check(&TokenKind::Comma) {
                    is_tuple = true;
                    self.advance();
                    if self.check(&TokenKind::RParen) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(TokenKind::RParen)?;
                if is_tuple {
                    Ok(Expr { kind: ExprKind::Tuple(items), range })
                } else {
                    Ok(items.into_iter().next().unwrap())
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    while self.check(&TokenKind::Comma) {
                        self.advance();
                        if self.check(&TokenKind::RBracket) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                }
                if self.check(&TokenKind::Pipe) {
                    self.advance();
                    let source = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    if items.len() != 1 {
                        return Err(WandelscriptError::syntax(range, "frame relation takes exactly one target expression"));
                    }
                    return Ok(Expr {
                        kind: ExprKind::FrameRelation { target: Box::new(items.into_iter().next().unwrap()), source: Box::new(source) },
                        range,
                    });
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr { kind: ExprKind::List(items), range })
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = self.expect_name()?;
                        self.expect(TokenKind::Colon)?;
                        let value = self.parse_expr()?;
                        fields.push((key, value));
                        if self.check(&TokenKind::Comma) {
                            self.advance();
                            if self.check(&TokenKind::RBrace) {
                                break;
                            }
                            continue;
                        }
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Expr { kind: ExprKind::Record(fields), range })
            }
            other => Err(WandelscriptError::syntax(range, format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_assignment() {
        let program = parse_program("a = 1 + 2\n").unwrap();
        assert_eq!(program.body.len(), 1);
    }

    #[test]
    fn parses_vector_literal_addition() {
        let program = parse_program("a = (0,1,2) + (0,0,3)\n").unwrap();
        match &program.body[0].kind {
            StatementKind::Assignment { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Binary { op: BinOp::Add, .. }));
            }
            _ => panic!("expected assignment"),
        }
    }

    #[test]
    fn parses_for_range() {
        let program = parse_program("for i in 3..5:\n    a = a + i\n").unwrap();
        assert!(matches!(program.body[0].kind, StatementKind::For { inclusive: true, .. }));
        let program = parse_program("for i in 3..<5:\n    a = a + i\n").unwrap();
        assert!(matches!(program.body[0].kind, StatementKind::For { inclusive: false, .. }));
    }

    #[test]
    fn parses_move_def_with_bound_connector_params() {
        let program = parse_program("movedef circle(start >--> end):\n    pass\n").unwrap();
        match &program.body[0].kind {
            StatementKind::MoveDef { name, params, .. } => {
                assert_eq!(name, "circle");
                assert_eq!(params.len(), 1);
                match &params[0] {
                    MoveDefParam::Connector { start, end } => {
                        assert_eq!(start, "start");
                        assert_eq!(end, "end");
                    }
                    _ => panic!("expected a bound connector parameter"),
                }
            }
            _ => panic!("expected movedef"),
        }
    }

    #[test]
    fn parses_if_elif_else() {
        let program = parse_program("if a == 1:\n    b = 1\nelif a == 2:\n    b = 2\nelse:\n    b = 3\n").unwrap();
        match &program.body[0].kind {
            StatementKind::If { branches, else_block } => {
                assert_eq!(branches.len(), 2);
                assert!(else_block.is_some());
            }
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn parses_move_statement() {
        let program = parse_program("move via ptp() to (0,0,0,0,0,0)\n").unwrap();
        assert!(matches!(program.body[0].kind, StatementKind::Move { .. }));
    }

    #[test]
    fn parses_frame_relation_assignment() {
        let program = parse_program("[target | source] = pose\n").unwrap();
        assert!(matches!(program.body[0].kind, StatementKind::FrameRelationAssignment { .. }));
    }
}
