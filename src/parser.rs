/// Recursive-descent parser: tokens → AST (§4.2).
///
/// Expression parsing is a precedence-climbing cascade, one method per
/// precedence level, each calling the next-tighter level for its operands.
/// Statement parsing dispatches on the leading token.
use crate::ast::*;
use crate::errors::{ParseError, Span};
use crate::lexer::{Checkpoint, Lexer, Token, TokenCursor};

pub struct Parser {
    cursor: TokenCursor,
    #[allow(dead_code)]
    source_id: u32,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(source: &str, source_id: u32) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(source, source_id);
        let tokens = lexer.tokenize()?;
        Ok(Parser { cursor: TokenCursor::new(tokens), source_id })
    }

    pub fn parse_program(&mut self) -> PResult<Program> {
        let mut body = Vec::new();
        while !self.cursor.is_at_end() {
            body.push(self.parse_stmt()?);
        }
        Ok(Program { body })
    }

    // ---- token helpers -----------------------------------------------

    fn peek(&self) -> &Token {
        self.cursor.peek()
    }

    fn peek_nth(&self, n: usize) -> &Token {
        self.cursor.peek_nth(n)
    }

    fn span_here(&self) -> Span {
        self.cursor.peek_span()
    }

    fn advance(&mut self) -> (Token, Span) {
        self.cursor.advance()
    }

    fn checkpoint(&self) -> Checkpoint {
        self.cursor.checkpoint()
    }

    fn rewind(&mut self, cp: Checkpoint) {
        self.cursor.rewind(cp);
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token, _context: &str) -> PResult<Span> {
        if self.peek() == &tok {
            let (_, span) = self.advance();
            Ok(span)
        } else {
            Err(ParseError::UnexpectedToken {
                expected: tok.describe(),
                found: self.peek().describe(),
                span: self.span_here(),
            })
        }
    }

    fn expect_ident(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            Token::Get => {
                self.advance();
                Ok("get".to_string())
            }
            Token::Set => {
                self.advance();
                Ok("set".to_string())
            }
            Token::Static => {
                self.advance();
                Ok("static".to_string())
            }
            Token::From => {
                self.advance();
                Ok("from".to_string())
            }
            Token::As => {
                self.advance();
                Ok("as".to_string())
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: other.describe(),
                span: self.span_here(),
            }),
        }
    }

    // ---- statements -----------------------------------------------------

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        match self.peek() {
            Token::LBrace => self.parse_block(),
            Token::Let | Token::Const | Token::Var => self.parse_var_decl_stmt(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::Do => self.parse_do_while(),
            Token::For => self.parse_for(),
            Token::Return => self.parse_return(),
            Token::Break => self.parse_break(),
            Token::Continue => self.parse_continue(),
            Token::Throw => self.parse_throw(),
            Token::Try => self.parse_try(),
            Token::Switch => self.parse_switch(),
            Token::Function => self.parse_function_decl(false),
            Token::Async if self.peek_nth(1) == &Token::Function => {
                self.advance();
                self.parse_function_decl(true)
            }
            Token::Class => self.parse_class_decl(),
            Token::Import => self.parse_import(),
            Token::Export => self.parse_export(),
            Token::Semicolon => {
                let span = self.span_here();
                self.advance();
                Ok(Stmt::Empty { span })
            }
            Token::Ident(_) if self.peek_nth(1) == &Token::Colon => self.parse_labeled(),
            _ => self.parse_expr_stmt(),
        }
    }

    fn consume_semi(&mut self) {
        self.eat(&Token::Semicolon);
    }

    fn parse_block(&mut self) -> PResult<Stmt> {
        let start = self.expect(Token::LBrace, "block")?;
        let mut body = Vec::new();
        while self.peek() != &Token::RBrace && !self.cursor.is_at_end() {
            body.push(self.parse_stmt()?);
        }
        let end = self.expect(Token::RBrace, "block")?;
        Ok(Stmt::Block { body, span: start.merge(end) })
    }

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::LBrace, "block")?;
        let mut body = Vec::new();
        while self.peek() != &Token::RBrace && !self.cursor.is_at_end() {
            body.push(self.parse_stmt()?);
        }
        self.expect(Token::RBrace, "block")?;
        Ok(body)
    }

    fn parse_var_kind(&mut self) -> VarKind {
        match self.advance().0 {
            Token::Let => VarKind::Let,
            Token::Const => VarKind::Const,
            _ => VarKind::Var,
        }
    }

    fn parse_var_decl_stmt(&mut self) -> PResult<Stmt> {
        let start = self.span_here();
        let kind = self.parse_var_kind();
        let decls = self.parse_var_declarators()?;
        self.consume_semi();
        Ok(Stmt::VarDecl { kind, span: start, decls })
    }

    fn parse_var_declarators(&mut self) -> PResult<Vec<VarDeclarator>> {
        let mut decls = Vec::new();
        loop {
            let start = self.span_here();
            let name = self.expect_ident()?;
            let init = if self.eat(&Token::Assign) { Some(self.parse_assignment()?) } else { None };
            decls.push(VarDeclarator { name, init, span: start });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(decls)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        self.expect(Token::LParen, "if")?;
        let test = self.parse_expr()?;
        self.expect(Token::RParen, "if")?;
        let consequent = Box::new(self.parse_stmt()?);
        let alternate = if self.eat(&Token::Else) { Some(Box::new(self.parse_stmt()?)) } else { None };
        Ok(Stmt::If { test, consequent, alternate, span: start })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        self.expect(Token::LParen, "while")?;
        let test = self.parse_expr()?;
        self.expect(Token::RParen, "while")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::While { test, body, span: start })
    }

    fn parse_do_while(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let body = Box::new(self.parse_stmt()?);
        self.expect(Token::While, "do-while")?;
        self.expect(Token::LParen, "do-while")?;
        let test = self.parse_expr()?;
        self.expect(Token::RParen, "do-while")?;
        self.consume_semi();
        Ok(Stmt::DoWhile { body, test, span: start })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        self.expect(Token::LParen, "for")?;

        let decl_kind = match self.peek() {
            Token::Let => Some(VarKind::Let),
            Token::Const => Some(VarKind::Const),
            Token::Var => Some(VarKind::Var),
            _ => None,
        };

        if decl_kind.is_some() {
            let cp = self.checkpoint();
            let kind = self.parse_var_kind();
            let name = self.expect_ident()?;
            if self.peek() == &Token::In || matches!(self.peek(), Token::Ident(id) if id == "of") {
                let is_of = matches!(self.peek(), Token::Ident(id) if id == "of");
                self.advance();
                let right = self.parse_assignment()?;
                self.expect(Token::RParen, "for-in/of")?;
                let body = Box::new(self.parse_stmt()?);
                return Ok(Stmt::ForIn { decl_kind: Some(kind), left: name, right, body, is_of, span: start });
            }
            self.rewind(cp);
        } else if let Token::Ident(name) = self.peek().clone() {
            let cp = self.checkpoint();
            self.advance();
            if self.peek() == &Token::In {
                self.advance();
                let right = self.parse_assignment()?;
                self.expect(Token::RParen, "for-in")?;
                let body = Box::new(self.parse_stmt()?);
                return Ok(Stmt::ForIn { decl_kind: None, left: name, right, body, is_of: false, span: start });
            }
            self.rewind(cp);
        }

        let init = if self.peek() == &Token::Semicolon {
            None
        } else if decl_kind.is_some() {
            let kind = self.parse_var_kind();
            let decls = self.parse_var_declarators()?;
            Some(Box::new(Stmt::VarDecl { kind, decls, span: start }))
        } else {
            let e = self.parse_expr()?;
            Some(Box::new(Stmt::Expr { span: e.span(), expr: e }))
        };
        self.expect(Token::Semicolon, "for")?;

        let test = if self.peek() == &Token::Semicolon { None } else { Some(self.parse_expr()?) };
        self.expect(Token::Semicolon, "for")?;

        let update = if self.peek() == &Token::RParen { None } else { Some(self.parse_expr()?) };
        self.expect(Token::RParen, "for")?;

        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::For { init, test, update, body, span: start })
    }

    fn parse_return(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let argument = if matches!(self.peek(), Token::Semicolon | Token::RBrace) || self.cursor.is_at_end() {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.consume_semi();
        Ok(Stmt::Return { argument, span: start })
    }

    fn parse_break(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let label = if let Token::Ident(name) = self.peek().clone() {
            self.advance();
            Some(name)
        } else {
            None
        };
        self.consume_semi();
        Ok(Stmt::Break { label, span: start })
    }

    fn parse_continue(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let label = if let Token::Ident(name) = self.peek().clone() {
            self.advance();
            Some(name)
        } else {
            None
        };
        self.consume_semi();
        Ok(Stmt::Continue { label, span: start })
    }

    fn parse_throw(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let argument = self.parse_expr()?;
        self.consume_semi();
        Ok(Stmt::Throw { argument, span: start })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let block = self.parse_block_body()?;
        let handler = if self.eat(&Token::Catch) {
            let cstart = self.span_here();
            let param = if self.eat(&Token::LParen) {
                let name = self.expect_ident()?;
                self.expect(Token::RParen, "catch")?;
                Some(name)
            } else {
                None
            };
            let body = self.parse_block_body()?;
            Some(CatchClause { param, body, span: cstart })
        } else {
            None
        };
        let finalizer = if self.eat(&Token::Finally) { Some(self.parse_block_body()?) } else { None };
        if handler.is_none() && finalizer.is_none() {
            return Err(ParseError::UnexpectedToken {
                expected: "'catch' or 'finally'".to_string(),
                found: self.peek().describe(),
                span: self.span_here(),
            });
        }
        Ok(Stmt::Try { block, handler, finalizer, span: start })
    }

    fn parse_switch(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        self.expect(Token::LParen, "switch")?;
        let discriminant = self.parse_expr()?;
        self.expect(Token::RParen, "switch")?;
        self.expect(Token::LBrace, "switch")?;
        let mut cases = Vec::new();
        while self.peek() != &Token::RBrace && !self.cursor.is_at_end() {
            let cstart = self.span_here();
            let test = if self.eat(&Token::Case) {
                let e = self.parse_expr()?;
                Some(e)
            } else {
                self.expect(Token::Default, "switch case")?;
                None
            };
            self.expect(Token::Colon, "switch case")?;
            let mut body = Vec::new();
            while !matches!(self.peek(), Token::Case | Token::Default | Token::RBrace) {
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { test, body, span: cstart });
        }
        let end = self.expect(Token::RBrace, "switch")?;
        Ok(Stmt::Switch { discriminant, cases, span: start.merge(end) })
    }

    fn parse_labeled(&mut self) -> PResult<Stmt> {
        let start = self.span_here();
        let label = self.expect_ident()?;
        self.expect(Token::Colon, "label")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::Labeled { label, body, span: start })
    }

    fn parse_function_decl(&mut self, is_async: bool) -> PResult<Stmt> {
        let start = self.span_here();
        let function = self.parse_function_tail(is_async, false)?;
        Ok(Stmt::FunctionDecl { span: start, function })
    }

    /// Parses everything after `function`/`async function` up to and
    /// including the body: optional `*`, name, params, block.
    fn parse_function_tail(&mut self, is_async: bool, anonymous_ok: bool) -> PResult<FunctionNode> {
        let start = self.span_here();
        self.expect(Token::Function, "function")?;
        let is_generator = self.eat(&Token::Star);
        let name = match self.peek().clone() {
            Token::Ident(n) => {
                self.advance();
                Some(n)
            }
            _ if anonymous_ok => None,
            _ => Some(self.expect_ident()?),
        };
        let params = self.parse_param_list()?;
        let body = self.parse_block_body()?;
        Ok(FunctionNode { name, params, body, is_arrow: false, is_async, is_generator, expr_body: None, span: start })
    }

    fn parse_param_list(&mut self) -> PResult<Vec<Param>> {
        self.expect(Token::LParen, "parameter list")?;
        let mut params = Vec::new();
        while self.peek() != &Token::RParen {
            let start = self.span_here();
            let is_rest = self.eat(&Token::Ellipsis);
            let name = self.expect_ident()?;
            let default = if self.eat(&Token::Assign) { Some(self.parse_assignment()?) } else { None };
            params.push(Param { name, default, is_rest, span: start });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "parameter list")?;
        Ok(params)
    }

    fn parse_class_decl(&mut self) -> PResult<Stmt> {
        let start = self.span_here();
        let class = self.parse_class_tail()?;
        Ok(Stmt::ClassDecl { span: start, class })
    }

    fn parse_class_tail(&mut self) -> PResult<ClassNode> {
        let start = self.span_here();
        self.expect(Token::Class, "class")?;
        let name = if let Token::Ident(n) = self.peek().clone() {
            self.advance();
            Some(n)
        } else {
            None
        };
        let superclass = if self.eat(&Token::Extends) { Some(Box::new(self.parse_lhs_expr()?)) } else { None };
        self.expect(Token::LBrace, "class body")?;
        let mut members = Vec::new();
        while self.peek() != &Token::RBrace && !self.cursor.is_at_end() {
            if self.eat(&Token::Semicolon) {
                continue;
            }
            members.push(self.parse_class_member()?);
        }
        self.expect(Token::RBrace, "class body")?;
        Ok(ClassNode { name, superclass, members, span: start })
    }

    fn parse_class_member(&mut self) -> PResult<ClassMember> {
        let is_static = if self.peek() == &Token::Static && self.peek_nth(1) != &Token::LParen {
            self.advance();
            true
        } else {
            false
        };

        let mut kind = PropertyKind::Method;
        if self.peek() == &Token::Get && self.peek_nth(1) != &Token::LParen {
            self.advance();
            kind = PropertyKind::Get;
        } else if self.peek() == &Token::Set && self.peek_nth(1) != &Token::LParen {
            self.advance();
            kind = PropertyKind::Set;
        }

        let is_async = self.peek() == &Token::Async && self.peek_nth(1) != &Token::LParen;
        if is_async {
            self.advance();
        }
        let is_generator = self.eat(&Token::Star);

        let (key, computed) = self.parse_property_key()?;

        if self.peek() == &Token::LParen {
            let fstart = self.span_here();
            let params = self.parse_param_list()?;
            let body = self.parse_block_body()?;
            let function = FunctionNode {
                name: None,
                params,
                body,
                is_arrow: false,
                is_async,
                is_generator,
                expr_body: None,
                span: fstart,
            };
            Ok(ClassMember::Method { key, function, is_static, kind, computed })
        } else {
            let value = if self.eat(&Token::Assign) { Some(self.parse_assignment()?) } else { None };
            self.consume_semi();
            Ok(ClassMember::Field { key, value, is_static, computed })
        }
    }

    fn parse_property_key(&mut self) -> PResult<(PropertyKey, bool)> {
        if self.eat(&Token::LBracket) {
            let e = self.parse_assignment()?;
            self.expect(Token::RBracket, "computed property key")?;
            return Ok((PropertyKey::Computed(Box::new(e)), true));
        }
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok((PropertyKey::Str(s), false))
            }
            Token::Int(n) => {
                self.advance();
                Ok((PropertyKey::Num(n as f64), false))
            }
            Token::Float(n) => {
                self.advance();
                Ok((PropertyKey::Num(n), false))
            }
            _ => {
                let name = self.expect_ident()?;
                Ok((PropertyKey::Ident(name), false))
            }
        }
    }

    fn parse_import(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        let mut specifiers = Vec::new();

        if let Token::Ident(name) = self.peek().clone() {
            self.advance();
            specifiers.push(ImportSpecifier::Default { local: name });
            self.eat(&Token::Comma);
        }

        if self.eat(&Token::Star) {
            self.expect(Token::As, "import *")?;
            let local = self.expect_ident()?;
            specifiers.push(ImportSpecifier::Namespace { local });
        } else if self.eat(&Token::LBrace) {
            while self.peek() != &Token::RBrace {
                let imported = self.expect_ident()?;
                let local = if self.eat(&Token::As) { self.expect_ident()? } else { imported.clone() };
                specifiers.push(ImportSpecifier::Named { imported, local });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RBrace, "import list")?;
        }

        self.expect(Token::From, "import")?;
        let source = match self.advance().0 {
            Token::Str(s) => s,
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "module specifier string".to_string(),
                    found: other.describe(),
                    span: self.span_here(),
                })
            }
        };
        self.consume_semi();
        Ok(Stmt::Import { specifiers, source, span: start })
    }

    fn parse_export(&mut self) -> PResult<Stmt> {
        let start = self.advance().1;
        if self.eat(&Token::Default) {
            let expr = self.parse_assignment()?;
            self.consume_semi();
            return Ok(Stmt::Export { kind: ExportKind::Default(Box::new(expr)), span: start });
        }
        if self.eat(&Token::LBrace) {
            let mut names = Vec::new();
            while self.peek() != &Token::RBrace {
                let local = self.expect_ident()?;
                let exported = if self.eat(&Token::As) { self.expect_ident()? } else { local.clone() };
                names.push((local, exported));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RBrace, "export list")?;
            self.consume_semi();
            return Ok(Stmt::Export { kind: ExportKind::Named { names }, span: start });
        }
        let decl = self.parse_stmt()?;
        Ok(Stmt::Export { kind: ExportKind::Declaration(Box::new(decl)), span: start })
    }

    fn parse_expr_stmt(&mut self) -> PResult<Stmt> {
        let expr = self.parse_expr()?;
        let span = expr.span();
        self.consume_semi();
        Ok(Stmt::Expr { expr, span })
    }

    // ---- expressions ------------------------------------------------------
    // Precedence cascade (low to high), per §4.2 items 1-14.

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        let first = self.parse_assignment()?;
        if self.peek() == &Token::Comma {
            let start = first.span();
            let mut exprs = vec![first];
            while self.eat(&Token::Comma) {
                exprs.push(self.parse_assignment()?);
            }
            let end = exprs.last().unwrap().span();
            Ok(Expr::Sequence { exprs, span: start.merge(end) })
        } else {
            Ok(first)
        }
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        if self.peek() == &Token::Yield {
            return self.parse_yield();
        }
        if let Some(arrow) = self.try_parse_arrow()? {
            return Ok(arrow);
        }

        let left = self.parse_conditional()?;

        let op = match self.peek() {
            Token::Assign => Some(AssignOp::Assign),
            Token::PlusEq => Some(AssignOp::Add),
            Token::MinusEq => Some(AssignOp::Sub),
            Token::StarEq => Some(AssignOp::Mul),
            Token::SlashEq => Some(AssignOp::Div),
            Token::PercentEq => Some(AssignOp::Mod),
            Token::StarStarEq => Some(AssignOp::Pow),
            Token::ShlEq => Some(AssignOp::Shl),
            Token::ShrEq => Some(AssignOp::Shr),
            Token::UShrEq => Some(AssignOp::UShr),
            Token::AmpEq => Some(AssignOp::BitAnd),
            Token::PipeEq => Some(AssignOp::BitOr),
            Token::CaretEq => Some(AssignOp::BitXor),
            Token::AmpAmpEq => Some(AssignOp::AndAnd),
            Token::PipePipeEq => Some(AssignOp::OrOr),
            Token::QuestionQuestionEq => Some(AssignOp::Nullish),
            _ => None,
        };

        if let Some(op) = op {
            if !left.is_assignment_target() {
                return Err(ParseError::InvalidAssignmentTarget { span: left.span() });
            }
            self.advance();
            let value = self.parse_assignment()?;
            let span = left.span().merge(value.span());
            return Ok(Expr::Assign { op, target: Box::new(left), value: Box::new(value), span });
        }

        Ok(left)
    }

    fn parse_yield(&mut self) -> PResult<Expr> {
        let start = self.advance().1;
        let delegate = self.eat(&Token::Star);
        let argument = if matches!(self.peek(), Token::Semicolon | Token::RParen | Token::RBrace | Token::RBracket | Token::Comma)
            || self.cursor.is_at_end()
        {
            None
        } else {
            Some(Box::new(self.parse_assignment()?))
        };
        Ok(Expr::Yield { argument, delegate, span: start })
    }

    /// Attempts arrow-function parsing via checkpoint/rewind (§4.2
    /// "Arrow-function disambiguation"): tries a parameter list, and on
    /// failure or a missing `=>` rewinds to let the caller reparse as a
    /// normal expression.
    fn try_parse_arrow(&mut self) -> PResult<Option<Expr>> {
        let is_async = self.peek() == &Token::Async && matches!(self.peek_nth(1), Token::LParen | Token::Ident(_));
        let start = self.span_here();

        // Single bare identifier arrow: `x => ...`
        if !is_async {
            if let Token::Ident(name) = self.peek().clone() {
                if self.peek_nth(1) == &Token::Arrow {
                    self.advance();
                    self.advance();
                    return Ok(Some(self.finish_arrow(vec![Param { name, default: None, is_rest: false, span: start }], false, start)?));
                }
            }
            if self.peek() != &Token::LParen {
                return Ok(None);
            }
        } else {
            if self.peek_nth(1) != &Token::LParen && !matches!(self.peek_nth(1), Token::Ident(_)) {
                return Ok(None);
            }
        }

        let cp = self.checkpoint();
        if is_async {
            self.advance();
            if let Token::Ident(name) = self.peek().clone() {
                if self.peek_nth(1) == &Token::Arrow {
                    self.advance();
                    self.advance();
                    return Ok(Some(self.finish_arrow(vec![Param { name, default: None, is_rest: false, span: start }], true, start)?));
                }
                self.rewind(cp);
                return Ok(None);
            }
        }

        let params = match self.parse_param_list() {
            Ok(p) => p,
            Err(_) => {
                self.rewind(cp);
                return Ok(None);
            }
        };
        if self.peek() != &Token::Arrow {
            self.rewind(cp);
            return Ok(None);
        }
        self.advance();
        Ok(Some(self.finish_arrow(params, is_async, start)?))
    }

    fn finish_arrow(&mut self, params: Vec<Param>, is_async: bool, start: Span) -> PResult<Expr> {
        if self.peek() == &Token::LBrace {
            let body = self.parse_block_body()?;
            let function = FunctionNode {
                name: None,
                params,
                body,
                is_arrow: true,
                is_async,
                is_generator: false,
                expr_body: None,
                span: start,
            };
            Ok(Expr::Function { function: Box::new(function), span: start })
        } else {
            let expr = self.parse_assignment()?;
            let function = FunctionNode {
                name: None,
                params,
                body: Vec::new(),
                is_arrow: true,
                is_async,
                is_generator: false,
                expr_body: Some(Box::new(expr)),
                span: start,
            };
            Ok(Expr::Function { function: Box::new(function), span: start })
        }
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let test = self.parse_nullish()?;
        if self.eat(&Token::Question) {
            let consequent = self.parse_assignment()?;
            self.expect(Token::Colon, "conditional expression")?;
            let alternate = self.parse_assignment()?;
            let span = test.span().merge(alternate.span());
            Ok(Expr::Conditional { test: Box::new(test), consequent: Box::new(consequent), alternate: Box::new(alternate), span })
        } else {
            Ok(test)
        }
    }

    fn parse_nullish(&mut self) -> PResult<Expr> {
        let mut left = self.parse_logical_or()?;
        while self.peek() == &Token::QuestionQuestion {
            self.advance();
            let right = self.parse_logical_or()?;
            let span = left.span().merge(right.span());
            left = Expr::Logical { op: LogicalOp::Nullish, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_logical_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_logical_and()?;
        while self.peek() == &Token::PipePipe {
            self.advance();
            let right = self.parse_logical_and()?;
            let span = left.span().merge(right.span());
            left = Expr::Logical { op: LogicalOp::Or, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitwise_or()?;
        while self.peek() == &Token::AmpAmp {
            self.advance();
            let right = self.parse_bitwise_or()?;
            let span = left.span().merge(right.span());
            left = Expr::Logical { op: LogicalOp::And, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_bitwise_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitwise_xor()?;
        while self.peek() == &Token::Pipe {
            self.advance();
            let right = self.parse_bitwise_xor()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op: BinOp::BitOr, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_bitwise_xor(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitwise_and()?;
        while self.peek() == &Token::Caret {
            self.advance();
            let right = self.parse_bitwise_and()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op: BinOp::BitXor, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_bitwise_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.peek() == &Token::Amp {
            self.advance();
            let right = self.parse_equality()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op: BinOp::BitAnd, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::NotEq => BinOp::NotEq,
                Token::StrictEq => BinOp::StrictEq,
                Token::StrictNotEq => BinOp::StrictNotEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut left = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                Token::In => BinOp::In,
                Token::Instanceof => BinOp::Instanceof,
                _ => break,
            };
            self.advance();
            let right = self.parse_shift()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Shl => BinOp::Shl,
                Token::Shr => BinOp::Shr,
                Token::UShr => BinOp::UShr,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_exponent()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_exponent()?;
            let span = left.span().merge(right.span());
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    /// Right-associative.
    fn parse_exponent(&mut self) -> PResult<Expr> {
        let left = self.parse_unary()?;
        if self.peek() == &Token::StarStar {
            self.advance();
            let right = self.parse_exponent()?;
            let span = left.span().merge(right.span());
            Ok(Expr::Binary { op: BinOp::Pow, left: Box::new(left), right: Box::new(right), span })
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let start = self.span_here();
        let op = match self.peek() {
            Token::Bang => Some(UnaryOp::Not),
            Token::Tilde => Some(UnaryOp::BitNot),
            Token::Plus => Some(UnaryOp::Plus),
            Token::Minus => Some(UnaryOp::Minus),
            Token::Typeof => Some(UnaryOp::Typeof),
            Token::Void => Some(UnaryOp::Void),
            Token::Delete => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let argument = self.parse_unary()?;
            let span = start.merge(argument.span());
            return Ok(Expr::Unary { op, argument: Box::new(argument), span });
        }
        if self.peek() == &Token::PlusPlus || self.peek() == &Token::MinusMinus {
            let op = if self.advance().0 == Token::PlusPlus { UpdateOp::Increment } else { UpdateOp::Decrement };
            let argument = self.parse_unary()?;
            let span = start.merge(argument.span());
            return Ok(Expr::Update { op, argument: Box::new(argument), prefix: true, span });
        }
        if self.peek() == &Token::Await {
            self.advance();
            let argument = self.parse_unary()?;
            let span = start.merge(argument.span());
            return Ok(Expr::Await { argument: Box::new(argument), span });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let expr = self.parse_lhs_expr()?;
        if self.peek() == &Token::PlusPlus || self.peek() == &Token::MinusMinus {
            let op = if self.peek() == &Token::PlusPlus { UpdateOp::Increment } else { UpdateOp::Decrement };
            let end = self.advance().1;
            let span = expr.span().merge(end);
            return Ok(Expr::Update { op, argument: Box::new(expr), prefix: false, span });
        }
        Ok(expr)
    }

    /// Call / new / member / optional chain (§4.2 item 13).
    fn parse_lhs_expr(&mut self) -> PResult<Expr> {
        let mut expr = if self.peek() == &Token::New { self.parse_new()? } else { self.parse_primary()? };

        loop {
            expr = match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    let span = expr.span();
                    Expr::Member { object: Box::new(expr), property: PropertyKey::Ident(name), computed: false, optional: false, span }
                }
                Token::QuestionDot => {
                    self.advance();
                    if self.peek() == &Token::LParen {
                        let args = self.parse_args()?;
                        let span = expr.span();
                        Expr::Call { callee: Box::new(expr), args, optional: true, span }
                    } else if self.eat(&Token::LBracket) {
                        let index = self.parse_expr()?;
                        self.expect(Token::RBracket, "index expression")?;
                        let span = expr.span();
                        Expr::Member { object: Box::new(expr), property: PropertyKey::Computed(Box::new(index)), computed: true, optional: true, span }
                    } else {
                        let name = self.expect_ident()?;
                        let span = expr.span();
                        Expr::Member { object: Box::new(expr), property: PropertyKey::Ident(name), computed: false, optional: true, span }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "index expression")?;
                    let span = expr.span();
                    Expr::Member { object: Box::new(expr), property: PropertyKey::Computed(Box::new(index)), computed: true, optional: false, span }
                }
                Token::LParen => {
                    let args = self.parse_args()?;
                    let span = expr.span();
                    Expr::Call { callee: Box::new(expr), args, optional: false, span }
                }
                Token::NoSubTemplate(_) | Token::TemplateHead(_) => {
                    let parts = self.parse_template_parts()?;
                    let span = expr.span();
                    Expr::TaggedTemplate { tag: Box::new(expr), parts, span }
                }
                _ => break,
            };
        }
        Ok(expr)
    }

    fn parse_new(&mut self) -> PResult<Expr> {
        let start = self.advance().1;
        let callee = self.parse_member_only()?;
        let args = if self.peek() == &Token::LParen { self.parse_args()? } else { Vec::new() };
        let span = start.merge(callee.span());
        Ok(Expr::New { callee: Box::new(callee), args, span })
    }

    /// Member-access chain without calls, used for `new`'s callee so that
    /// `new a.b.c(x)` binds the call to the whole chain, not just `c`.
    fn parse_member_only(&mut self) -> PResult<Expr> {
        let mut expr = if self.peek() == &Token::New { self.parse_new()? } else { self.parse_primary()? };
        loop {
            expr = match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    let span = expr.span();
                    Expr::Member { object: Box::new(expr), property: PropertyKey::Ident(name), computed: false, optional: false, span }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "index expression")?;
                    let span = expr.span();
                    Expr::Member { object: Box::new(expr), property: PropertyKey::Computed(Box::new(index)), computed: true, optional: false, span }
                }
                _ => break,
            };
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        self.expect(Token::LParen, "argument list")?;
        let mut args = Vec::new();
        while self.peek() != &Token::RParen {
            if self.peek() == &Token::Ellipsis {
                let start = self.advance().1;
                let e = self.parse_assignment()?;
                let span = start.merge(e.span());
                args.push(Expr::Spread { argument: Box::new(e), span });
            } else {
                args.push(self.parse_assignment()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "argument list")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let start = self.span_here();
        match self.peek().clone() {
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Int(n), span: start })
            }
            Token::Float(n) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Float(n), span: start })
            }
            Token::BigInt(s) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::BigInt(s), span: start })
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Str(s), span: start })
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Bool(true), span: start })
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Bool(false), span: start })
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Null, span: start })
            }
            Token::Undefined => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Undefined, span: start })
            }
            Token::Regex { pattern, flags } => {
                self.advance();
                Ok(Expr::Literal { value: Literal::Regex { pattern, flags }, span: start })
            }
            Token::This => {
                self.advance();
                Ok(Expr::This { span: start })
            }
            Token::Super => {
                self.advance();
                Ok(Expr::Super { span: start })
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Ident { name, span: start })
            }
            Token::Get => {
                self.advance();
                Ok(Expr::Ident { name: "get".into(), span: start })
            }
            Token::Set => {
                self.advance();
                Ok(Expr::Ident { name: "set".into(), span: start })
            }
            Token::LParen => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect(Token::RParen, "parenthesized expression")?;
                Ok(e)
            }
            Token::LBracket => self.parse_array_literal(),
            Token::LBrace => self.parse_object_literal(),
            Token::NoSubTemplate(_) | Token::TemplateHead(_) => {
                let parts = self.parse_template_parts()?;
                Ok(Expr::Template { parts, span: start })
            }
            Token::Function => {
                let function = self.parse_function_tail(false, true)?;
                Ok(Expr::Function { function: Box::new(function), span: start })
            }
            Token::Async if self.peek_nth(1) == &Token::Function => {
                self.advance();
                let function = self.parse_function_tail(true, true)?;
                Ok(Expr::Function { function: Box::new(function), span: start })
            }
            Token::Class => {
                let class = self.parse_class_tail()?;
                Ok(Expr::Class { class: Box::new(class), span: start })
            }
            Token::Import => {
                self.advance();
                self.expect(Token::LParen, "import()")?;
                let argument = self.parse_assignment()?;
                self.expect(Token::RParen, "import()")?;
                Ok(Expr::Import { argument: Box::new(argument), span: start })
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "an expression".to_string(),
                found: other.describe(),
                span: start,
            }),
        }
    }

    fn parse_array_literal(&mut self) -> PResult<Expr> {
        let start = self.advance().1;
        let mut elements = Vec::new();
        while self.peek() != &Token::RBracket {
            if self.peek() == &Token::Comma {
                elements.push(None);
                self.advance();
                continue;
            }
            if self.peek() == &Token::Ellipsis {
                let sp = self.advance().1;
                let e = self.parse_assignment()?;
                let span = sp.merge(e.span());
                elements.push(Some(Expr::Spread { argument: Box::new(e), span }));
            } else {
                elements.push(Some(self.parse_assignment()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBracket, "array literal")?;
        Ok(Expr::Array { elements, span: start.merge(end) })
    }

    fn parse_object_literal(&mut self) -> PResult<Expr> {
        let start = self.advance().1;
        let mut properties = Vec::new();
        while self.peek() != &Token::RBrace {
            properties.push(self.parse_object_property()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBrace, "object literal")?;
        Ok(Expr::Object { properties, span: start.merge(end) })
    }

    fn parse_object_property(&mut self) -> PResult<Property> {
        let start = self.span_here();

        if self.peek() == &Token::Ellipsis {
            self.advance();
            let value = self.parse_assignment()?;
            let span = start.merge(value.span());
            return Ok(Property { key: PropertyKey::Ident(String::new()), value, kind: PropertyKind::Spread, computed: false, is_static: false, span });
        }

        let mut kind = PropertyKind::Init;
        if self.peek() == &Token::Get && !matches!(self.peek_nth(1), Token::Colon | Token::Comma | Token::RBrace | Token::LParen) {
            self.advance();
            kind = PropertyKind::Get;
        } else if self.peek() == &Token::Set && !matches!(self.peek_nth(1), Token::Colon | Token::Comma | Token::RBrace | Token::LParen) {
            self.advance();
            kind = PropertyKind::Set;
        }
        let is_generator = self.eat(&Token::Star);

        let (key, computed) = self.parse_property_key()?;

        if self.peek() == &Token::LParen {
            let fstart = self.span_here();
            let params = self.parse_param_list()?;
            let body = self.parse_block_body()?;
            let function = FunctionNode {
                name: None,
                params,
                body,
                is_arrow: false,
                is_async: false,
                is_generator,
                expr_body: None,
                span: fstart,
            };
            let value = Expr::Function { function: Box::new(function), span: fstart };
            let m_kind = if kind == PropertyKind::Init { PropertyKind::Method } else { kind };
            return Ok(Property { key, value, kind: m_kind, computed, is_static: false, span: start });
        }

        if self.eat(&Token::Colon) {
            let value = self.parse_assignment()?;
            return Ok(Property { key, value, kind: PropertyKind::Init, computed, is_static: false, span: start });
        }

        // Shorthand `{ x }`
        if let PropertyKey::Ident(name) = &key {
            let value = Expr::Ident { name: name.clone(), span: start };
            return Ok(Property { key, value, kind: PropertyKind::Init, computed: false, is_static: false, span: start });
        }

        Err(ParseError::UnexpectedToken { expected: "':' or '('".to_string(), found: self.peek().describe(), span: self.span_here() })
    }

    fn parse_template_parts(&mut self) -> PResult<Vec<TemplatePart>> {
        let mut parts = Vec::new();
        match self.advance().0 {
            Token::NoSubTemplate(s) => {
                parts.push(TemplatePart::Str(s));
                return Ok(parts);
            }
            Token::TemplateHead(s) => {
                parts.push(TemplatePart::Str(s));
            }
            _ => unreachable!("caller checked token kind"),
        }
        loop {
            let expr = self.parse_expr()?;
            parts.push(TemplatePart::Expr(expr));
            match self.advance().0 {
                Token::TemplateMiddle(s) => {
                    parts.push(TemplatePart::Str(s));
                }
                Token::TemplateTail(s) => {
                    parts.push(TemplatePart::Str(s));
                    break;
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "template continuation".to_string(),
                        found: other.describe(),
                        span: self.span_here(),
                    })
                }
            }
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        Parser::new(src, 0).unwrap().parse_program().unwrap()
    }

    #[test]
    fn parses_for_loop_accumulator() {
        let prog = parse("let x = 0; for (let i = 0; i < 5; i = i + 1) x = x + i; x;");
        assert_eq!(prog.body.len(), 3);
        assert!(matches!(prog.body[1], Stmt::For { .. }));
    }

    #[test]
    fn parses_recursive_function() {
        let prog = parse("function f(n){ if (n<=1) return 1; return n*f(n-1); } f(5);");
        assert!(matches!(prog.body[0], Stmt::FunctionDecl { .. }));
    }

    #[test]
    fn disambiguates_arrow_from_parenthesized_expr() {
        let prog = parse("let c = (x) => x + 1; let d = (1 + 2);");
        match &prog.body[0] {
            Stmt::VarDecl { decls, .. } => {
                assert!(matches!(decls[0].init, Some(Expr::Function { .. })));
            }
            _ => panic!("expected var decl"),
        }
        match &prog.body[1] {
            Stmt::VarDecl { decls, .. } => {
                assert!(matches!(decls[0].init, Some(Expr::Binary { .. })));
            }
            _ => panic!("expected var decl"),
        }
    }

    #[test]
    fn parses_try_catch_finally() {
        let prog = parse("try { throw 'e'; } catch(e) { e + '!'; } finally { 1; }");
        assert!(matches!(prog.body[0], Stmt::Try { .. }));
    }

    #[test]
    fn parses_class_with_extends_and_super_call() {
        let prog = parse("class A { f(){ return 1; } } class B extends A { f(){ return super.f() + 1; } }");
        assert_eq!(prog.body.len(), 2);
        match &prog.body[1] {
            Stmt::ClassDecl { class, .. } => assert!(class.superclass.is_some()),
            _ => panic!("expected class decl"),
        }
    }

    #[test]
    fn parses_template_literal_with_interpolation() {
        let prog = parse("`a${1+1}b`;");
        match &prog.body[0] {
            Stmt::Expr { expr: Expr::Template { parts, .. }, .. } => assert_eq!(parts.len(), 3),
            _ => panic!("expected template expr"),
        }
    }
}
