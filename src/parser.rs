// File: src/parser.rs
//
// Recursive-descent parser for uGO producing the ast.rs node set.
// Expressions use precedence climbing driven by Token::precedence; the
// parser is intentionally free of semantic checks (scope and const rules
// live in the compiler).

use crate::ast::{
    Block, CatchClause, DeclKind, DeclSpec, Expr, File, FuncParams, MapEntry, Stmt,
};
use crate::errors::{CompileError, SourceLocation};
use crate::lexer::{tokenize, Lexeme};
use crate::token::Token;

pub struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
}

/// Parses a whole source string into a File.
pub fn parse_source(source: &str) -> Result<File, CompileError> {
    Parser::new(tokenize(source)).parse_file()
}

impl Parser {
    pub fn new(tokens: Vec<Lexeme>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn cur(&self) -> &Lexeme {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_token(&self) -> Token {
        self.cur().token
    }

    fn peek_token(&self, offset: usize) -> Token {
        self.tokens
            .get(self.pos + offset)
            .map(|l| l.token)
            .unwrap_or(Token::Eof)
    }

    fn location(&self) -> SourceLocation {
        self.cur().location
    }

    fn at(&self, token: Token) -> bool {
        self.cur_token() == token
    }

    fn advance(&mut self) -> Lexeme {
        let lexeme = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        lexeme
    }

    fn expect(&mut self, token: Token) -> Result<Lexeme, CompileError> {
        if self.at(token) {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected '{}', found '{}'",
                token.symbol(),
                self.cur_token().symbol()
            )))
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(message, self.location())
    }

    fn skip_semicolons(&mut self) {
        while self.at(Token::Semicolon) {
            self.advance();
        }
    }

    pub fn parse_file(&mut self) -> Result<File, CompileError> {
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !self.at(Token::Eof) {
            if let Some(lexeme) = self.illegal() {
                return Err(CompileError::parse(lexeme.literal, lexeme.location));
            }
            stmts.push(self.parse_stmt()?);
            self.skip_semicolons();
        }
        Ok(File { stmts })
    }

    fn illegal(&self) -> Option<Lexeme> {
        if self.at(Token::Illegal) {
            Some(self.cur().clone())
        } else {
            None
        }
    }

    // === Statements ===

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        match self.cur_token() {
            Token::Var | Token::Const | Token::Global | Token::Param => self.parse_decl(),
            Token::If => self.parse_if(),
            Token::For => self.parse_for(),
            Token::Try => self.parse_try(),
            Token::Throw => {
                let location = self.advance().location;
                let expr = self.parse_expr()?;
                Ok(Stmt::Throw { expr, location })
            }
            Token::Break | Token::Continue => {
                let lexeme = self.advance();
                Ok(Stmt::Branch { token: lexeme.token, location: lexeme.location })
            }
            Token::Return => self.parse_return(),
            Token::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            Token::Semicolon => {
                let location = self.advance().location;
                Ok(Stmt::Empty { location })
            }
            Token::Illegal => {
                let lexeme = self.cur().clone();
                Err(CompileError::parse(lexeme.literal, lexeme.location))
            }
            _ => self.parse_simple_stmt(),
        }
    }

    /// Expression-first statements: assignment, define, inc/dec, or a bare
    /// expression. Also used for `for` clauses.
    fn parse_simple_stmt(&mut self) -> Result<Stmt, CompileError> {
        let location = self.location();
        let first = self.parse_expr()?;

        match self.cur_token() {
            Token::Inc | Token::Dec => {
                let token = self.advance().token;
                Ok(Stmt::IncDec { expr: first, token, location })
            }
            Token::Comma => {
                let mut lhs = vec![first];
                while self.at(Token::Comma) {
                    self.advance();
                    lhs.push(self.parse_expr()?);
                }
                let token = self.cur_token();
                if token != Token::Define && token != Token::Assign {
                    return Err(self.error("expected ':=' or '=' after expression list"));
                }
                self.advance();
                let rhs = self.parse_expr_list()?;
                Ok(Stmt::Assign { lhs, rhs, token, location })
            }
            token if token == Token::Define
                || token == Token::Assign
                || token.assign_base().is_some() =>
            {
                self.advance();
                let rhs = self.parse_expr_list()?;
                Ok(Stmt::Assign { lhs: vec![first], rhs, token, location })
            }
            _ => Ok(Stmt::Expr { expr: first }),
        }
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut out = vec![self.parse_expr()?];
        while self.at(Token::Comma) {
            self.advance();
            out.push(self.parse_expr()?);
        }
        Ok(out)
    }

    fn parse_decl(&mut self) -> Result<Stmt, CompileError> {
        let keyword = self.advance();
        let kind = match keyword.token {
            Token::Var => DeclKind::Var,
            Token::Const => DeclKind::Const,
            Token::Global => DeclKind::Global,
            _ => DeclKind::Param,
        };
        let location = keyword.location;

        let mut specs = Vec::new();
        if self.at(Token::LParen) {
            self.advance();
            self.skip_semicolons();
            while !self.at(Token::RParen) {
                specs.push(self.parse_decl_spec(kind)?);
                if self.at(Token::Comma) {
                    self.advance();
                }
                self.skip_semicolons();
            }
            self.expect(Token::RParen)?;
        } else {
            specs.push(self.parse_decl_spec(kind)?);
        }
        if specs.is_empty() {
            return Err(self.error(format!("empty {} declaration", kind.keyword())));
        }
        Ok(Stmt::Decl { kind, specs, location })
    }

    fn parse_decl_spec(&mut self, kind: DeclKind) -> Result<DeclSpec, CompileError> {
        let location = self.location();
        let variadic = if kind == DeclKind::Param && self.at(Token::Ellipsis) {
            self.advance();
            true
        } else {
            false
        };
        let name = self.expect(Token::Ident)?.literal;
        let value = if matches!(kind, DeclKind::Var | DeclKind::Const) && self.at(Token::Assign) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(DeclSpec { name, value, variadic, location })
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        let location = self.expect(Token::If)?.location;
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        let else_stmt = if self.at(Token::Else) {
            self.advance();
            if self.at(Token::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(Stmt::Block(self.parse_block()?)))
            }
        } else {
            None
        };
        Ok(Stmt::If { cond, body, else_stmt, location })
    }

    fn parse_try(&mut self) -> Result<Stmt, CompileError> {
        let location = self.expect(Token::Try)?.location;
        let body = self.parse_block()?;
        let catch = if self.at(Token::Catch) {
            let catch_location = self.advance().location;
            let ident = if self.at(Token::Ident) {
                Some(self.advance().literal)
            } else {
                None
            };
            let body = self.parse_block()?;
            Some(CatchClause { ident, body, location: catch_location })
        } else {
            None
        };
        let finally = if self.at(Token::Finally) {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error("try statement needs a catch or finally clause"));
        }
        Ok(Stmt::Try { body, catch, finally, location })
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        let location = self.expect(Token::For)?.location;

        // `for { … }` — infinite loop.
        if self.at(Token::LBrace) {
            let body = self.parse_block()?;
            return Ok(Stmt::For { init: None, cond: None, post: None, body, location });
        }

        // `for v in x` / `for k, v in x`.
        if self.at(Token::Ident)
            && (self.peek_token(1) == Token::In
                || (self.peek_token(1) == Token::Comma
                    && self.peek_token(2) == Token::Ident
                    && self.peek_token(3) == Token::In))
        {
            return self.parse_for_in(location);
        }

        let mut init = None;
        let mut cond = None;
        if self.at(Token::Semicolon) {
            self.advance();
        } else {
            let first = self.parse_simple_stmt()?;
            if self.at(Token::LBrace) {
                // `for cond { … }`.
                match first {
                    Stmt::Expr { expr } => {
                        let body = self.parse_block()?;
                        return Ok(Stmt::For {
                            init: None,
                            cond: Some(expr),
                            post: None,
                            body,
                            location,
                        });
                    }
                    _ => return Err(self.error("for condition must be an expression")),
                }
            }
            init = Some(Box::new(first));
            self.expect(Token::Semicolon)?;
        }
        if !self.at(Token::Semicolon) {
            cond = Some(self.parse_expr()?);
        }
        self.expect(Token::Semicolon)?;
        let post = if self.at(Token::LBrace) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        let body = self.parse_block()?;
        Ok(Stmt::For { init, cond, post, body, location })
    }

    fn parse_for_in(&mut self, location: SourceLocation) -> Result<Stmt, CompileError> {
        let first = self.expect(Token::Ident)?.literal;
        let (key, value) = if self.at(Token::Comma) {
            self.advance();
            let second = self.expect(Token::Ident)?.literal;
            (first, second)
        } else {
            ("_".to_string(), first)
        };
        self.expect(Token::In)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::ForIn { key, value, iterable, body, location })
    }

    fn parse_return(&mut self) -> Result<Stmt, CompileError> {
        let location = self.expect(Token::Return)?.location;
        let mut results = Vec::new();
        if !matches!(self.cur_token(), Token::Semicolon | Token::RBrace | Token::Eof) {
            results = self.parse_expr_list()?;
        }
        Ok(Stmt::Return { results, location })
    }

    fn parse_block(&mut self) -> Result<Block, CompileError> {
        let location = self.expect(Token::LBrace)?.location;
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !self.at(Token::RBrace) && !self.at(Token::Eof) {
            stmts.push(self.parse_stmt()?);
            self.skip_semicolons();
        }
        self.expect(Token::RBrace)?;
        Ok(Block { stmts, location })
    }

    // === Expressions ===

    pub fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let token = self.cur_token();
            let prec = token.precedence();
            if prec < min_prec || prec == 0 {
                return Ok(left);
            }
            match token {
                Token::Question => {
                    let location = self.advance().location;
                    let true_expr = self.parse_binary(1)?;
                    self.expect(Token::Colon)?;
                    // Right-associative: `a ? b : c ? d : e` groups rightward.
                    let false_expr = self.parse_binary(1)?;
                    left = Expr::Cond {
                        cond: Box::new(left),
                        true_expr: Box::new(true_expr),
                        false_expr: Box::new(false_expr),
                        location,
                    };
                }
                _ if token.is_binary_operator()
                    || token == Token::LAnd
                    || token == Token::LOr =>
                {
                    let location = self.advance().location;
                    let right = self.parse_binary(prec + 1)?;
                    left = Expr::Binary {
                        token,
                        left: Box::new(left),
                        right: Box::new(right),
                        location,
                    };
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let token = self.cur_token();
        if token.is_unary_operator() {
            let location = self.advance().location;
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary { token, expr: Box::new(expr), location });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.cur_token() {
                Token::Period => {
                    let location = self.advance().location;
                    let sel = self.expect(Token::Ident)?.literal;
                    expr = Expr::Selector { expr: Box::new(expr), sel, location };
                }
                Token::LBrack => {
                    expr = self.parse_index_or_slice(expr)?;
                }
                Token::LParen => {
                    expr = self.parse_call(expr)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_index_or_slice(&mut self, base: Expr) -> Result<Expr, CompileError> {
        let location = self.expect(Token::LBrack)?.location;
        let low = if self.at(Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if self.at(Token::Colon) {
            self.advance();
            let high = if self.at(Token::RBrack) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect(Token::RBrack)?;
            return Ok(Expr::Slice { expr: Box::new(base), low, high, location });
        }
        self.expect(Token::RBrack)?;
        match low {
            Some(index) => Ok(Expr::Index { expr: Box::new(base), index, location }),
            None => Err(self.error("expected index expression")),
        }
    }

    fn parse_call(&mut self, func: Expr) -> Result<Expr, CompileError> {
        let location = self.expect(Token::LParen)?.location;
        let mut args = Vec::new();
        let mut expand = false;
        self.skip_semicolons();
        while !self.at(Token::RParen) {
            args.push(self.parse_expr()?);
            if self.at(Token::Ellipsis) {
                self.advance();
                expand = true;
                self.skip_semicolons();
                break;
            }
            if self.at(Token::Comma) {
                self.advance();
            }
            self.skip_semicolons();
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Call { func: Box::new(func), args, expand, location })
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let lexeme = self.cur().clone();
        let location = lexeme.location;
        match lexeme.token {
            Token::Ident => {
                self.advance();
                Ok(Expr::Ident { name: lexeme.literal, location })
            }
            Token::Int => {
                self.advance();
                let value = parse_int(&lexeme.literal)
                    .ok_or_else(|| CompileError::parse("invalid int literal", location))?;
                Ok(Expr::IntLit { value, location })
            }
            Token::Uint => {
                self.advance();
                let value = parse_uint(&lexeme.literal)
                    .ok_or_else(|| CompileError::parse("invalid uint literal", location))?;
                Ok(Expr::UintLit { value, location })
            }
            Token::Float => {
                self.advance();
                let value = lexeme
                    .literal
                    .parse::<f64>()
                    .map_err(|_| CompileError::parse("invalid float literal", location))?;
                Ok(Expr::FloatLit { value, location })
            }
            Token::Char => {
                self.advance();
                let value = lexeme
                    .literal
                    .chars()
                    .next()
                    .ok_or_else(|| CompileError::parse("invalid char literal", location))?;
                Ok(Expr::CharLit { value, location })
            }
            Token::String => {
                self.advance();
                Ok(Expr::StringLit { value: lexeme.literal, location })
            }
            Token::True | Token::False => {
                self.advance();
                Ok(Expr::BoolLit { value: lexeme.token == Token::True, location })
            }
            Token::Undefined => {
                self.advance();
                Ok(Expr::UndefinedLit { location })
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Paren { expr: Box::new(expr), location })
            }
            Token::LBrack => self.parse_array_lit(),
            Token::LBrace => self.parse_map_lit(),
            Token::Func => self.parse_func_lit(),
            Token::Import => {
                self.advance();
                self.expect(Token::LParen)?;
                let module = self.expect(Token::String)?.literal;
                self.expect(Token::RParen)?;
                Ok(Expr::Import { module, location })
            }
            Token::Illegal => Err(CompileError::parse(lexeme.literal, location)),
            other => Err(self.error(format!("unexpected token '{}'", other.symbol()))),
        }
    }

    fn parse_array_lit(&mut self) -> Result<Expr, CompileError> {
        let location = self.expect(Token::LBrack)?.location;
        let mut elements = Vec::new();
        self.skip_semicolons();
        while !self.at(Token::RBrack) {
            elements.push(self.parse_expr()?);
            if self.at(Token::Comma) {
                self.advance();
            }
            self.skip_semicolons();
        }
        self.expect(Token::RBrack)?;
        Ok(Expr::Array { elements, location })
    }

    fn parse_map_lit(&mut self) -> Result<Expr, CompileError> {
        let location = self.expect(Token::LBrace)?.location;
        let mut entries = Vec::new();
        self.skip_semicolons();
        while !self.at(Token::RBrace) {
            let entry_location = self.location();
            let key = match self.cur_token() {
                Token::Ident | Token::String => self.advance().literal,
                other => {
                    return Err(self.error(format!(
                        "map key must be an identifier or string, found '{}'",
                        other.symbol()
                    )))
                }
            };
            self.expect(Token::Colon)?;
            let value = self.parse_expr()?;
            entries.push(MapEntry { key, value, location: entry_location });
            if self.at(Token::Comma) {
                self.advance();
            }
            self.skip_semicolons();
        }
        self.expect(Token::RBrace)?;
        Ok(Expr::Map { entries, location })
    }

    fn parse_func_lit(&mut self) -> Result<Expr, CompileError> {
        let location = self.expect(Token::Func)?.location;
        self.expect(Token::LParen)?;
        let params_location = self.location();
        let mut names = Vec::new();
        let mut variadic = false;
        while !self.at(Token::RParen) {
            if self.at(Token::Ellipsis) {
                self.advance();
                variadic = true;
                names.push(self.expect(Token::Ident)?.literal);
                break;
            }
            names.push(self.expect(Token::Ident)?.literal);
            if self.at(Token::Comma) {
                self.advance();
            }
        }
        self.expect(Token::RParen)?;
        let body = self.parse_block()?;
        Ok(Expr::FuncLit {
            params: FuncParams { names, variadic, location: params_location },
            body,
            location,
        })
    }
}

fn parse_int(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_uint(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> File {
        parse_source(source).expect("parse failed")
    }

    #[test]
    fn test_precedence() {
        let file = parse("x := 2 + 3 * 4");
        let Stmt::Assign { rhs, token, .. } = &file.stmts[0] else {
            panic!("expected assign");
        };
        assert_eq!(*token, Token::Define);
        let Expr::Binary { token: add, right, .. } = &rhs[0] else {
            panic!("expected binary");
        };
        assert_eq!(*add, Token::Add);
        assert!(matches!(**right, Expr::Binary { token: Token::Mul, .. }));
    }

    #[test]
    fn test_ternary_right_associative() {
        let file = parse("x := a ? b : c ? d : e");
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        let Expr::Cond { false_expr, .. } = &rhs[0] else { panic!("expected cond") };
        assert!(matches!(**false_expr, Expr::Cond { .. }));
    }

    #[test]
    fn test_destructuring_define() {
        let file = parse("x, y := [1, 2, 3]");
        let Stmt::Assign { lhs, rhs, token, .. } = &file.stmts[0] else { panic!() };
        assert_eq!(lhs.len(), 2);
        assert_eq!(rhs.len(), 1);
        assert_eq!(*token, Token::Define);
    }

    #[test]
    fn test_for_variants() {
        assert!(matches!(
            parse("for { break }").stmts[0],
            Stmt::For { init: None, cond: None, post: None, .. }
        ));
        assert!(matches!(
            parse("for x < 3 { x++ }").stmts[0],
            Stmt::For { init: None, cond: Some(_), post: None, .. }
        ));
        assert!(matches!(
            parse("for i := 0; i < 3; i++ { }").stmts[0],
            Stmt::For { init: Some(_), cond: Some(_), post: Some(_), .. }
        ));
        let Stmt::ForIn { key, value, .. } = &parse("for k, v in m { }").stmts[0] else {
            panic!()
        };
        assert_eq!(key, "k");
        assert_eq!(value, "v");
        let Stmt::ForIn { key, value, .. } = &parse("for v in m { }").stmts[0] else {
            panic!()
        };
        assert_eq!(key, "_");
        assert_eq!(value, "v");
    }

    #[test]
    fn test_try_catch_finally() {
        let Stmt::Try { catch, finally, .. } =
            &parse("try { } catch err { } finally { }").stmts[0]
        else {
            panic!()
        };
        assert_eq!(catch.as_ref().unwrap().ident.as_deref(), Some("err"));
        assert!(finally.is_some());
        assert!(parse_source("try { }").is_err());
    }

    #[test]
    fn test_func_lit_and_call_expand() {
        let file = parse("f := func(a, ...rest) { return a }; f(1, xs...)");
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        let Expr::FuncLit { params, .. } = &rhs[0] else { panic!() };
        assert!(params.variadic);
        assert_eq!(params.names, vec!["a".to_string(), "rest".to_string()]);
        let Stmt::Expr { expr: Expr::Call { args, expand, .. } } = &file.stmts[1] else {
            panic!()
        };
        assert_eq!(args.len(), 2);
        assert!(expand);
    }

    #[test]
    fn test_selector_index_slice() {
        let file = parse("x := a.b[1][2:3]");
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        let Expr::Slice { expr, low, high, .. } = &rhs[0] else { panic!("expected slice") };
        assert!(low.is_some() && high.is_some());
        assert!(matches!(**expr, Expr::Index { .. }));
        let file = parse("y := a[:2]; z := a[1:]");
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        assert!(matches!(&rhs[0], Expr::Slice { low: None, high: Some(_), .. }));
        let Stmt::Assign { rhs, .. } = &file.stmts[1] else { panic!() };
        assert!(matches!(&rhs[0], Expr::Slice { low: Some(_), high: None, .. }));
    }

    #[test]
    fn test_decl_groups() {
        let Stmt::Decl { kind, specs, .. } = &parse("const (a = iota, b, c)").stmts[0] else {
            panic!()
        };
        assert_eq!(*kind, DeclKind::Const);
        assert_eq!(specs.len(), 3);
        assert!(specs[0].value.is_some());
        assert!(specs[1].value.is_none());

        let Stmt::Decl { kind, specs, .. } = &parse("param (a, b, ...rest)").stmts[0] else {
            panic!()
        };
        assert_eq!(*kind, DeclKind::Param);
        assert!(specs[2].variadic);
    }

    #[test]
    fn test_import_expr() {
        let file = parse(r#"strings := import("strings")"#);
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        let Expr::Import { module, .. } = &rhs[0] else { panic!() };
        assert_eq!(module, "strings");
    }

    #[test]
    fn test_map_literal() {
        let file = parse(r#"m := {a: 1, "b c": 2}"#);
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        let Expr::Map { entries, .. } = &rhs[0] else { panic!() };
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[1].key, "b c");
    }

    #[test]
    fn test_hex_and_uint_literals() {
        let file = parse("a := 0x2a; b := 7u");
        let Stmt::Assign { rhs, .. } = &file.stmts[0] else { panic!() };
        assert!(matches!(rhs[0], Expr::IntLit { value: 42, .. }));
        let Stmt::Assign { rhs, .. } = &file.stmts[1] else { panic!() };
        assert!(matches!(rhs[0], Expr::UintLit { value: 7, .. }));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = parse_source("x := ]").unwrap_err();
        assert_eq!(err.kind, crate::errors::CompileErrorKind::Parse);
        assert!(err.location.is_known());
    }
}
