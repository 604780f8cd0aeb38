//! Recursive-descent parser producing the statement tree the interpreter
//! walks. Every statement carries the line it started on; those lines are
//! what the trace dispatcher reports to the debug shell.

use std::sync::Arc;

use crate::errors::EngineError;
use crate::lexer::{lex, Tok, Token};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        name: String,
        op: Option<BinOp>,
        value: Expr,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        binding: Option<String>,
        handler: Vec<Stmt>,
    },
    FnDef(Arc<FunctionDef>),
    Return(Option<Expr>),
    Break,
    Continue,
}

/// Parse a whole script.
pub fn parse(src: &str) -> Result<Vec<Stmt>, EngineError> {
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

/// Parse a single statement of debugger input. Blank input yields `None`.
pub fn parse_shell_input(src: &str) -> Result<Option<Stmt>, EngineError> {
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.skip_newlines();
    if parser.at_end() {
        return Ok(None);
    }
    let stmt = parser.statement()?;
    parser.skip_newlines();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(Some(stmt))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), EngineError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Tok::Newline) {}
    }

    fn error(&self, message: &str) -> EngineError {
        EngineError::Syntax {
            line: self.line(),
            message: message.to_string(),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, EngineError> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.at_end() {
            stmts.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_newlines();
        }
        Ok(stmts)
    }

    /// A statement ends at a newline, before a closing brace, or at EOF.
    fn end_of_statement(&mut self) -> Result<(), EngineError> {
        match self.peek() {
            None | Some(Tok::RBrace) => Ok(()),
            Some(Tok::Newline) => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.error("expected end of statement")),
        }
    }

    fn statement(&mut self) -> Result<Stmt, EngineError> {
        let line = self.line();
        let kind = match self.peek() {
            Some(Tok::Fn) => self.fn_def()?,
            Some(Tok::While) => self.while_stmt()?,
            Some(Tok::If) => self.if_stmt()?,
            Some(Tok::Try) => self.try_stmt()?,
            Some(Tok::Return) => {
                self.pos += 1;
                let value = match self.peek() {
                    None | Some(Tok::Newline) | Some(Tok::RBrace) => None,
                    _ => Some(self.expression()?),
                };
                StmtKind::Return(value)
            }
            Some(Tok::Break) => {
                self.pos += 1;
                StmtKind::Break
            }
            Some(Tok::Continue) => {
                self.pos += 1;
                StmtKind::Continue
            }
            _ => self.assign_or_expr()?,
        };
        Ok(Stmt { line, kind })
    }

    fn fn_def(&mut self) -> Result<StmtKind, EngineError> {
        let line = self.line();
        self.expect(Tok::Fn, "`fn`")?;
        let name = self.ident("function name")?;
        self.expect(Tok::LParen, "`(` after function name")?;
        let mut params = Vec::new();
        if self.peek() != Some(&Tok::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "`)` after parameters")?;
        let body = self.block()?;
        Ok(StmtKind::FnDef(Arc::new(FunctionDef {
            name,
            params,
            body,
            line,
        })))
    }

    fn while_stmt(&mut self) -> Result<StmtKind, EngineError> {
        self.expect(Tok::While, "`while`")?;
        let cond = self.expression()?;
        let body = self.block()?;
        Ok(StmtKind::While { cond, body })
    }

    fn if_stmt(&mut self) -> Result<StmtKind, EngineError> {
        self.expect(Tok::If, "`if`")?;
        let cond = self.expression()?;
        let then_body = self.block()?;
        let mut else_body = Vec::new();
        // `else` may sit on the line after the closing brace.
        let checkpoint = self.pos;
        self.skip_newlines();
        if self.eat(&Tok::Else) {
            if self.peek() == Some(&Tok::If) {
                let line = self.line();
                let kind = self.if_stmt()?;
                else_body.push(Stmt { line, kind });
            } else {
                else_body = self.block()?;
            }
        } else {
            self.pos = checkpoint;
        }
        Ok(StmtKind::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn try_stmt(&mut self) -> Result<StmtKind, EngineError> {
        self.expect(Tok::Try, "`try`")?;
        let body = self.block()?;
        self.skip_newlines();
        self.expect(Tok::Catch, "`catch` after `try` block")?;
        let binding = match self.peek() {
            Some(Tok::Ident(_)) => Some(self.ident("catch binding")?),
            _ => None,
        };
        let handler = self.block()?;
        Ok(StmtKind::Try {
            body,
            binding,
            handler,
        })
    }

    fn assign_or_expr(&mut self) -> Result<StmtKind, EngineError> {
        if let Some(Tok::Ident(name)) = self.peek().cloned() {
            let op = match self.tokens.get(self.pos + 1).map(|t| &t.tok) {
                Some(Tok::Assign) => Some(None),
                Some(Tok::PlusAssign) => Some(Some(BinOp::Add)),
                Some(Tok::MinusAssign) => Some(Some(BinOp::Sub)),
                Some(Tok::StarAssign) => Some(Some(BinOp::Mul)),
                Some(Tok::SlashAssign) => Some(Some(BinOp::Div)),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 2;
                let value = self.expression()?;
                return Ok(StmtKind::Assign { name, op, value });
            }
        }
        Ok(StmtKind::Expr(self.expression()?))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, EngineError> {
        self.skip_newlines();
        self.expect(Tok::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        self.skip_newlines();
        while self.peek() != Some(&Tok::RBrace) {
            if self.at_end() {
                return Err(self.error("unterminated block, expected `}`"));
            }
            stmts.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_newlines();
        }
        self.expect(Tok::RBrace, "`}`")?;
        Ok(stmts)
    }

    fn ident(&mut self, what: &str) -> Result<String, EngineError> {
        if let Some(Tok::Ident(name)) = self.peek().cloned() {
            self.pos += 1;
            Ok(name)
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    // Expression grammar, lowest precedence first.

    fn expression(&mut self) -> Result<Expr, EngineError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EngineError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.unary()?)))
            }
            Some(Tok::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, EngineError> {
        if self.at_end() {
            return Err(self.error("expected expression"));
        }
        match self.advance() {
            Some(Tok::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Tok::Float(x)) => Ok(Expr::Literal(Value::Float(x))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Tok::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "`)` after arguments")?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Tok::LParen) => {
                let inner = self.expression()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected expression"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments() {
        let stmts = parse("x = 1\ny = x + 2\nx += 1").unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(
            &stmts[2].kind,
            StmtKind::Assign {
                op: Some(BinOp::Add),
                ..
            }
        ));
        assert_eq!(stmts[1].line, 2);
    }

    #[test]
    fn test_parse_while_loop() {
        let stmts = parse("conti = true\nwhile conti {\n    sleep(0.1)\n}").unwrap();
        let StmtKind::While { body, .. } = &stmts[1].kind else {
            panic!("expected while");
        };
        assert_eq!(body.len(), 1);
        assert_eq!(body[0].line, 3);
    }

    #[test]
    fn test_parse_if_else_chain() {
        let src = "if a {\n  x = 1\n} else if b {\n  x = 2\n} else {\n  x = 3\n}";
        let stmts = parse(src).unwrap();
        let StmtKind::If { else_body, .. } = &stmts[0].kind else {
            panic!("expected if");
        };
        assert!(matches!(&else_body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_parse_fn_def_and_call() {
        let src = "fn divide(a, b) {\n    return a / b\n}\nresult = divide(1, 0)";
        let stmts = parse(src).unwrap();
        let StmtKind::FnDef(def) = &stmts[0].kind else {
            panic!("expected fn def");
        };
        assert_eq!(def.name, "divide");
        assert_eq!(def.params, vec!["a", "b"]);
        assert!(matches!(
            &stmts[1].kind,
            StmtKind::Assign { op: None, .. }
        ));
    }

    #[test]
    fn test_parse_try_catch() {
        let src = "try {\n    divide(1, 0)\n}\ncatch err {\n    post_mortem()\n}";
        let stmts = parse(src).unwrap();
        let StmtKind::Try { binding, .. } = &stmts[0].kind else {
            panic!("expected try");
        };
        assert_eq!(binding.as_deref(), Some("err"));
    }

    #[test]
    fn test_precedence() {
        let stmts = parse("r = 1 + 2 * 3 == 7").unwrap();
        let StmtKind::Assign { value, .. } = &stmts[0].kind else {
            panic!("expected assign");
        };
        // ((1 + (2 * 3)) == 7)
        let Expr::Binary(BinOp::Eq, lhs, _) = value else {
            panic!("expected == at the root");
        };
        assert!(matches!(**lhs, Expr::Binary(BinOp::Add, _, _)));
    }

    #[test]
    fn test_shell_input_single_statement() {
        let stmt = parse_shell_input("value_to_change += 1\n").unwrap().unwrap();
        assert!(matches!(stmt.kind, StmtKind::Assign { .. }));
        assert!(parse_shell_input("   \n").unwrap().is_none());
        assert!(parse_shell_input("a = 1\nb = 2").is_err());
    }

    #[test]
    fn test_unterminated_block_fails() {
        let err = parse("while true {\n  x = 1\n").unwrap_err();
        assert!(matches!(err, EngineError::Syntax { .. }));
    }

    #[test]
    fn test_call_with_no_args() {
        let stmts = parse("set_trace()").unwrap();
        let StmtKind::Expr(Expr::Call { name, args }) = &stmts[0].kind else {
            panic!("expected call");
        };
        assert_eq!(name, "set_trace");
        assert!(args.is_empty());
    }
}
