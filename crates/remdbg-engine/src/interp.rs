//! Tree-walking evaluator for the script language.
//!
//! Every statement boundary is a trace event: parked injection payloads are
//! drained there and the per-thread trace hook, when installed, gets a
//! chance to stop the thread in the debug shell. Call and return events
//! bracket user function bodies so `next` can step over them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{EngineError, ScriptError};
use crate::parser::{self, BinOp, Expr, FunctionDef, Stmt, StmtKind, UnOp};
use crate::trace::{self, TraceEvent};
use crate::traceback::{Traceback, TracebackFrame};
use crate::value::Value;

/// Shared mutable variable scope. Scopes never leave their thread.
pub type ScopeRef = Rc<RefCell<HashMap<String, Value>>>;

const MAX_CALL_DEPTH: usize = 64;

#[derive(Debug)]
pub(crate) struct FrameInfo {
    pub function: String,
    pub line: u32,
    pub scope: ScopeRef,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Debug)]
pub struct Interp {
    file: Arc<str>,
    funcs: HashMap<String, Arc<FunctionDef>>,
    /// Call stack; index 0 is the module frame whose scope is the globals.
    stack: Vec<FrameInfo>,
    /// Stored by `try`/`catch`; what `post_mortem()` examines.
    last_traceback: Option<Traceback>,
    /// Cleared while the debug shell evaluates user input, so that input
    /// neither emits trace events nor clobbers the reported location.
    tracing_enabled: bool,
}

impl Interp {
    pub fn new(file: impl Into<Arc<str>>) -> Self {
        Self::with_globals(file, HashMap::new())
    }

    pub fn with_globals(file: impl Into<Arc<str>>, globals: HashMap<String, Value>) -> Self {
        Self {
            file: file.into(),
            funcs: HashMap::new(),
            stack: vec![FrameInfo {
                function: "<module>".to_string(),
                line: 0,
                scope: Rc::new(RefCell::new(globals)),
            }],
            last_traceback: None,
            tracing_enabled: true,
        }
    }

    pub fn file(&self) -> &Arc<str> {
        &self.file
    }

    /// The module scope.
    pub fn globals_ref(&self) -> ScopeRef {
        self.stack[0].scope.clone()
    }

    /// The innermost frame's scope.
    pub fn current_scope(&self) -> ScopeRef {
        self.stack
            .last()
            .expect("interpreter always has a module frame")
            .scope
            .clone()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn current_line(&self) -> u32 {
        self.stack
            .last()
            .expect("interpreter always has a module frame")
            .line
    }

    pub fn current_function(&self) -> String {
        self.stack
            .last()
            .expect("interpreter always has a module frame")
            .function
            .clone()
    }

    pub fn last_traceback(&self) -> Option<&Traceback> {
        self.last_traceback.as_ref()
    }

    fn set_line(&mut self, line: u32) {
        if let Some(top) = self.stack.last_mut() {
            top.line = line;
        }
    }

    /// Execute a whole program in the module frame.
    pub fn run(&mut self, program: &[Stmt]) -> Result<(), EngineError> {
        match self.exec_block(program) {
            Ok(_) => Ok(()),
            Err(e) => {
                if let EngineError::Script(se) = &e {
                    self.last_traceback = Some(se.traceback.clone());
                }
                Err(e)
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, EngineError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// Emit a line trace event at `line`, unless shell input is running.
    fn line_event(&mut self, line: u32) -> Result<(), EngineError> {
        if !self.tracing_enabled {
            return Ok(());
        }
        self.set_line(line);
        trace::trace_event(self, TraceEvent::Line)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, EngineError> {
        self.line_event(stmt.line)?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { name, op, value } => {
                let mut value = self.eval(value)?;
                if let Some(op) = op {
                    let current = self.lookup_var(name)?;
                    value = self.binop(*op, current, value)?;
                }
                self.assign_var(name, value);
                Ok(Flow::Normal)
            }
            StmtKind::While { cond, body } => {
                let mut first = true;
                loop {
                    if !first {
                        self.line_event(stmt.line)?;
                    }
                    first = false;
                    if !self.eval(cond)?.truthy() {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval(cond)?.truthy() {
                    self.exec_block(then_body)
                } else {
                    self.exec_block(else_body)
                }
            }
            StmtKind::Try {
                body,
                binding,
                handler,
            } => match self.exec_block(body) {
                Ok(flow) => Ok(flow),
                Err(EngineError::Script(err)) => {
                    self.last_traceback = Some(err.traceback.clone());
                    if let Some(name) = binding {
                        self.assign_var(name, Value::Str(err.message.clone()));
                    }
                    self.exec_block(handler)
                }
                Err(other) => Err(other),
            },
            StmtKind::FnDef(def) => {
                self.funcs.insert(def.name.clone(), def.clone());
                Ok(Flow::Normal)
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval(e)?,
                    None => Value::Unit,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EngineError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup_var(name),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match (op, value) {
                    (UnOp::Neg, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
                    (UnOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
                    (UnOp::Not, v) => Ok(Value::Bool(!v.truthy())),
                    (UnOp::Neg, v) => {
                        Err(self.raise(&format!("cannot negate {}", v.type_name())))
                    }
                }
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if !left.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if left.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Binary(op, lhs, rhs) => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                self.binop(*op, left, right)
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values)
            }
        }
    }

    pub(crate) fn lookup_var(&self, name: &str) -> Result<Value, EngineError> {
        if let Some(v) = self.current_scope().borrow().get(name) {
            return Ok(v.clone());
        }
        if self.depth() > 1 {
            if let Some(v) = self.globals_ref().borrow().get(name) {
                return Ok(v.clone());
            }
        }
        Err(self.raise(&format!("undefined variable `{}`", name)))
    }

    pub(crate) fn assign_var(&mut self, name: &str, value: Value) {
        self.current_scope()
            .borrow_mut()
            .insert(name.to_string(), value);
    }

    fn binop(&self, op: BinOp, left: Value, right: Value) -> Result<Value, EngineError> {
        use Value::*;
        let result = match (op, &left, &right) {
            (BinOp::Add, Str(a), Str(b)) => Str(format!("{}{}", a, b)),
            (BinOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(*b)),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(*b)),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(*b)),
            (BinOp::Div, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(self.raise("division by zero"));
                }
                Int(a / b)
            }
            (BinOp::Rem, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(self.raise("division by zero"));
                }
                Int(a % b)
            }
            (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem, _, _) => {
                match (as_float(&left), as_float(&right)) {
                    (Some(a), Some(b)) => {
                        if matches!(op, BinOp::Div | BinOp::Rem) && b == 0.0 {
                            return Err(self.raise("division by zero"));
                        }
                        Float(match op {
                            BinOp::Add => a + b,
                            BinOp::Sub => a - b,
                            BinOp::Mul => a * b,
                            BinOp::Div => a / b,
                            BinOp::Rem => a % b,
                            _ => unreachable!(),
                        })
                    }
                    _ => {
                        return Err(self.raise(&format!(
                            "unsupported operands: {} and {}",
                            left.type_name(),
                            right.type_name()
                        )));
                    }
                }
            }
            (BinOp::Eq, _, _) => Bool(values_equal(&left, &right)),
            (BinOp::Ne, _, _) => Bool(!values_equal(&left, &right)),
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, _, _) => {
                let ordering = compare(&left, &right).ok_or_else(|| {
                    self.raise(&format!(
                        "cannot compare {} with {}",
                        left.type_name(),
                        right.type_name()
                    ))
                })?;
                Bool(match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                })
            }
            (BinOp::And | BinOp::Or, _, _) => unreachable!("short-circuited in eval"),
        };
        Ok(result)
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        if let Some(def) = self.funcs.get(name).cloned() {
            return self.call_function(def, args);
        }
        self.call_builtin(name, args)
    }

    fn call_function(
        &mut self,
        def: Arc<FunctionDef>,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        if args.len() != def.params.len() {
            return Err(self.raise(&format!(
                "{}() takes {} arguments, got {}",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        if self.depth() >= MAX_CALL_DEPTH {
            return Err(self.raise("maximum call depth exceeded"));
        }
        let mut locals = HashMap::new();
        for (param, value) in def.params.iter().zip(args) {
            locals.insert(param.clone(), value);
        }
        self.stack.push(FrameInfo {
            function: def.name.clone(),
            line: def.line,
            scope: Rc::new(RefCell::new(locals)),
        });
        let result = (|| {
            if self.tracing_enabled {
                trace::trace_event(self, TraceEvent::Call)?;
            }
            let flow = self.exec_block(&def.body)?;
            if self.tracing_enabled {
                trace::trace_event(self, TraceEvent::Return)?;
            }
            Ok(match flow {
                Flow::Return(v) => v,
                _ => Value::Unit,
            })
        })();
        self.stack.pop();
        result
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        match name {
            "print" => {
                let text = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", text);
                Ok(Value::Unit)
            }
            "sleep" => {
                let seconds = match args.as_slice() {
                    [Value::Int(n)] if *n >= 0 => *n as f64,
                    [Value::Float(x)] if *x >= 0.0 => *x,
                    _ => return Err(self.raise("sleep() takes one non-negative number")),
                };
                crate::inject::interruptible_sleep(self, Duration::from_secs_f64(seconds))?;
                Ok(Value::Unit)
            }
            "str" => match args.as_slice() {
                [v] => Ok(Value::Str(v.to_string())),
                _ => Err(self.raise("str() takes one argument")),
            },
            "int" => match args.as_slice() {
                [Value::Int(n)] => Ok(Value::Int(*n)),
                [Value::Float(x)] => Ok(Value::Int(*x as i64)),
                [Value::Bool(b)] => Ok(Value::Int(*b as i64)),
                [Value::Str(s)] => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| self.raise(&format!("cannot parse {:?} as int", s))),
                _ => Err(self.raise("int() takes one argument")),
            },
            "float" => match args.as_slice() {
                [Value::Int(n)] => Ok(Value::Float(*n as f64)),
                [Value::Float(x)] => Ok(Value::Float(*x)),
                [Value::Str(s)] => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| self.raise(&format!("cannot parse {:?} as float", s))),
                _ => Err(self.raise("float() takes one argument")),
            },
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                _ => Err(self.raise("len() takes one string")),
            },
            "argc" => {
                if !args.is_empty() {
                    return Err(self.raise("argc() takes no arguments"));
                }
                Ok(Value::Int(crate::host_state::argv().len() as i64))
            }
            "argv" => match args.as_slice() {
                [Value::Int(i)] => {
                    let argv = crate::host_state::argv();
                    let index = usize::try_from(*i).ok();
                    match index.and_then(|i| argv.get(i)) {
                        Some(arg) => Ok(Value::Str(arg.clone())),
                        None => Err(self.raise(&format!("argv({}) out of range", i))),
                    }
                }
                _ => Err(self.raise("argv() takes one index")),
            },
            "set_trace" => {
                if !args.is_empty() {
                    return Err(self.raise("set_trace() takes no arguments"));
                }
                trace::set_trace_builtin(self)?;
                Ok(Value::Unit)
            }
            "post_mortem" => {
                if !args.is_empty() {
                    return Err(self.raise("post_mortem() takes no arguments"));
                }
                trace::post_mortem_builtin(self)?;
                Ok(Value::Unit)
            }
            _ => Err(self.raise(&format!("undefined function `{}`", name))),
        }
    }

    pub(crate) fn raise(&self, message: &str) -> EngineError {
        EngineError::Script(ScriptError {
            message: message.to_string(),
            traceback: self.snapshot_traceback(message),
        })
    }

    /// Capture the live call stack as an owned traceback.
    pub fn snapshot_traceback(&self, message: &str) -> Traceback {
        let frames = self
            .stack
            .iter()
            .map(|frame| {
                let mut vars: Vec<(String, Value)> = frame
                    .scope
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                vars.sort_by(|a, b| a.0.cmp(&b.0));
                TracebackFrame {
                    function: frame.function.clone(),
                    file: self.file.to_string(),
                    line: frame.line,
                    vars,
                }
            })
            .collect();
        Traceback {
            message: message.to_string(),
            frames,
        }
    }

    /// One line per frame, innermost marked, for the shell's `where`.
    pub fn format_where(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.stack.iter().enumerate() {
            let marker = if i + 1 == self.stack.len() { "> " } else { "  " };
            out.push_str(&format!(
                "{}{}({}){}\n",
                marker, self.file, frame.line, frame.function
            ));
        }
        out
    }

    /// Execute one statement of debug-shell input against the current frame.
    /// Expression statements yield their value. No trace events are emitted
    /// and the reported location is left untouched.
    pub fn eval_shell_input(&mut self, src: &str) -> Result<Option<Value>, EngineError> {
        let Some(stmt) = parser::parse_shell_input(src)? else {
            return Ok(None);
        };
        let saved_line = self.current_line();
        let was_tracing = self.tracing_enabled;
        self.tracing_enabled = false;
        let result = match &stmt.kind {
            StmtKind::Expr(expr) => self.eval(expr).map(Some),
            _ => self.exec_stmt(&stmt).map(|_| None),
        };
        self.tracing_enabled = was_tracing;
        self.set_line(saved_line);
        result
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => {
            let x = as_float(a)?;
            let y = as_float(b)?;
            x.partial_cmp(&y)
        }
    }
}
