//! Reference Interpreter
//!
//! A tree-walking evaluator over the same AST the native backend consumes.
//! It is the oracle for behavioral-equivalence tests, so wherever the two
//! could disagree it follows what the generated machine code does: 64-bit
//! wrapping integers, SDIV semantics for division by zero, fused float
//! remainder, C `%g` float text, and both sides of `&&`/`||` evaluated.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use tracing::debug;

use crate::arm64::data::expand_escapes;
use crate::ast::{BinaryOp, Expr, FuncDef, InterpolationPart, LoopRange, LoopStmt, Program, Stmt, UnaryOp};
use crate::{JibJabError, Result};

/// Runtime values
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Nil,
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered
    Dict(Vec<(String, Value)>),
    /// An enum declaration used as a value; its cases evaluate to `Str`
    Enum { name: String, cases: Vec<String> },
}

impl Value {
    /// Form used inside composites: strings are double-quoted
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }

    /// Non-zero numbers and every string are true
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::Str(_) => true,
            Value::Nil => false,
            Value::Array(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Dict(fields) => !fields.is_empty(),
            Value::Enum { .. } => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Nil => "nil",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Enum { .. } => "enum",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_g(*x)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Nil => write!(f, "nil"),
            Value::Array(items) => write!(f, "[{}]", join(items.iter().map(Value::repr))),
            Value::Tuple(items) => write!(f, "({})", join(items.iter().map(Value::repr))),
            Value::Dict(fields) => write!(
                f,
                "{{{}}}",
                join(fields.iter().map(|(k, v)| format!("\"{}\": {}", k, v.repr())))
            ),
            Value::Enum { cases, .. } => write!(
                f,
                "{{{}}}",
                join(cases.iter().map(|c| format!("\"{}\": {}", c, c)))
            ),
        }
    }
}

fn join(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(", ")
}

/// Format a double the way C's `printf("%g")` does: six significant digits,
/// trailing zeros removed, scientific notation below 1e-4 or from 1e6 up
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // The exponent after rounding to PRECISION significant digits
    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (scientific.clone(), 0),
    };

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            strip_fraction_zeros(&mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_fraction_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn runtime<T>(message: impl Into<String>) -> Result<T> {
    Err(JibJabError::Runtime {
        message: message.into(),
    })
}

/// Statement outcome
enum Flow {
    Next,
    Return(Value),
}

/// Tree-walking interpreter writing program output to `out`
pub struct Interpreter<W: Write> {
    out: W,
    functions: HashMap<String, FuncDef>,
    enums: HashMap<String, Vec<String>>,
    /// One variable map per active call; the first is the top level.
    /// Functions only see their own frame.
    frames: Vec<HashMap<String, Value>>,
}

impl<W: Write> Interpreter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            functions: HashMap::new(),
            enums: HashMap::new(),
            frames: vec![HashMap::new()],
        }
    }

    /// Run a whole program
    pub fn run(&mut self, program: &Program) -> Result<()> {
        // Top-level functions and enums are visible from the first statement
        for stmt in &program.statements {
            match stmt {
                Stmt::FuncDef(def) => {
                    self.functions.insert(def.name.clone(), def.clone());
                }
                Stmt::EnumDef { name, cases } => {
                    self.enums.insert(name.clone(), cases.clone());
                }
                _ => {}
            }
        }
        debug!(
            functions = self.functions.len(),
            enums = self.enums.len(),
            "interpreting program"
        );

        for stmt in &program.statements {
            if matches!(stmt, Stmt::FuncDef(_)) {
                continue;
            }
            if let Flow::Return(_) = self.exec(stmt)? {
                return runtime("return outside a function");
            }
        }
        self.out.flush()?;
        Ok(())
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn exec_block(&mut self, statements: &[Stmt]) -> Result<Flow> {
        for stmt in statements {
            if let Flow::Return(value) = self.exec(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::Print(expr) => {
                let value = self.eval(expr)?;
                writeln!(self.out, "{}", value)?;
            }
            Stmt::VarDecl { name, value } => {
                let value = self.eval(value)?;
                self.set(name, value);
            }
            Stmt::Loop(stmt) => return self.exec_loop(stmt),
            Stmt::If {
                condition,
                then_body,
                else_body,
            } => {
                if self.eval(condition)?.truthy() {
                    return self.exec_block(then_body);
                } else if let Some(body) = else_body {
                    return self.exec_block(body);
                }
            }
            Stmt::FuncDef(def) => {
                self.functions.insert(def.name.clone(), def.clone());
            }
            Stmt::Return(value) => return Ok(Flow::Return(self.eval(value)?)),
            Stmt::EnumDef { name, cases } => {
                self.enums.insert(name.clone(), cases.clone());
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Try { .. } => return runtime("try/catch is not supported"),
            Stmt::Throw(_) => return runtime("throw is not supported"),
        }
        Ok(Flow::Next)
    }

    fn exec_loop(&mut self, stmt: &LoopStmt) -> Result<Flow> {
        match &stmt.range {
            LoopRange::Counted { start, end } => {
                let start = self.eval_int(start, "loop start")?;
                self.set(&stmt.var, Value::Int(start));
                let end = self.eval_int(end, "loop end")?;
                loop {
                    // The counter is re-read each iteration; the body may move it
                    let i = self.counter(&stmt.var)?;
                    if i >= end {
                        break;
                    }
                    if let Flow::Return(value) = self.exec_block(&stmt.body)? {
                        return Ok(Flow::Return(value));
                    }
                    let i = self.counter(&stmt.var)?;
                    self.set(&stmt.var, Value::Int(i.wrapping_add(1)));
                }
            }
            LoopRange::Collection(collection) => {
                let items = match self.eval(collection)? {
                    Value::Array(items) | Value::Tuple(items) => items,
                    Value::Dict(fields) => fields.into_iter().map(|(k, _)| Value::Str(k)).collect(),
                    Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                    other => return runtime(format!("cannot iterate over {}", other.type_name())),
                };
                for item in items {
                    self.set(&stmt.var, item);
                    if let Flow::Return(value) = self.exec_block(&stmt.body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            LoopRange::Condition(condition) => {
                while self.eval(condition)?.truthy() {
                    if let Flow::Return(value) = self.exec_block(&stmt.body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    fn counter(&self, var: &str) -> Result<i64> {
        match self.get(var) {
            Some(Value::Int(i)) => Ok(*i),
            _ => runtime(format!("loop counter `{}` is no longer an integer", var)),
        }
    }

    fn frame(&mut self) -> &mut HashMap<String, Value> {
        if self.frames.is_empty() {
            self.frames.push(HashMap::new());
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn set(&mut self, name: &str, value: Value) {
        self.frame().insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.frames.last().and_then(|frame| frame.get(name))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn eval_int(&mut self, expr: &Expr, what: &str) -> Result<i64> {
        match self.eval(expr)? {
            Value::Int(i) => Ok(i),
            other => runtime(format!("{} must be an int, got {}", what, other.type_name())),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(unescape(s))),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Nil => Ok(Value::Nil),
            Expr::Var(name) => match self.get(name) {
                Some(value) => Ok(value.clone()),
                None => match self.enums.get(name) {
                    Some(cases) => Ok(Value::Enum {
                        name: name.clone(),
                        cases: cases.clone(),
                    }),
                    None => runtime(format!("undefined variable `{}`", name)),
                },
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::Array(items) => Ok(Value::Array(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Expr::Dict(entries) => {
                let mut fields: Vec<(String, Value)> = Vec::with_capacity(entries.len());
                for entry in entries {
                    let key = match self.eval(&entry.key)? {
                        Value::Str(key) => key,
                        other => {
                            return runtime(format!("dict keys must be strings, got {}", other.type_name()))
                        }
                    };
                    let value = self.eval(&entry.value)?;
                    match fields.iter_mut().find(|(k, _)| *k == key) {
                        Some(field) => field.1 = value,
                        None => fields.push((key, value)),
                    }
                }
                Ok(Value::Dict(fields))
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, index)
            }
            Expr::Interpolation(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        InterpolationPart::Text(t) => text.push_str(&unescape(t)),
                        InterpolationPart::Var(name) => {
                            let value = self.eval(&Expr::Var(name.clone()))?;
                            text.push_str(&value.to_string());
                        }
                    }
                }
                Ok(Value::Str(text))
            }
            Expr::Input(_) => runtime("input is not available"),
        }
    }

    fn eval_all(&mut self, items: &[Expr]) -> Result<Vec<Value>> {
        items.iter().map(|item| self.eval(item)).collect()
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value> {
        let def = match self.functions.get(name) {
            Some(def) => def.clone(),
            None => return runtime(format!("undefined function `{}`", name)),
        };
        if def.params.len() != args.len() {
            return runtime(format!(
                "`{}` expects {} arguments, got {}",
                name,
                def.params.len(),
                args.len()
            ));
        }
        let args = self.eval_all(args)?;
        self.frames
            .push(def.params.iter().cloned().zip(args).collect());
        let flow = self.exec_block(&def.body);
        self.frames.pop();
        match flow? {
            Flow::Return(value) => Ok(value),
            // Falling off the end returns 0
            Flow::Next => Ok(Value::Int(0)),
        }
    }
}

/// Run `program` and capture what it prints
pub fn interpret(program: &Program) -> Result<String> {
    let mut interpreter = Interpreter::new(Vec::new());
    interpreter.run(program)?;
    Ok(String::from_utf8_lossy(&interpreter.into_output()).into_owned())
}

fn unescape(text: &str) -> String {
    String::from_utf8_lossy(&expand_escapes(text)).into_owned()
}

/// Numeric view of a value; booleans count as 0/1
enum Num {
    Int(i64),
    Float(f64),
}

fn num(value: &Value) -> Option<Num> {
    match value {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    if op.is_logical() {
        let result = match op {
            BinaryOp::And => lhs.truthy() && rhs.truthy(),
            _ => lhs.truthy() || rhs.truthy(),
        };
        return Ok(Value::Bool(result));
    }

    if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
        return match op {
            BinaryOp::Eq => Ok(Value::Bool(a == b)),
            BinaryOp::Ne => Ok(Value::Bool(a != b)),
            BinaryOp::Add => Ok(Value::Str(format!("{}{}", a, b))),
            _ => runtime(format!("`{}` is not defined for strings", op)),
        };
    }

    let (a, b) = match (num(&lhs), num(&rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return runtime(format!(
                "`{}` between {} and {}",
                op,
                lhs.type_name(),
                rhs.type_name()
            ))
        }
    };
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => int_op(op, a, b),
        (a, b) => float_op(op, as_f64(a), as_f64(b)),
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    Ok(match op {
        BinaryOp::Add => Value::Int(a.wrapping_add(b)),
        BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
        // SDIV yields 0 for a zero divisor, so the remainder is the dividend
        BinaryOp::Div => Value::Int(if b == 0 { 0 } else { a.wrapping_div(b) }),
        BinaryOp::Mod => Value::Int(if b == 0 { a } else { a.wrapping_rem(b) }),
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::Ne => Value::Bool(a != b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::And | BinaryOp::Or => return runtime(format!("`{}` is not arithmetic", op)),
    })
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value> {
    Ok(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Mod => {
            let t = (a / b).trunc();
            Value::Float((-t).mul_add(b, a))
        }
        BinaryOp::Eq => Value::Bool(a == b),
        BinaryOp::Ne => Value::Bool(a != b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::And | BinaryOp::Or => return runtime(format!("`{}` is not arithmetic", op)),
    })
}

fn unary(op: UnaryOp, value: Value) -> Result<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::Neg => match num(&value) {
            Some(Num::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => runtime(format!("cannot negate {}", value.type_name())),
        },
    }
}

fn index_value(target: Value, index: Value) -> Result<Value> {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) | (Value::Tuple(items), Value::Int(i)) => {
            let len = items.len();
            usize::try_from(i)
                .ok()
                .and_then(|i| items.into_iter().nth(i))
                .map_or_else(
                    || runtime(format!("index {} out of range for length {}", i, len)),
                    Ok,
                )
        }
        (Value::Dict(fields), Value::Str(key)) => fields
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .map_or_else(|| runtime(format!("key `{}` not found", key)), Ok),
        (Value::Enum { name, cases }, Value::Str(case)) => {
            if cases.contains(&case) {
                Ok(Value::Str(case))
            } else {
                runtime(format!("`{}` has no case `{}`", name, case))
            }
        }
        (target, index) => runtime(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        )),
    }
}
