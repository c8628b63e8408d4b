//! Abstract Syntax Tree definitions for JibJab
//!
//! The AST is produced by the JibJab front end and handed to this crate as
//! JSON. Every node derives `Serialize`/`Deserialize` with the default
//! externally tagged representation, e.g. `{"print": {"int": 5}}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

/// A complete JibJab program: top-level statements in source order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }

    /// Parse a program from its JSON form
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    /// `print(expr)`
    Print(Expr),
    /// `name = value`; declares or rebinds
    VarDecl { name: String, value: Expr },
    Loop(LoopStmt),
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_body: Option<Vec<Stmt>>,
    },
    FuncDef(FuncDef),
    Return(Expr),
    EnumDef { name: String, cases: Vec<String> },
    Try { body: Vec<Stmt>, handler: Vec<Stmt> },
    Throw(Expr),
    /// Expression evaluated for its side effects
    Expr(Expr),
}

/// `loop var in <range> { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStmt {
    pub var: String,
    pub range: LoopRange,
    pub body: Vec<Stmt>,
}

/// The three loop forms the front end accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopRange {
    /// `start..end`, end exclusive
    Counted { start: Expr, end: Expr },
    /// Iterate the elements of a collection
    Collection(Expr),
    /// Repeat while the condition holds
    Condition(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
    Var(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<DictEntry>),
    /// `target[index]`; also enum case access `Color["Red"]`
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    /// A string literal with embedded `{var}` references
    Interpolation(Vec<InterpolationPart>),
    /// Read a line from stdin after printing the prompt
    Input(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictEntry {
    pub key: Expr,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationPart {
    Text(String),
    Var(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

// Builders, mostly for tests and embedding front ends.

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    pub fn float(value: f64) -> Self {
        Expr::Float(value)
    }

    pub fn str(value: impl Into<String>) -> Self {
        Expr::Str(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn index(target: Expr, index: Expr) -> Self {
        Expr::Index {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    pub fn dict(entries: Vec<(Expr, Expr)>) -> Self {
        Expr::Dict(
            entries
                .into_iter()
                .map(|(key, value)| DictEntry { key, value })
                .collect(),
        )
    }

    /// Short name of the node kind for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Int(_) => "integer literal",
            Expr::Float(_) => "float literal",
            Expr::Str(_) => "string literal",
            Expr::Bool(_) => "boolean literal",
            Expr::Nil => "nil",
            Expr::Var(_) => "variable",
            Expr::Binary { .. } => "binary expression",
            Expr::Unary { .. } => "unary expression",
            Expr::Call { .. } => "call",
            Expr::Array(_) => "array literal",
            Expr::Tuple(_) => "tuple literal",
            Expr::Dict(_) => "dict literal",
            Expr::Index { .. } => "index expression",
            Expr::Interpolation(_) => "string interpolation",
            Expr::Input(_) => "input",
        }
    }
}

impl Stmt {
    pub fn print(expr: Expr) -> Self {
        Stmt::Print(expr)
    }

    pub fn decl(name: impl Into<String>, value: Expr) -> Self {
        Stmt::VarDecl {
            name: name.into(),
            value,
        }
    }

    pub fn counted_loop(var: impl Into<String>, start: Expr, end: Expr, body: Vec<Stmt>) -> Self {
        Stmt::Loop(LoopStmt {
            var: var.into(),
            range: LoopRange::Counted { start, end },
            body,
        })
    }

    pub fn if_else(condition: Expr, then_body: Vec<Stmt>, else_body: Option<Vec<Stmt>>) -> Self {
        Stmt::If {
            condition,
            then_body,
            else_body,
        }
    }

    pub fn func(name: impl Into<String>, params: &[&str], body: Vec<Stmt>) -> Self {
        Stmt::FuncDef(FuncDef {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        })
    }

    pub fn enum_def(name: impl Into<String>, cases: &[&str]) -> Self {
        Stmt::EnumDef {
            name: name.into(),
            cases: cases.iter().map(|c| c.to_string()).collect(),
        }
    }
}
