//! Expression lowering
//!
//! Every expression leaves its value in X0 (int, bool, string pointer) or D0
//! (float). Binary operators push the left value, lower the right one, move it
//! to X1/D1 and pop the left value back.

use super::{unsupported, CodegenSession, MAX_ARGS};
use crate::arm64::encoding::{self, Condition};
use crate::arm64::layout::{ArrayLayout, FieldShape, Scalar, Shape, Slot};
use crate::arm64::registers::calling_convention::{ARGUMENT_REGS, FRAME_BASE, IP0, STAGING_REGS};
use crate::arm64::registers::{DReg, Reg64};
use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::{JibJabError, Result};

/// Both operands of a binary operator, in X0/X1 or D0/D1
#[derive(Debug, Clone, Copy)]
struct Operands {
    float: bool,
}

/// Where an indexed element lives
#[derive(Debug, Clone, Copy)]
pub(super) enum Element {
    /// Compile-time-known slot
    Fixed(Slot, Scalar),
    /// `base + X0 * 8`, X0 holding the flat element index
    Dynamic { base: Slot, element: Scalar },
}

/// A flat run of same-shaped slots
#[derive(Debug, Clone, Copy)]
pub(super) struct ArrayView {
    pub base: Slot,
    pub count: usize,
    pub element: Scalar,
}

impl CodegenSession {
    /// Evaluate `expr` into X0 or D0
    pub(super) fn lower_expr(&mut self, expr: &Expr) -> Result<Scalar> {
        match expr {
            Expr::Int(value) => {
                encoding::load_imm64(&mut self.code, Reg64::X0, *value as u64);
                Ok(Scalar::Int)
            }
            Expr::Float(value) => {
                self.load_double(DReg::D0, *value);
                Ok(Scalar::Float)
            }
            Expr::Bool(value) => {
                encoding::load_imm64(&mut self.code, Reg64::X0, *value as u64);
                Ok(Scalar::Bool)
            }
            Expr::Str(text) => {
                self.load_string(Reg64::X0, text);
                Ok(Scalar::Str)
            }
            Expr::Var(name) => self.lower_var(name),
            Expr::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            Expr::Unary { op, operand } => self.lower_unary(*op, operand),
            Expr::Call { name, args } => self.lower_call(name, args),
            Expr::Index { target, index } => self.lower_index(target, index),
            Expr::Nil => unsupported("nil"),
            Expr::Input(_) => unsupported("input"),
            Expr::Interpolation(_) => unsupported("string interpolation outside print"),
            Expr::Array(_) | Expr::Tuple(_) | Expr::Dict(_) => {
                unsupported(format!("{} used as a value", expr.kind()))
            }
        }
    }

    fn lower_var(&mut self, name: &str) -> Result<Scalar> {
        match self.symbol_shape(name)? {
            Some((slot, shape)) => match shape.scalar() {
                Some(kind) => {
                    self.load_slot(slot, kind);
                    Ok(kind)
                }
                None => unsupported(format!("{} `{}` used as a value", shape.describe(), name)),
            },
            None if self.enums.contains(name) => {
                unsupported(format!("enum `{}` used as a value", name))
            }
            None => unsupported(format!("unknown variable `{}`", name)),
        }
    }

    /// The enum a value belongs to, for expressions that yield an enum case
    pub(super) fn enum_origin(&self, expr: &Expr) -> Result<Option<String>> {
        match expr {
            Expr::Index { target, index } => match (target.as_ref(), index.as_ref()) {
                (Expr::Var(name), Expr::Str(_))
                    if self.enums.contains(name) && self.symbol_shape(name)?.is_none() =>
                {
                    Ok(Some(name.clone()))
                }
                _ => Ok(None),
            },
            Expr::Var(name) => match self.symbol_shape(name)? {
                Some((_, Shape::EnumCase(enum_name))) => Ok(Some(enum_name)),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Scalar> {
        if op.is_logical() {
            return self.lower_logical(op, lhs, rhs);
        }
        if op.is_comparison() {
            let cond = self.lower_comparison(op, lhs, rhs)?;
            encoding::cset_x(&mut self.code, Reg64::X0, cond);
            return Ok(Scalar::Bool);
        }

        let operands = self.lower_operands(op, lhs, rhs)?;
        if operands.float {
            let (d0, d1, d2) = (DReg::D0, DReg::D1, DReg::D2);
            match op {
                BinaryOp::Add => encoding::fadd_d(&mut self.code, d0, d0, d1),
                BinaryOp::Sub => encoding::fsub_d(&mut self.code, d0, d0, d1),
                BinaryOp::Mul => encoding::fmul_d(&mut self.code, d0, d0, d1),
                BinaryOp::Div => encoding::fdiv_d(&mut self.code, d0, d0, d1),
                BinaryOp::Mod => {
                    // a - trunc(a / b) * b
                    encoding::fdiv_d(&mut self.code, d2, d0, d1);
                    encoding::frintz_d(&mut self.code, d2, d2);
                    encoding::fmsub_d(&mut self.code, d0, d2, d1, d0);
                }
                _ => return Err(not_arithmetic(op)),
            }
            Ok(Scalar::Float)
        } else {
            let (x0, x1, x2) = (Reg64::X0, Reg64::X1, Reg64::X2);
            match op {
                BinaryOp::Add => encoding::add_x(&mut self.code, x0, x0, x1),
                BinaryOp::Sub => encoding::sub_x(&mut self.code, x0, x0, x1),
                BinaryOp::Mul => encoding::mul_x(&mut self.code, x0, x0, x1),
                BinaryOp::Div => encoding::sdiv_x(&mut self.code, x0, x0, x1),
                BinaryOp::Mod => {
                    encoding::sdiv_x(&mut self.code, x2, x0, x1);
                    encoding::msub_x(&mut self.code, x0, x2, x1, x0);
                }
                _ => return Err(not_arithmetic(op)),
            }
            Ok(Scalar::Int)
        }
    }

    /// Lower both operands. Mixed int/float pairs convert the int side.
    fn lower_operands(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Operands> {
        let allow_strings = matches!(op, BinaryOp::Eq | BinaryOp::Ne);

        let left = self.lower_expr(lhs)?;
        self.push_result(left);
        let right = self.lower_expr(rhs)?;

        let strings = (left == Scalar::Str) as u8 + (right == Scalar::Str) as u8;
        if strings == 1 {
            return unsupported(format!("`{}` between a string and a number", op));
        }
        if strings == 2 && !allow_strings {
            return unsupported(format!("string operands to `{}`", op));
        }

        if left.is_float() || right.is_float() {
            if right.is_float() {
                encoding::fmov_d(&mut self.code, DReg::D1, DReg::D0);
            } else {
                encoding::scvtf_d_x(&mut self.code, DReg::D1, Reg64::X0);
            }
            if left.is_float() {
                self.pop_d(DReg::D0);
            } else {
                self.pop_x(Reg64::X0);
                encoding::scvtf_d_x(&mut self.code, DReg::D0, Reg64::X0);
            }
            Ok(Operands { float: true })
        } else {
            encoding::mov_x(&mut self.code, Reg64::X1, Reg64::X0);
            self.pop_x(Reg64::X0);
            Ok(Operands { float: false })
        }
    }

    /// Compare two operands and return the condition under which the
    /// comparison holds. Callers either CSET it or branch on its inverse.
    pub(super) fn lower_comparison(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Condition> {
        let operands = self.lower_operands(op, lhs, rhs)?;
        if operands.float {
            encoding::fcmp_d(&mut self.code, DReg::D0, DReg::D1);
            // Unordered results must compare false for < <= > >=
            Ok(match op {
                BinaryOp::Eq => Condition::EQ,
                BinaryOp::Ne => Condition::NE,
                BinaryOp::Lt => Condition::MI,
                BinaryOp::Gt => Condition::GT,
                BinaryOp::Le => Condition::LS,
                BinaryOp::Ge => Condition::GE,
                _ => return Err(not_comparison(op)),
            })
        } else {
            encoding::cmp_x(&mut self.code, Reg64::X0, Reg64::X1);
            Ok(match op {
                BinaryOp::Eq => Condition::EQ,
                BinaryOp::Ne => Condition::NE,
                BinaryOp::Lt => Condition::LT,
                BinaryOp::Gt => Condition::GT,
                BinaryOp::Le => Condition::LE,
                BinaryOp::Ge => Condition::GE,
                _ => return Err(not_comparison(op)),
            })
        }
    }

    /// `&&` and `||` evaluate both sides; no short-circuit
    fn lower_logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Scalar> {
        let left = self.lower_expr(lhs)?;
        self.normalize_truth(left);
        self.push_result(Scalar::Bool);
        let right = self.lower_expr(rhs)?;
        self.normalize_truth(right);
        encoding::mov_x(&mut self.code, Reg64::X1, Reg64::X0);
        self.pop_x(Reg64::X0);
        if op == BinaryOp::And {
            encoding::and_x(&mut self.code, Reg64::X0, Reg64::X0, Reg64::X1);
        } else {
            encoding::orr_x(&mut self.code, Reg64::X0, Reg64::X0, Reg64::X1);
        }
        Ok(Scalar::Bool)
    }

    /// Turn the current result into 0/1 in X0
    pub(super) fn normalize_truth(&mut self, kind: Scalar) {
        match kind {
            Scalar::Bool => {}
            Scalar::Int => {
                encoding::cmp_imm_x(&mut self.code, Reg64::X0, 0);
                encoding::cset_x(&mut self.code, Reg64::X0, Condition::NE);
            }
            Scalar::Float => {
                encoding::fcmp_zero_d(&mut self.code, DReg::D0);
                encoding::cset_x(&mut self.code, Reg64::X0, Condition::NE);
            }
            // String pointers are never null
            Scalar::Str => encoding::load_imm64(&mut self.code, Reg64::X0, 1),
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<Scalar> {
        let kind = self.lower_expr(operand)?;
        match op {
            UnaryOp::Neg => match kind {
                Scalar::Int | Scalar::Bool => {
                    encoding::neg_x(&mut self.code, Reg64::X0, Reg64::X0);
                    Ok(Scalar::Int)
                }
                Scalar::Float => {
                    encoding::fneg_d(&mut self.code, DReg::D0, DReg::D0);
                    Ok(Scalar::Float)
                }
                Scalar::Str => unsupported("negating a string"),
            },
            UnaryOp::Not => {
                self.normalize_truth(kind);
                encoding::cmp_imm_x(&mut self.code, Reg64::X0, 0);
                encoding::cset_x(&mut self.code, Reg64::X0, Condition::EQ);
                Ok(Scalar::Bool)
            }
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Arguments are evaluated left to right into X19.. and moved into X0..
    /// right before the BL. A nested call stages above its enclosing call.
    fn lower_call(&mut self, name: &str, args: &[Expr]) -> Result<Scalar> {
        let info = match self.functions.get(name) {
            Some(info) => *info,
            None => return unsupported(format!("unknown function `{}`", name)),
        };
        if args.len() > MAX_ARGS {
            return Err(JibJabError::ResourceExhausted {
                resource: "call arguments",
                limit: MAX_ARGS,
            });
        }
        if args.len() != info.arity {
            return unsupported(format!(
                "call to `{}` with {} arguments (expects {})",
                name,
                args.len(),
                info.arity
            ));
        }

        let base = self.staging_depth;
        if base + args.len() > STAGING_REGS.len() {
            return Err(JibJabError::ResourceExhausted {
                resource: "call-argument staging registers",
                limit: STAGING_REGS.len(),
            });
        }
        for (i, arg) in args.iter().enumerate() {
            let kind = self.lower_expr(arg)?;
            if kind != Scalar::Int {
                return unsupported(format!("{} argument to `{}`", kind.name(), name));
            }
            encoding::mov_x(&mut self.code, STAGING_REGS[base + i], Reg64::X0);
            self.staging_depth += 1;
        }
        for i in 0..args.len() {
            encoding::mov_x(&mut self.code, ARGUMENT_REGS[i], STAGING_REGS[base + i]);
        }
        self.staging_depth = base;

        self.call_label(info.entry);
        Ok(Scalar::Int)
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    fn lower_index(&mut self, target: &Expr, index: &Expr) -> Result<Scalar> {
        if let Expr::Var(name) = target {
            if self.enums.contains(name) && self.symbol_shape(name)?.is_none() {
                return self.lower_enum_case(name, index);
            }
        }
        match self.resolve_element(target, index)? {
            Element::Fixed(slot, kind) => {
                self.load_slot(slot, kind);
                Ok(kind)
            }
            Element::Dynamic { base, element } => {
                self.load_dynamic(base, element);
                Ok(element)
            }
        }
    }

    /// Load `[x28 + base + X0*8]` into X0 or D0
    pub(super) fn load_dynamic(&mut self, base: Slot, element: Scalar) {
        encoding::add_imm_x(&mut self.code, IP0, FRAME_BASE, base.offset());
        if element.is_float() {
            encoding::ldr_d_reg_lsl3(&mut self.code, DReg::D0, IP0, Reg64::X0);
        } else {
            encoding::ldr_x_reg_lsl3(&mut self.code, Reg64::X0, IP0, Reg64::X0);
        }
    }

    fn lower_enum_case(&mut self, enum_name: &str, index: &Expr) -> Result<Scalar> {
        let Expr::Str(case) = index else {
            return unsupported(format!("non-literal case of enum `{}`", enum_name));
        };
        let label = self.enums.get(enum_name).and_then(|layout| layout.case(case));
        match label {
            Some(label) => {
                self.load_address(Reg64::X0, label);
                Ok(Scalar::Str)
            }
            None => unsupported(format!("unknown case `{}` of enum `{}`", case, enum_name)),
        }
    }

    /// Find the element `target[index]` refers to. Dynamic indices leave the
    /// flat element index in X0.
    pub(super) fn resolve_element(&mut self, target: &Expr, index: &Expr) -> Result<Element> {
        // m[i][j] on a 2-level array, d["key"][i] on an array-valued field
        if let Expr::Index {
            target: outer,
            index: row,
        } = target
        {
            if let Expr::Var(name) = outer.as_ref() {
                match self.symbol_shape(name)? {
                    Some((_, Shape::Array(layout))) if layout.inner.is_some() => {
                        return self.nested_element(&layout, row, index);
                    }
                    Some((_, Shape::Dict(_))) => {
                        if let Some(view) = self.array_view(target)? {
                            return self.flat_element(view, index);
                        }
                    }
                    _ => {}
                }
            }
            return unsupported("indexing into an element that is not an array");
        }

        let Expr::Var(name) = target else {
            return unsupported(format!("indexing a {}", target.kind()));
        };
        let Some((_, shape)) = self.symbol_shape(name)? else {
            return unsupported(format!("unknown variable `{}`", name));
        };
        match shape {
            Shape::Array(layout) if layout.inner.is_none() => self.flat_element(
                ArrayView {
                    base: layout.base,
                    count: layout.count,
                    element: layout.element,
                },
                index,
            ),
            Shape::Array(_) => unsupported(format!("row of nested array `{}` used as a value", name)),
            Shape::Tuple(tuple) => {
                let Expr::Int(i) = index else {
                    return unsupported(format!("non-literal index into tuple `{}`", name));
                };
                match usize::try_from(*i).ok().and_then(|i| tuple.elements.get(i)) {
                    Some(&(slot, kind)) => Ok(Element::Fixed(slot, kind)),
                    None => unsupported(format!("tuple index {} out of range for `{}`", i, name)),
                }
            }
            Shape::Dict(dict) => {
                let Expr::Str(key) = index else {
                    return unsupported(format!("non-literal key into dict `{}`", name));
                };
                match dict.field(key) {
                    Some(field) => match field.value {
                        FieldShape::Scalar(kind) => Ok(Element::Fixed(field.slot, kind)),
                        FieldShape::Array { .. } => unsupported(format!(
                            "array field `{}` of `{}` used as a value",
                            key, name
                        )),
                    },
                    None => unsupported(format!("unknown key `{}` of dict `{}`", key, name)),
                }
            }
            other => unsupported(format!("indexing a {} `{}`", other.describe(), name)),
        }
    }

    /// A flat array reachable from `expr` without computing anything:
    /// an array-valued dict field `d["k"]` or a literal row `m[1]` of a
    /// 2-level array
    pub(super) fn array_view(&self, expr: &Expr) -> Result<Option<ArrayView>> {
        let Expr::Index { target, index } = expr else {
            return Ok(None);
        };
        let Expr::Var(name) = target.as_ref() else {
            return Ok(None);
        };
        let view = match (self.symbol_shape(name)?, index.as_ref()) {
            (Some((_, Shape::Dict(dict))), Expr::Str(key)) => {
                dict.field(key).and_then(|field| match field.value {
                    FieldShape::Array { count, element } => Some(ArrayView {
                        base: field.slot,
                        count,
                        element,
                    }),
                    FieldShape::Scalar(_) => None,
                })
            }
            (
                Some((
                    _,
                    Shape::Array(ArrayLayout {
                        base,
                        count,
                        element,
                        inner: Some(cols),
                    }),
                )),
                Expr::Int(row),
            ) => {
                if *row < 0 || *row as usize >= count {
                    return unsupported(format!("row {} out of range for `{}`", row, name));
                }
                Some(ArrayView {
                    base: base.nth(*row as usize * cols),
                    count: cols,
                    element,
                })
            }
            _ => None,
        };
        Ok(view)
    }

    fn flat_element(&mut self, view: ArrayView, index: &Expr) -> Result<Element> {
        if let Expr::Int(i) = index {
            if *i < 0 || *i as usize >= view.count {
                return unsupported(format!(
                    "index {} out of range for array of {}",
                    i, view.count
                ));
            }
            return Ok(Element::Fixed(view.base.nth(*i as usize), view.element));
        }
        self.lower_index_value(index)?;
        Ok(Element::Dynamic {
            base: view.base,
            element: view.element,
        })
    }

    /// `m[row][col]` → element `row * cols + col`
    fn nested_element(&mut self, layout: &ArrayLayout, row: &Expr, col: &Expr) -> Result<Element> {
        let cols = layout.inner.unwrap_or(1);
        if let (Expr::Int(r), Expr::Int(c)) = (row, col) {
            if *r < 0 || *r as usize >= layout.count || *c < 0 || *c as usize >= cols {
                return unsupported(format!(
                    "index [{}][{}] out of range for {}x{} array",
                    r, c, layout.count, cols
                ));
            }
            let flat = *r as usize * cols + *c as usize;
            return Ok(Element::Fixed(layout.base.nth(flat), layout.element));
        }

        self.lower_index_value(row)?;
        self.push_result(Scalar::Int);
        self.lower_index_value(col)?;
        encoding::mov_x(&mut self.code, Reg64::X1, Reg64::X0);
        self.pop_x(Reg64::X0);
        encoding::load_imm64(&mut self.code, Reg64::X2, cols as u64);
        encoding::mul_x(&mut self.code, Reg64::X0, Reg64::X0, Reg64::X2);
        encoding::add_x(&mut self.code, Reg64::X0, Reg64::X0, Reg64::X1);
        Ok(Element::Dynamic {
            base: layout.base,
            element: layout.element,
        })
    }

    pub(super) fn lower_index_value(&mut self, index: &Expr) -> Result<()> {
        match self.lower_expr(index)? {
            Scalar::Int => Ok(()),
            other => unsupported(format!("{} used as an index", other.name())),
        }
    }
}

fn not_arithmetic(op: BinaryOp) -> JibJabError {
    JibJabError::Internal {
        message: format!("`{}` lowered as arithmetic", op),
    }
}

fn not_comparison(op: BinaryOp) -> JibJabError {
    JibJabError::Internal {
        message: format!("`{}` lowered as a comparison", op),
    }
}
