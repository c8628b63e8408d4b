//! Statement and control-flow lowering

use std::collections::HashSet;

use super::{unsupported, CodegenSession};
use crate::arm64::encoding::{self, Condition};
use crate::arm64::labels::{Label, LabelPurpose};
use crate::arm64::layout::{
    ArrayLayout, DictField, DictLayout, FieldShape, FrameKind, Scalar, Shape, Slot, Symbol,
    TupleLayout,
};
use crate::arm64::registers::{DReg, Reg64};
use crate::ast::{DictEntry, Expr, LoopRange, LoopStmt, Stmt};
use crate::Result;

impl CodegenSession {
    pub(super) fn lower_block(&mut self, statements: &[Stmt]) -> Result<()> {
        for stmt in statements {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    pub(super) fn lower_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Print(expr) => self.lower_print(expr),
            Stmt::VarDecl { name, value } => self.lower_decl(name, value),
            Stmt::Loop(stmt) => self.lower_loop(stmt),
            Stmt::If {
                condition,
                then_body,
                else_body,
            } => self.lower_if(condition, then_body, else_body.as_deref()),
            Stmt::Return(value) => self.lower_return(value),
            Stmt::EnumDef { name, cases } => {
                self.define_enum(name, cases);
                Ok(())
            }
            Stmt::Expr(expr) => self.lower_expr(expr).map(|_| ()),
            Stmt::FuncDef(def) => unsupported(format!("nested function definition `{}`", def.name)),
            Stmt::Try { .. } => unsupported("try/catch"),
            Stmt::Throw(_) => unsupported("throw"),
        }
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn lower_decl(&mut self, name: &str, value: &Expr) -> Result<()> {
        match value {
            Expr::Array(items) => self.declare_array(name, items),
            Expr::Tuple(items) => self.declare_tuple(name, items),
            Expr::Dict(entries) => self.declare_dict(name, entries),
            _ => {
                let origin = self.enum_origin(value)?;
                let kind = self.lower_expr(value)?;
                let shape = match origin {
                    Some(enum_name) => Shape::EnumCase(enum_name),
                    None => Shape::from_scalar(kind),
                };
                let slot = self.frame_mut()?.layout.assign(name, shape)?;
                self.store_slot(slot, kind);
                Ok(())
            }
        }
    }

    /// Evaluate `values` left to right onto the operand stack. Nothing is
    /// written to the frame until every value exists, so a composite may be
    /// rebuilt from its own elements.
    fn stage_values(&mut self, values: &[&Expr]) -> Result<Vec<Scalar>> {
        let mut kinds = Vec::with_capacity(values.len());
        for value in values {
            let kind = self.lower_expr(value)?;
            self.push_result(kind);
            kinds.push(kind);
        }
        Ok(kinds)
    }

    /// Pop staged values into consecutive slots starting at `base`
    fn unstage_into(&mut self, base: Slot, kinds: &[Scalar]) {
        for (i, kind) in kinds.iter().enumerate().rev() {
            if kind.is_float() {
                self.pop_d(DReg::D0);
            } else {
                self.pop_x(Reg64::X0);
            }
            self.store_slot(base.nth(i), *kind);
        }
    }

    /// Bind `name` to a composite of `slots` slots whose values are staged
    fn bind_composite(
        &mut self,
        name: &str,
        kinds: &[Scalar],
        shape: impl FnOnce(Slot) -> Shape,
    ) -> Result<()> {
        let layout = &mut self.frame_mut()?.layout;
        let (base, span) = layout.span_for(name, kinds.len())?;
        layout.bind(Symbol {
            name: name.to_string(),
            slot: base,
            span,
            shape: shape(base),
        });
        self.unstage_into(base, kinds);
        Ok(())
    }

    fn declare_array(&mut self, name: &str, items: &[Expr]) -> Result<()> {
        let rows = items.iter().filter(|e| matches!(e, Expr::Array(_))).count();
        if rows > 0 && rows < items.len() {
            return unsupported(format!("array `{}` mixing arrays and scalars", name));
        }

        let (values, count, inner): (Vec<&Expr>, usize, Option<usize>) = if rows == 0 {
            (items.iter().collect(), items.len(), None)
        } else {
            let mut values = Vec::new();
            let mut cols = None;
            for row in items {
                let Expr::Array(row) = row else { continue };
                if *cols.get_or_insert(row.len()) != row.len() {
                    return unsupported(format!("ragged nested array `{}`", name));
                }
                if row.iter().any(|e| matches!(e, Expr::Array(_))) {
                    return unsupported(format!("array `{}` nested more than two levels", name));
                }
                values.extend(row.iter());
            }
            (values, items.len(), cols)
        };
        if values
            .iter()
            .any(|e| matches!(e, Expr::Tuple(_) | Expr::Dict(_)))
        {
            return unsupported(format!("composite element in array `{}`", name));
        }

        let kinds = self.stage_values(&values)?;
        let element = match kinds.first() {
            Some(first) if kinds.iter().any(|k| k != first) => {
                return unsupported(format!("heterogeneous array `{}`", name));
            }
            Some(first) => *first,
            None => Scalar::Int,
        };
        self.bind_composite(name, &kinds, |base| {
            Shape::Array(ArrayLayout {
                base,
                count,
                element,
                inner,
            })
        })
    }

    fn declare_tuple(&mut self, name: &str, items: &[Expr]) -> Result<()> {
        if items
            .iter()
            .any(|e| matches!(e, Expr::Array(_) | Expr::Tuple(_) | Expr::Dict(_)))
        {
            return unsupported(format!("composite inside tuple `{}`", name));
        }
        let values: Vec<&Expr> = items.iter().collect();
        let kinds = self.stage_values(&values)?;
        let elements = kinds.clone();
        self.bind_composite(name, &kinds, move |base| {
            Shape::Tuple(TupleLayout {
                elements: elements
                    .into_iter()
                    .enumerate()
                    .map(|(i, kind)| (base.nth(i), kind))
                    .collect(),
            })
        })
    }

    fn declare_dict(&mut self, name: &str, entries: &[DictEntry]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut values: Vec<&Expr> = Vec::new();
        // (key, index of first value, field arity or None for scalars)
        let mut fields: Vec<(String, usize, Option<usize>)> = Vec::new();
        for entry in entries {
            let Expr::Str(key) = &entry.key else {
                return unsupported(format!("non-literal key in dict `{}`", name));
            };
            if !seen.insert(key.as_str()) {
                return unsupported(format!("duplicate key `{}` in dict `{}`", key, name));
            }
            let first = values.len();
            match &entry.value {
                Expr::Array(items) => {
                    if items
                        .iter()
                        .any(|e| matches!(e, Expr::Array(_) | Expr::Tuple(_) | Expr::Dict(_)))
                    {
                        return unsupported(format!("nested array in dict `{}`", name));
                    }
                    values.extend(items.iter());
                    fields.push((key.clone(), first, Some(items.len())));
                }
                Expr::Tuple(_) | Expr::Dict(_) => {
                    return unsupported(format!("{} inside dict `{}`", entry.value.kind(), name));
                }
                value => {
                    values.push(value);
                    fields.push((key.clone(), first, None));
                }
            }
        }

        let kinds = self.stage_values(&values)?;
        let mut shapes = Vec::with_capacity(fields.len());
        for (key, first, arity) in &fields {
            let shape = match arity {
                None => FieldShape::Scalar(kinds[*first]),
                Some(count) => {
                    let slice = &kinds[*first..*first + count];
                    let element = slice.first().copied().unwrap_or(Scalar::Int);
                    if slice.iter().any(|k| *k != element) {
                        return unsupported(format!(
                            "heterogeneous array `{}` in dict `{}`",
                            key, name
                        ));
                    }
                    FieldShape::Array {
                        count: *count,
                        element,
                    }
                }
            };
            shapes.push(shape);
        }

        self.bind_composite(name, &kinds, move |base| {
            Shape::Dict(DictLayout {
                fields: fields
                    .into_iter()
                    .zip(shapes)
                    .map(|((key, first, _), value)| DictField {
                        key,
                        slot: base.nth(first),
                        value,
                    })
                    .collect(),
            })
        })
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn lower_loop(&mut self, stmt: &LoopStmt) -> Result<()> {
        match &stmt.range {
            LoopRange::Counted { start, end } => {
                self.lower_loop_bound(start, "start")?;
                let counter = self.frame_mut()?.layout.assign(&stmt.var, Shape::Int)?;
                self.store_slot(counter, Scalar::Int);
                // The end bound is evaluated once, before the first iteration
                self.lower_loop_bound(end, "end")?;
                let end_slot = self.frame_mut()?.layout.hidden()?;
                self.store_slot(end_slot, Scalar::Int);
                self.counted_loop(counter, end_slot, |s| s.lower_block(&stmt.body))
            }
            LoopRange::Collection(_) => unsupported("collection loop"),
            LoopRange::Condition(_) => unsupported("condition loop"),
        }
    }

    fn lower_loop_bound(&mut self, bound: &Expr, which: &str) -> Result<()> {
        match self.lower_expr(bound)? {
            Scalar::Int => Ok(()),
            other => unsupported(format!("{} loop {} bound", other.name(), which)),
        }
    }

    /// `while counter < end { body; counter += 1 }`, both bounds in slots
    pub(super) fn counted_loop<F>(&mut self, counter: Slot, end: Slot, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let top = self.new_label(LabelPurpose::LoopTop);
        let done = self.new_label(LabelPurpose::LoopEnd);

        self.bind(top)?;
        self.load_slot_x(Reg64::X0, counter);
        self.load_slot_x(Reg64::X1, end);
        encoding::cmp_x(&mut self.code, Reg64::X0, Reg64::X1);
        self.jump_if(Condition::GE, done);

        body(self)?;

        self.load_slot_x(Reg64::X0, counter);
        encoding::add_imm_x(&mut self.code, Reg64::X0, Reg64::X0, 1);
        self.store_slot_x(Reg64::X0, counter);
        self.jump(top);
        self.bind(done)
    }

    fn lower_if(
        &mut self,
        condition: &Expr,
        then_body: &[Stmt],
        else_body: Option<&[Stmt]>,
    ) -> Result<()> {
        let else_label = self.new_label(LabelPurpose::Else);
        self.branch_unless(condition, else_label)?;
        self.lower_block(then_body)?;
        match else_body {
            Some(body) => {
                let end = self.new_label(LabelPurpose::EndIf);
                self.jump(end);
                self.bind(else_label)?;
                self.lower_block(body)?;
                self.bind(end)
            }
            None => self.bind(else_label),
        }
    }

    /// Branch to `target` when `condition` is false
    fn branch_unless(&mut self, condition: &Expr, target: Label) -> Result<()> {
        if let Expr::Binary { op, lhs, rhs } = condition {
            if op.is_comparison() {
                let cond = self.lower_comparison(*op, lhs, rhs)?;
                self.jump_if(cond.invert(), target);
                return Ok(());
            }
        }
        let kind = self.lower_expr(condition)?;
        self.normalize_truth(kind);
        self.jump_if_zero(Reg64::X0, target);
        Ok(())
    }

    fn lower_return(&mut self, value: &Expr) -> Result<()> {
        let frame = self.frame()?;
        if frame.kind == FrameKind::Entry {
            return unsupported("return outside a function");
        }
        let return_label = frame.return_label;
        match self.lower_expr(value)? {
            Scalar::Int => {}
            other => return unsupported(format!("{} return value", other.name())),
        }
        self.jump(return_label);
        Ok(())
    }
}
