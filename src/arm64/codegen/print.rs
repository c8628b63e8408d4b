//! Print lowering
//!
//! Every print is one or more `printf` calls. Variadic arguments are passed
//! on the stack on Darwin, so values are stored to `[sp, #8*k]`, which is the
//! outgoing area at the bottom of the frame while no operands are pushed.
//! Composite values print through unrolled calls (tuples, dicts, enums) or a
//! runtime loop over the element slots (arrays).

use super::{unsupported, CodegenSession, Import};
use crate::arm64::data::{expand_escapes, printf_literal};
use crate::arm64::encoding::{self, Condition};
use crate::arm64::labels::LabelPurpose;
use crate::arm64::layout::{ArrayLayout, FieldShape, Scalar, Shape, Slot, MAX_VARARGS};
use crate::arm64::registers::calling_convention::{IP0, IP1};
use crate::arm64::registers::{DReg, Reg64};
use crate::ast::{Expr, InterpolationPart};
use crate::{JibJabError, Result};

use super::expr::ArrayView;

/// Row-major position of an element inside a 2-level array
#[derive(Debug, Clone, Copy)]
struct RowOf {
    row_counter: Slot,
    cols: usize,
}

impl CodegenSession {
    pub(super) fn lower_print(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Interpolation(parts) => self.print_interpolation(parts),
            Expr::Var(name) => match self.symbol_shape(name)? {
                Some((_, shape)) if shape.scalar().is_none() => self.print_composite(&shape),
                Some((slot, shape)) => {
                    let kind = shape.scalar().unwrap_or(Scalar::Int);
                    self.load_slot(slot, kind);
                    self.print_value(kind, false, "", "\n")
                }
                None if self.enums.contains(name) => self.print_enum(name),
                None => unsupported(format!("unknown variable `{}`", name)),
            },
            Expr::Index { target, index } => match self.array_view(expr)? {
                Some(view) => self.print_row(view, None, "", "\n"),
                None => match self.nested_array(target)? {
                    Some(layout) => self.print_dynamic_row(&layout, index),
                    None => self.print_expr(expr),
                },
            },
            _ => self.print_expr(expr),
        }
    }

    fn print_expr(&mut self, expr: &Expr) -> Result<()> {
        let kind = self.lower_expr(expr)?;
        self.print_value(kind, false, "", "\n")
    }

    /// printf(format); the format is used verbatim
    fn printf(&mut self, format: &str) {
        let label = self.data.intern_raw(format);
        self.load_address(Reg64::X0, label);
        self.call_import(Import::Printf);
    }

    /// Print literal text
    fn print_text(&mut self, text: &str) {
        self.printf(&printf_literal(text));
    }

    /// Print the value in X0/D0 between `prefix` and `suffix`. Strings are
    /// double-quoted when `quoted` is set (elements of composites).
    fn print_value(&mut self, kind: Scalar, quoted: bool, prefix: &str, suffix: &str) -> Result<()> {
        let spec = self.store_vararg(kind, 0)?;
        let spec = if quoted && kind == Scalar::Str {
            "\"%s\""
        } else {
            spec
        };
        let format = format!("{}{}{}", printf_literal(prefix), spec, printf_literal(suffix));
        self.printf(&format);
        Ok(())
    }

    /// Store the current result into vararg position `k` and return its
    /// conversion specifier
    fn store_vararg(&mut self, kind: Scalar, k: usize) -> Result<&'static str> {
        if k >= MAX_VARARGS {
            return Err(JibJabError::ResourceExhausted {
                resource: "printf arguments",
                limit: MAX_VARARGS,
            });
        }
        let offset = (k * 8) as u16;
        let spec = match kind {
            Scalar::Int => {
                encoding::str_x_imm(&mut self.code, Reg64::X0, Reg64::SP, offset);
                "%ld"
            }
            Scalar::Float => {
                encoding::str_d_imm(&mut self.code, DReg::D0, Reg64::SP, offset);
                "%g"
            }
            Scalar::Bool => {
                self.bool_to_text();
                encoding::str_x_imm(&mut self.code, Reg64::X0, Reg64::SP, offset);
                "%s"
            }
            Scalar::Str => {
                encoding::str_x_imm(&mut self.code, Reg64::X0, Reg64::SP, offset);
                "%s"
            }
        };
        Ok(spec)
    }

    /// X0 (0/1) → pointer to "false"/"true"
    fn bool_to_text(&mut self) {
        let yes = self.data.intern_raw("true");
        let no = self.data.intern_raw("false");
        encoding::cmp_imm_x(&mut self.code, Reg64::X0, 0);
        self.load_address(IP0, yes);
        self.load_address(IP1, no);
        encoding::csel_x(&mut self.code, Reg64::X0, IP0, IP1, Condition::NE);
    }

    // =========================================================================
    // Composites
    // =========================================================================

    fn print_composite(&mut self, shape: &Shape) -> Result<()> {
        match shape {
            Shape::Array(layout) => match layout.inner {
                None => self.print_row(
                    ArrayView {
                        base: layout.base,
                        count: layout.count,
                        element: layout.element,
                    },
                    None,
                    "",
                    "\n",
                ),
                Some(_) => self.print_nested_array(layout),
            },
            Shape::Tuple(tuple) => {
                if tuple.elements.is_empty() {
                    self.print_text("()\n");
                    return Ok(());
                }
                let last = tuple.elements.len() - 1;
                for (i, &(slot, kind)) in tuple.elements.iter().enumerate() {
                    self.load_slot(slot, kind);
                    let prefix = if i == 0 { "(" } else { ", " };
                    let suffix = if i == last { ")\n" } else { "" };
                    self.print_value(kind, true, prefix, suffix)?;
                }
                Ok(())
            }
            Shape::Dict(dict) => {
                if dict.fields.is_empty() {
                    self.print_text("{}\n");
                    return Ok(());
                }
                for (i, field) in dict.fields.iter().enumerate() {
                    let key = String::from_utf8_lossy(&expand_escapes(&field.key)).into_owned();
                    let prefix = format!("{}\"{}\": ", if i == 0 { "{" } else { ", " }, key);
                    match field.value {
                        FieldShape::Scalar(kind) => {
                            self.load_slot(field.slot, kind);
                            self.print_value(kind, true, &prefix, "")?;
                        }
                        FieldShape::Array { count, element } => {
                            let view = ArrayView {
                                base: field.slot,
                                count,
                                element,
                            };
                            self.print_row(view, None, &prefix, "")?;
                        }
                    }
                }
                self.print_text("}\n");
                Ok(())
            }
            scalar => Err(JibJabError::Internal {
                message: format!("{} printed as a composite", scalar.describe()),
            }),
        }
    }

    /// `[e0, e1, ...]` through a runtime loop over the element slots. With
    /// `row`, elements are those of the current row of a 2-level array.
    fn print_row(&mut self, view: ArrayView, row: Option<RowOf>, open: &str, close: &str) -> Result<()> {
        if view.count == 0 {
            self.print_text(&format!("{}[]{}", open, close));
            return Ok(());
        }
        // Inner loops of nested arrays take the second pair of scratch slots
        let scratch = self.frame_mut()?.print_scratch(4)?;
        let (counter, end) = match row {
            None => (scratch[0], scratch[1]),
            Some(_) => (scratch[2], scratch[3]),
        };

        self.print_text(&format!("{}[", open));
        self.init_counter(counter, end, view.count);
        self.counted_loop(counter, end, |s| {
            s.print_separator(counter)?;
            s.load_slot_x(Reg64::X0, counter);
            if let Some(RowOf { row_counter, cols }) = row {
                s.load_slot_x(Reg64::X1, row_counter);
                encoding::load_imm64(&mut s.code, Reg64::X2, cols as u64);
                encoding::mul_x(&mut s.code, Reg64::X1, Reg64::X1, Reg64::X2);
                encoding::add_x(&mut s.code, Reg64::X0, Reg64::X0, Reg64::X1);
            }
            s.load_dynamic(view.base, view.element);
            s.print_value(view.element, true, "", "")
        })?;
        self.print_text(&format!("]{}", close));
        Ok(())
    }

    /// `[[1, 2], [3, 4]]`
    fn print_nested_array(&mut self, layout: &ArrayLayout) -> Result<()> {
        let cols = layout.inner.unwrap_or(0);
        if layout.count == 0 {
            self.print_text("[]\n");
            return Ok(());
        }
        let scratch = self.frame_mut()?.print_scratch(4)?;
        let (row_counter, row_end) = (scratch[0], scratch[1]);
        let view = ArrayView {
            base: layout.base,
            count: cols,
            element: layout.element,
        };

        self.print_text("[");
        self.init_counter(row_counter, row_end, layout.count);
        self.counted_loop(row_counter, row_end, |s| {
            s.print_separator(row_counter)?;
            s.print_row(view, Some(RowOf { row_counter, cols }), "", "")
        })?;
        self.print_text("]\n");
        Ok(())
    }

    /// The layout of `expr` when it names a 2-level array
    fn nested_array(&self, expr: &Expr) -> Result<Option<ArrayLayout>> {
        let Expr::Var(name) = expr else {
            return Ok(None);
        };
        Ok(match self.symbol_shape(name)? {
            Some((_, Shape::Array(layout))) if layout.inner.is_some() => Some(layout),
            _ => None,
        })
    }

    /// `m[i]` with the row computed at runtime; not bounds-checked
    fn print_dynamic_row(&mut self, layout: &ArrayLayout, row: &Expr) -> Result<()> {
        let cols = layout.inner.unwrap_or(0);
        self.lower_index_value(row)?;
        let scratch = self.frame_mut()?.print_scratch(5)?;
        let row_slot = scratch[4];
        self.store_slot_x(Reg64::X0, row_slot);
        let view = ArrayView {
            base: layout.base,
            count: cols,
            element: layout.element,
        };
        self.print_row(view, Some(RowOf { row_counter: row_slot, cols }), "", "\n")
    }

    fn init_counter(&mut self, counter: Slot, end: Slot, count: usize) {
        encoding::load_imm64(&mut self.code, Reg64::X0, 0);
        self.store_slot_x(Reg64::X0, counter);
        encoding::load_imm64(&mut self.code, Reg64::X0, count as u64);
        self.store_slot_x(Reg64::X0, end);
    }

    /// ", " before every element but the first
    fn print_separator(&mut self, counter: Slot) -> Result<()> {
        let skip = self.new_label(LabelPurpose::Skip);
        self.load_slot_x(Reg64::X0, counter);
        self.jump_if_zero(Reg64::X0, skip);
        self.print_text(", ");
        self.bind(skip)
    }

    /// `{"A": A, "B": B}`; both halves of each pair print the interned case
    /// name, the same address the enum's values hold
    fn print_enum(&mut self, name: &str) -> Result<()> {
        let cases = match self.enums.get(name) {
            Some(layout) => layout.cases.clone(),
            None => return unsupported(format!("unknown enum `{}`", name)),
        };
        if cases.is_empty() {
            self.print_text("{}\n");
            return Ok(());
        }
        let last = cases.len() - 1;
        for (i, (_, label)) in cases.into_iter().enumerate() {
            self.load_address(Reg64::X0, label);
            encoding::str_x_imm(&mut self.code, Reg64::X0, Reg64::SP, 0);
            encoding::str_x_imm(&mut self.code, Reg64::X0, Reg64::SP, 8);
            let format = format!(
                "{}\"%s\": %s{}",
                if i == 0 { "{" } else { ", " },
                if i == last { "}\n" } else { "" }
            );
            self.printf(&format);
        }
        Ok(())
    }

    // =========================================================================
    // Interpolation
    // =========================================================================

    /// One printf whose format interleaves the literal text with one
    /// conversion per referenced variable
    fn print_interpolation(&mut self, parts: &[InterpolationPart]) -> Result<()> {
        let values = parts
            .iter()
            .filter(|p| matches!(p, InterpolationPart::Var(_)))
            .count();
        if values > MAX_VARARGS {
            return Err(JibJabError::ResourceExhausted {
                resource: "interpolated values per print",
                limit: MAX_VARARGS,
            });
        }

        let mut format = String::new();
        let mut k = 0;
        for part in parts {
            match part {
                InterpolationPart::Text(text) => {
                    let text = String::from_utf8_lossy(&expand_escapes(text)).into_owned();
                    format.push_str(&printf_literal(&text));
                }
                InterpolationPart::Var(name) => {
                    let kind = match self.symbol_shape(name)? {
                        Some((slot, shape)) => match shape.scalar() {
                            Some(kind) => {
                                self.load_slot(slot, kind);
                                kind
                            }
                            None => {
                                return unsupported(format!(
                                    "{} `{}` in string interpolation",
                                    shape.describe(),
                                    name
                                ))
                            }
                        },
                        None => return unsupported(format!("unknown variable `{}`", name)),
                    };
                    format.push_str(self.store_vararg(kind, k)?);
                    k += 1;
                }
            }
        }
        format.push('\n');
        self.printf(&format);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::arm64::codegen::{CodegenSession, DataRef, Import, MachineImage};
    use crate::arm64::data::DataLabel;
    use crate::ast::{Expr, InterpolationPart, Program, Stmt};
    use crate::JibJabError;

    fn compile(statements: Vec<Stmt>) -> crate::Result<MachineImage> {
        CodegenSession::compile(&Program::new(statements))
    }

    /// Every NUL-terminated string of the constant pool
    fn strings(image: &MachineImage) -> Vec<String> {
        image
            .data
            .cstrings
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    fn printf_calls(image: &MachineImage) -> usize {
        image
            .data_fixups
            .iter()
            .filter(|f| f.target == DataRef::Got(Import::Printf))
            .count()
    }

    #[test]
    fn test_scalar_formats() {
        let image = compile(vec![
            Stmt::print(Expr::int(15)),
            Stmt::print(Expr::float(2.5)),
            Stmt::print(Expr::str("hi")),
            Stmt::print(Expr::Bool(true)),
        ])
        .unwrap();
        let pool = strings(&image);
        for expected in ["%ld\n", "%g\n", "%s\n", "hi", "true", "false"] {
            assert!(pool.iter().any(|s| s == expected), "missing {:?}", expected);
        }
        assert_eq!(printf_calls(&image), 4);
    }

    #[test]
    fn test_array_print_is_a_loop() {
        let items: Vec<Expr> = (0..50).map(Expr::int).collect();
        let image = compile(vec![
            Stmt::decl("xs", Expr::Array(items)),
            Stmt::print(Expr::var("xs")),
        ])
        .unwrap();
        // "[", separator, element, "]\n": independent of the element count
        assert_eq!(printf_calls(&image), 4);
        let pool = strings(&image);
        assert!(pool.iter().any(|s| s == "["));
        assert!(pool.iter().any(|s| s == ", "));
        assert!(pool.iter().any(|s| s == "]\n"));
    }

    #[test]
    fn test_strings_are_quoted_inside_composites() {
        let image = compile(vec![
            Stmt::decl("t", Expr::Tuple(vec![Expr::int(1), Expr::str("a")])),
            Stmt::print(Expr::var("t")),
        ])
        .unwrap();
        let pool = strings(&image);
        assert!(pool.iter().any(|s| s == "(%ld"));
        assert!(pool.iter().any(|s| s == ", \"%s\")\n"));
    }

    #[test]
    fn test_dict_print_formats() {
        let image = compile(vec![
            Stmt::decl(
                "d",
                Expr::dict(vec![
                    (Expr::str("k"), Expr::int(1)),
                    (Expr::str("xs"), Expr::Array(vec![Expr::int(1), Expr::int(2)])),
                ]),
            ),
            Stmt::print(Expr::var("d")),
        ])
        .unwrap();
        let pool = strings(&image);
        assert!(pool.iter().any(|s| s == "{\"k\": %ld"));
        assert!(pool.iter().any(|s| s == ", \"xs\": ["));
        assert!(pool.iter().any(|s| s == "}\n"));
    }

    #[test]
    fn test_enum_print_shares_case_strings() {
        let image = compile(vec![
            Stmt::enum_def("Color", &["Red", "Green"]),
            Stmt::decl("c", Expr::index(Expr::var("Color"), Expr::str("Green"))),
            Stmt::print(Expr::var("Color")),
            Stmt::print(Expr::var("c")),
        ])
        .unwrap();
        let pool = strings(&image);
        assert_eq!(pool.iter().filter(|s| *s == "Green").count(), 1);
        assert!(pool.iter().any(|s| s == "{\"%s\": %s"));
        assert!(pool.iter().any(|s| s == ", \"%s\": %s}\n"));
        let green = image
            .data_fixups
            .iter()
            .filter(|f| matches!(f.target, DataRef::Data(DataLabel::Str(_))))
            .count();
        assert!(green >= 3);
    }

    #[test]
    fn test_interpolation_builds_one_format() {
        let image = compile(vec![
            Stmt::decl("n", Expr::int(3)),
            Stmt::decl("x", Expr::float(0.5)),
            Stmt::print(Expr::Interpolation(vec![
                InterpolationPart::Text("n=".into()),
                InterpolationPart::Var("n".into()),
                InterpolationPart::Text(" x=".into()),
                InterpolationPart::Var("x".into()),
                InterpolationPart::Text(" 100%".into()),
            ])),
        ])
        .unwrap();
        assert!(strings(&image).iter().any(|s| s == "n=%ld x=%g 100%%\n"));
        assert_eq!(printf_calls(&image), 1);
    }

    #[test]
    fn test_interpolation_limits() {
        let mut parts = Vec::new();
        let mut program = vec![Stmt::decl("v", Expr::int(1))];
        for _ in 0..9 {
            parts.push(InterpolationPart::Var("v".into()));
        }
        program.push(Stmt::print(Expr::Interpolation(parts)));
        assert!(matches!(
            compile(program),
            Err(JibJabError::ResourceExhausted { limit: 8, .. })
        ));

        let program = vec![
            Stmt::decl("xs", Expr::Array(vec![Expr::int(1)])),
            Stmt::print(Expr::Interpolation(vec![InterpolationPart::Var("xs".into())])),
        ];
        assert!(matches!(
            compile(program),
            Err(JibJabError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_nested_array_and_rows() {
        let image = compile(vec![
            Stmt::decl(
                "m",
                Expr::Array(vec![
                    Expr::Array(vec![Expr::int(1), Expr::int(2)]),
                    Expr::Array(vec![Expr::int(3), Expr::int(4)]),
                ]),
            ),
            Stmt::print(Expr::var("m")),
            Stmt::print(Expr::index(Expr::var("m"), Expr::int(1))),
        ])
        .unwrap();
        let pool = strings(&image);
        assert!(pool.iter().any(|s| s == "["));
        assert!(pool.iter().any(|s| s == "]"));
        assert!(pool.iter().any(|s| s == "]\n"));
    }

    #[test]
    fn test_row_with_runtime_index() {
        let image = compile(vec![
            Stmt::decl(
                "m",
                Expr::Array(vec![
                    Expr::Array(vec![Expr::int(1), Expr::int(2)]),
                    Expr::Array(vec![Expr::int(3), Expr::int(4)]),
                ]),
            ),
            Stmt::counted_loop(
                "i",
                Expr::int(0),
                Expr::int(2),
                vec![Stmt::print(Expr::index(Expr::var("m"), Expr::var("i")))],
            ),
        ])
        .unwrap();
        // "[", separator, element, "]\n"
        assert_eq!(printf_calls(&image), 4);
        let pool = strings(&image);
        assert!(pool.iter().any(|s| s == "["));
        assert!(pool.iter().any(|s| s == "]\n"));
    }

    #[test]
    fn test_empty_composites() {
        let image = compile(vec![
            Stmt::decl("xs", Expr::Array(vec![])),
            Stmt::print(Expr::var("xs")),
        ])
        .unwrap();
        assert!(strings(&image).iter().any(|s| s == "[]\n"));
    }
}
