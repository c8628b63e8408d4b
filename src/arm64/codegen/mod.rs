//! ARM64 Code Generation
//!
//! Lowers a JibJab [`Program`] into ARM64 machine code in one forward pass.
//! All mutable state of a compilation (instruction buffer, labels, constant
//! pools, frames) lives in one [`CodegenSession`], so independent
//! compilations never share anything.
//!
//! Register conventions of generated code:
//!
//! - X0 / D0: result of the expression just lowered
//! - X1, X2 / D1, D2: right operand and scratch
//! - X16, X17: address scratch (GOT calls, constant addresses)
//! - X19-X27: call arguments in flight
//! - X28: frame base; slot `i` lives at `[x28, #VARARG_AREA + 8*i]`

mod expr;
mod print;
mod stmt;

use std::collections::HashMap;

use tracing::{debug, debug_span};

use super::data::{DataImage, DataLabel, DataSection, StrConst};
use super::encoding;
use super::labels::{Label, LabelPurpose, LabelTable};
use super::layout::{EnumLayout, EnumTable, Frame, FrameKind, Scalar, Shape, Slot, LOCAL_BYTES};
use super::registers::calling_convention::{ARGUMENT_REGS, FRAME_BASE, IP0, RETURN_REG, SAVED_PAIRS};
use super::registers::{DReg, Reg64};
use crate::ast::{FuncDef, Program, Stmt};
use crate::{JibJabError, Result};

/// Maximum number of call arguments (one per argument register)
pub const MAX_ARGS: usize = ARGUMENT_REGS.len();

// The local region is reserved with a single ADD/SUB immediate
const _: () = assert!(LOCAL_BYTES <= 0xFFF && LOCAL_BYTES % 16 == 0);

/// libSystem functions reached through the GOT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Import {
    Printf,
    Exit,
}

impl Import {
    /// GOT order
    pub const ALL: [Import; 2] = [Import::Printf, Import::Exit];

    pub fn symbol(self) -> &'static str {
        match self {
            Import::Printf => "_printf",
            Import::Exit => "_exit",
        }
    }

    pub fn got_index(self) -> usize {
        match self {
            Import::Printf => 0,
            Import::Exit => 1,
        }
    }
}

/// What a page-relative address computation points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRef {
    /// `adrp` + `add` (strings) or `adrp` + `ldr d` (doubles)
    Data(DataLabel),
    /// `adrp` + `ldr x` of a GOT entry
    Got(Import),
}

/// An ADRP at `site` whose page delta, and the page offset in the following
/// instruction, are filled in once final addresses are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFixup {
    pub site: usize,
    pub target: DataRef,
}

/// Output of code generation, input of the Mach-O builder
#[derive(Debug, Clone)]
pub struct MachineImage {
    pub code: Vec<u8>,
    /// Offset of `_main` within `code`
    pub entry_offset: usize,
    pub data: DataImage,
    pub data_fixups: Vec<DataFixup>,
}

#[derive(Debug, Clone, Copy)]
struct FunctionInfo {
    entry: Label,
    arity: usize,
}

/// Reject a construct outside the supported subset
fn unsupported<T>(construct: impl Into<String>) -> Result<T> {
    Err(JibJabError::UnsupportedConstruct {
        construct: construct.into(),
    })
}

/// ARM64 code generation session for one program
#[derive(Debug, Default)]
pub struct CodegenSession {
    /// Generated machine code
    code: Vec<u8>,
    data: DataSection,
    labels: LabelTable,
    data_fixups: Vec<DataFixup>,
    functions: HashMap<String, FunctionInfo>,
    enums: EnumTable,
    /// Frame currently being lowered
    frame: Option<Frame>,
    /// Staging registers held by enclosing calls
    staging_depth: usize,
    entry_offset: Option<usize>,
}

impl CodegenSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower a whole program
    pub fn compile(program: &Program) -> Result<MachineImage> {
        let mut session = Self::new();
        session.lower_program(program)?;
        session.finish()
    }

    fn lower_program(&mut self, program: &Program) -> Result<()> {
        // Functions and top-level enums are visible everywhere, so declare
        // them before lowering any body.
        let mut defs: Vec<&FuncDef> = Vec::new();
        for stmt in &program.statements {
            match stmt {
                Stmt::FuncDef(def) => {
                    if def.params.len() > MAX_ARGS {
                        return Err(JibJabError::ResourceExhausted {
                            resource: "function parameters",
                            limit: MAX_ARGS,
                        });
                    }
                    if let Some(existing) = defs.iter_mut().find(|d| d.name == def.name) {
                        // A later definition replaces the earlier one
                        *existing = def;
                        if let Some(info) = self.functions.get_mut(&def.name) {
                            info.arity = def.params.len();
                        }
                        continue;
                    }
                    let entry = self.labels.create(LabelPurpose::FunctionEntry);
                    self.functions.insert(
                        def.name.clone(),
                        FunctionInfo {
                            entry,
                            arity: def.params.len(),
                        },
                    );
                    defs.push(def);
                }
                Stmt::EnumDef { name, cases } => self.define_enum(name, cases),
                _ => {}
            }
        }

        for def in defs {
            self.lower_function(def)?;
        }
        self.lower_entry(&program.statements)
    }

    fn lower_function(&mut self, def: &FuncDef) -> Result<()> {
        let _span = debug_span!("function", name = %def.name).entered();
        let start = self.code.len();
        let info = self.functions.get(&def.name).copied().ok_or_else(|| {
            JibJabError::Internal {
                message: format!("function `{}` was not declared", def.name),
            }
        })?;
        self.bind(info.entry)?;
        self.open_frame(FrameKind::Function);
        self.emit_prologue();

        // Parameters arrive in X0..X7 and are spilled to the first slots
        for (i, param) in def.params.iter().enumerate() {
            let slot = self.frame_mut()?.layout.assign(param, Shape::Int)?;
            encoding::str_x_imm(&mut self.code, ARGUMENT_REGS[i], FRAME_BASE, slot.offset());
        }

        self.lower_block(&def.body)?;

        // Falling off the end returns 0
        encoding::load_imm64(&mut self.code, RETURN_REG, 0);
        let frame = self.close_frame()?;
        self.bind(frame.return_label)?;
        self.emit_epilogue();
        debug!(
            bytes = self.code.len() - start,
            slots = frame.layout.slots_used(),
            "lowered function"
        );
        Ok(())
    }

    /// The implicit `_main` frame: top-level statements, then `exit(0)`
    fn lower_entry(&mut self, statements: &[Stmt]) -> Result<()> {
        let _span = debug_span!("entry").entered();
        self.entry_offset = Some(self.code.len());
        self.open_frame(FrameKind::Entry);
        self.emit_prologue();

        for stmt in statements {
            if matches!(stmt, Stmt::FuncDef(_)) {
                continue;
            }
            self.lower_stmt(stmt)?;
        }

        // exit() rather than returning so stdio buffers are flushed
        encoding::load_imm64(&mut self.code, Reg64::X0, 0);
        self.call_import(Import::Exit);

        let frame = self.close_frame()?;
        self.bind(frame.return_label)?;
        self.emit_epilogue();
        debug!(slots = frame.layout.slots_used(), "lowered entry frame");
        Ok(())
    }

    /// Resolve branches and hand the result to the binary emitter
    pub fn finish(mut self) -> Result<MachineImage> {
        self.labels.resolve(&mut self.code)?;
        let entry_offset = self.entry_offset.ok_or_else(|| JibJabError::Internal {
            message: "entry frame was never emitted".to_string(),
        })?;
        debug!(
            code_bytes = self.code.len(),
            labels = self.labels.len(),
            branch_fixups = self.labels.fixup_count(),
            data_fixups = self.data_fixups.len(),
            "code generation finished"
        );
        Ok(MachineImage {
            code: self.code,
            entry_offset,
            data: self.data.finish(),
            data_fixups: self.data_fixups,
        })
    }

    fn define_enum(&mut self, name: &str, cases: &[String]) {
        let cases = cases
            .iter()
            .map(|case| (case.clone(), self.data.intern_str(case)))
            .collect();
        self.enums.define(EnumLayout {
            name: name.to_string(),
            cases,
        });
    }

    // =========================================================================
    // Frames
    // =========================================================================

    fn open_frame(&mut self, kind: FrameKind) {
        let return_label = self.labels.create(LabelPurpose::FunctionReturn);
        self.frame = Some(Frame::new(kind, return_label));
        self.staging_depth = 0;
    }

    fn close_frame(&mut self) -> Result<Frame> {
        self.frame.take().ok_or_else(|| JibJabError::Internal {
            message: "no frame is open".to_string(),
        })
    }

    fn frame(&self) -> Result<&Frame> {
        self.frame.as_ref().ok_or_else(|| JibJabError::Internal {
            message: "no frame is open".to_string(),
        })
    }

    fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.frame.as_mut().ok_or_else(|| JibJabError::Internal {
            message: "no frame is open".to_string(),
        })
    }

    /// stp x29, x30, [sp, #-16]!; mov x29, sp; save X19-X28; reserve locals;
    /// mov x28, sp
    fn emit_prologue(&mut self) {
        encoding::stp_pre_x(&mut self.code, Reg64::X29, Reg64::X30, Reg64::SP, -16);
        encoding::add_imm_x(&mut self.code, Reg64::X29, Reg64::SP, 0);
        for (a, b) in SAVED_PAIRS {
            encoding::stp_pre_x(&mut self.code, a, b, Reg64::SP, -16);
        }
        encoding::sub_imm_x(&mut self.code, Reg64::SP, Reg64::SP, LOCAL_BYTES as u16);
        encoding::add_imm_x(&mut self.code, FRAME_BASE, Reg64::SP, 0);
    }

    /// Single exit path shared by every `return`
    fn emit_epilogue(&mut self) {
        encoding::add_imm_x(&mut self.code, Reg64::SP, FRAME_BASE, LOCAL_BYTES as u16);
        for (a, b) in SAVED_PAIRS.iter().rev() {
            encoding::ldp_post_x(&mut self.code, *a, *b, Reg64::SP, 16);
        }
        encoding::ldp_post_x(&mut self.code, Reg64::X29, Reg64::X30, Reg64::SP, 16);
        encoding::ret(&mut self.code);
    }

    // =========================================================================
    // Labels and branches
    // =========================================================================

    fn new_label(&mut self, purpose: LabelPurpose) -> Label {
        self.labels.create(purpose)
    }

    fn bind(&mut self, label: Label) -> Result<()> {
        self.labels.define(label, self.code.len())
    }

    fn jump(&mut self, label: Label) {
        self.labels.reference(self.code.len(), label);
        encoding::b(&mut self.code, 0);
    }

    fn jump_if(&mut self, cond: encoding::Condition, label: Label) {
        self.labels.reference(self.code.len(), label);
        encoding::b_cond(&mut self.code, cond, 0);
    }

    fn jump_if_zero(&mut self, reg: Reg64, label: Label) {
        self.labels.reference(self.code.len(), label);
        encoding::cbz_x(&mut self.code, reg, 0);
    }

    fn call_label(&mut self, label: Label) {
        self.labels.reference(self.code.len(), label);
        encoding::bl(&mut self.code, 0);
    }

    // =========================================================================
    // Constants and imports
    // =========================================================================

    /// adrp rd, str@PAGE; add rd, rd, str@PAGEOFF
    fn load_address(&mut self, rd: Reg64, label: StrConst) {
        self.data_fixups.push(DataFixup {
            site: self.code.len(),
            target: DataRef::Data(DataLabel::Str(label)),
        });
        encoding::adrp(&mut self.code, rd, 0);
        encoding::add_imm_x(&mut self.code, rd, rd, 0);
    }

    /// Intern `text` (source-form escapes) and load its address
    fn load_string(&mut self, rd: Reg64, text: &str) {
        let label = self.data.intern_str(text);
        self.load_address(rd, label);
    }

    /// adrp x16, const@PAGE; ldr dt, [x16, const@PAGEOFF]
    fn load_double(&mut self, rt: DReg, value: f64) {
        let label = self.data.intern_double(value);
        self.data_fixups.push(DataFixup {
            site: self.code.len(),
            target: DataRef::Data(DataLabel::Double(label)),
        });
        encoding::adrp(&mut self.code, IP0, 0);
        encoding::ldr_d_imm(&mut self.code, rt, IP0, 0);
    }

    /// Call a libSystem function through its GOT entry
    fn call_import(&mut self, import: Import) {
        self.data_fixups.push(DataFixup {
            site: self.code.len(),
            target: DataRef::Got(import),
        });
        encoding::adrp(&mut self.code, IP0, 0);
        encoding::ldr_x_imm(&mut self.code, IP0, IP0, 0);
        encoding::blr(&mut self.code, IP0);
    }

    // =========================================================================
    // Slots and the operand stack
    // =========================================================================

    /// Load a slot into X0 or D0
    fn load_slot(&mut self, slot: Slot, kind: Scalar) {
        if kind.is_float() {
            encoding::ldr_d_imm(&mut self.code, DReg::D0, FRAME_BASE, slot.offset());
        } else {
            encoding::ldr_x_imm(&mut self.code, Reg64::X0, FRAME_BASE, slot.offset());
        }
    }

    /// Store X0 or D0 into a slot
    fn store_slot(&mut self, slot: Slot, kind: Scalar) {
        if kind.is_float() {
            encoding::str_d_imm(&mut self.code, DReg::D0, FRAME_BASE, slot.offset());
        } else {
            encoding::str_x_imm(&mut self.code, Reg64::X0, FRAME_BASE, slot.offset());
        }
    }

    fn load_slot_x(&mut self, reg: Reg64, slot: Slot) {
        encoding::ldr_x_imm(&mut self.code, reg, FRAME_BASE, slot.offset());
    }

    fn store_slot_x(&mut self, reg: Reg64, slot: Slot) {
        encoding::str_x_imm(&mut self.code, reg, FRAME_BASE, slot.offset());
    }

    /// Push the current result (16 bytes keep SP aligned)
    fn push_result(&mut self, kind: Scalar) {
        if kind.is_float() {
            encoding::str_d_pre(&mut self.code, DReg::D0, Reg64::SP, -16);
        } else {
            encoding::str_x_pre(&mut self.code, Reg64::X0, Reg64::SP, -16);
        }
    }

    fn pop_x(&mut self, reg: Reg64) {
        encoding::ldr_x_post(&mut self.code, reg, Reg64::SP, 16);
    }

    fn pop_d(&mut self, reg: DReg) {
        encoding::ldr_d_post(&mut self.code, reg, Reg64::SP, 16);
    }

    /// Shape and slot of a bound variable
    fn symbol_shape(&self, name: &str) -> Result<Option<(Slot, Shape)>> {
        Ok(self
            .frame()?
            .layout
            .lookup(name)
            .map(|symbol| (symbol.slot, symbol.shape.clone())))
    }
}
