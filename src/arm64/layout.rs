//! Layout Manager
//!
//! Assigns every variable of a frame a fixed 8-byte slot (or a contiguous
//! span of slots for composites) and tracks the shape last assigned to it.
//!
//! ## Frame layout
//!
//! ```text
//! high  | saved X29, X30        |
//!       | saved X19 .. X28      |
//!       | slot MAX_SLOTS-1      |
//!       | ...                   |
//!       | slot 0                |  X28 + VARARG_AREA
//!       | outgoing printf args  |
//! low   +-----------------------+  SP == X28 between statements
//! ```

use std::collections::HashMap;

use super::data::StrConst;
use super::labels::Label;
use crate::{JibJabError, Result};

/// Maximum number of slots per frame
pub const MAX_SLOTS: usize = 256;
/// Bytes per slot
pub const SLOT_SIZE: usize = 8;
/// Maximum values passed to one printf call
pub const MAX_VARARGS: usize = 8;
/// Outgoing variadic argument area at the bottom of the frame
pub const VARARG_AREA: usize = MAX_VARARGS * SLOT_SIZE;
/// Size of the local region allocated below the saved registers
pub const LOCAL_BYTES: usize = VARARG_AREA + MAX_SLOTS * SLOT_SIZE;

/// A frame slot, addressed relative to the frame base register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u16);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Byte offset from the frame base
    pub fn offset(self) -> u16 {
        (VARARG_AREA + self.index() * SLOT_SIZE) as u16
    }

    /// The slot `k` positions after this one
    pub fn nth(self, k: usize) -> Slot {
        Slot(self.0 + k as u16)
    }
}

/// Shape of a single machine word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Int,
    Float,
    Bool,
    /// Pointer to a NUL-terminated string
    Str,
}

impl Scalar {
    pub fn is_float(self) -> bool {
        self == Scalar::Float
    }

    pub fn name(self) -> &'static str {
        match self {
            Scalar::Int => "int",
            Scalar::Float => "float",
            Scalar::Bool => "bool",
            Scalar::Str => "string",
        }
    }
}

/// Statically tracked shape of a variable (last assignment wins)
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Int,
    Float,
    Bool,
    Str,
    /// Bound to a case of the named enum; held as the case-name pointer
    EnumCase(String),
    Array(ArrayLayout),
    Tuple(TupleLayout),
    Dict(DictLayout),
}

impl Shape {
    /// The machine word shape, for single-slot shapes
    pub fn scalar(&self) -> Option<Scalar> {
        match self {
            Shape::Int => Some(Scalar::Int),
            Shape::Float => Some(Scalar::Float),
            Shape::Bool => Some(Scalar::Bool),
            Shape::Str | Shape::EnumCase(_) => Some(Scalar::Str),
            Shape::Array(_) | Shape::Tuple(_) | Shape::Dict(_) => None,
        }
    }

    pub fn from_scalar(scalar: Scalar) -> Shape {
        match scalar {
            Scalar::Int => Shape::Int,
            Scalar::Float => Shape::Float,
            Scalar::Bool => Shape::Bool,
            Scalar::Str => Shape::Str,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Shape::Int => "int",
            Shape::Float => "float",
            Shape::Bool => "bool",
            Shape::Str => "string",
            Shape::EnumCase(_) => "enum case",
            Shape::Array(_) => "array",
            Shape::Tuple(_) => "tuple",
            Shape::Dict(_) => "dict",
        }
    }
}

/// Array of `count` elements; 2-level arrays store `count * inner` elements
/// row-major
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub base: Slot,
    pub count: usize,
    pub element: Scalar,
    pub inner: Option<usize>,
}

impl ArrayLayout {
    #[cfg(test)]
    pub fn slots(&self) -> usize {
        self.count * self.inner.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleLayout {
    pub elements: Vec<(Slot, Scalar)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictLayout {
    pub fields: Vec<DictField>,
}

impl DictLayout {
    pub fn field(&self, key: &str) -> Option<&DictField> {
        self.fields.iter().find(|f| f.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictField {
    pub key: String,
    pub slot: Slot,
    pub value: FieldShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Scalar(Scalar),
    /// Flat array stored in `count` slots starting at the field slot
    Array { count: usize, element: Scalar },
}

/// A named frame binding
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub slot: Slot,
    /// Number of slots owned, starting at `slot`
    pub span: usize,
    pub shape: Shape,
}

/// Slot allocator and symbol table for one frame
#[derive(Debug, Default)]
pub struct LayoutManager {
    symbols: HashMap<String, Symbol>,
    next_slot: usize,
}

impl LayoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a single-slot shape. An existing binding keeps its slot.
    pub fn assign(&mut self, name: &str, shape: Shape) -> Result<Slot> {
        if let Some(symbol) = self.symbols.get_mut(name) {
            if symbol.span > 0 {
                symbol.shape = shape;
                return Ok(symbol.slot);
            }
        }
        let slot = self.reserve(1)?;
        self.bind(Symbol {
            name: name.to_string(),
            slot,
            span: 1,
            shape,
        });
        Ok(slot)
    }

    /// Find room for a composite of `slots` elements bound to `name`.
    /// The existing span is reused when it is large enough. Returns the base
    /// slot and the number of slots the binding will own.
    pub fn span_for(&mut self, name: &str, slots: usize) -> Result<(Slot, usize)> {
        if let Some(symbol) = self.symbols.get(name) {
            if symbol.span >= slots && symbol.span > 0 {
                return Ok((symbol.slot, symbol.span));
            }
        }
        Ok((self.reserve(slots)?, slots))
    }

    /// Install or replace a binding
    pub fn bind(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.name.clone(), symbol);
    }

    /// Anonymous slot (loop bounds, print counters)
    pub fn hidden(&mut self) -> Result<Slot> {
        self.reserve(1)
    }

    fn reserve(&mut self, count: usize) -> Result<Slot> {
        if self.next_slot + count > MAX_SLOTS {
            return Err(JibJabError::ResourceExhausted {
                resource: "frame slots",
                limit: MAX_SLOTS,
            });
        }
        let slot = Slot(self.next_slot as u16);
        self.next_slot += count;
        Ok(slot)
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn slots_used(&self) -> usize {
        self.next_slot
    }
}

/// An enum declaration: ordered cases, each with its interned name string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumLayout {
    pub name: String,
    pub cases: Vec<(String, StrConst)>,
}

impl EnumLayout {
    pub fn case(&self, name: &str) -> Option<StrConst> {
        self.cases.iter().find(|(c, _)| c == name).map(|(_, s)| *s)
    }
}

/// Enum declarations visible to the whole program. No slots are allocated
/// until a variable is bound to a case.
#[derive(Debug, Default)]
pub struct EnumTable {
    enums: HashMap<String, EnumLayout>,
}

impl EnumTable {
    pub fn define(&mut self, layout: EnumLayout) {
        self.enums.insert(layout.name.clone(), layout);
    }

    pub fn get(&self, name: &str) -> Option<&EnumLayout> {
        self.enums.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.enums.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The implicit `_main` frame holding top-level statements
    Entry,
    Function,
}

/// One function activation's compile-time record
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub layout: LayoutManager,
    pub return_label: Label,
    print_scratch: Vec<Slot>,
}

impl Frame {
    pub fn new(kind: FrameKind, return_label: Label) -> Self {
        Self {
            kind,
            layout: LayoutManager::new(),
            return_label,
            print_scratch: Vec::new(),
        }
    }

    /// The first `count` print-loop scratch slots, allocated on first use and
    /// shared by every print statement in the frame
    pub fn print_scratch(&mut self, count: usize) -> Result<Vec<Slot>> {
        while self.print_scratch.len() < count {
            let slot = self.layout.hidden()?;
            self.print_scratch.push(slot);
        }
        Ok(self.print_scratch[..count].to_vec())
    }
}
