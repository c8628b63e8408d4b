//! Code labels and branch fixups
//!
//! Branches are emitted with a zero displacement and recorded as
//! `(site, label)` fixups. Once the whole instruction stream exists every
//! label has an offset and [`LabelTable::resolve`] rewrites each branch.

use std::fmt;

use tracing::trace;

use super::encoding::{branch_form, patch_branch, read_insn, write_insn};
use crate::{JibJabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// What a label marks; only used for diagnostics and listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPurpose {
    LoopTop,
    LoopEnd,
    Else,
    EndIf,
    FunctionEntry,
    FunctionReturn,
    Skip,
}

impl fmt::Display for LabelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabelPurpose::LoopTop => "loop_top",
            LabelPurpose::LoopEnd => "loop_end",
            LabelPurpose::Else => "else",
            LabelPurpose::EndIf => "end_if",
            LabelPurpose::FunctionEntry => "func",
            LabelPurpose::FunctionReturn => "ret",
            LabelPurpose::Skip => "skip",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct LabelEntry {
    purpose: LabelPurpose,
    offset: Option<usize>,
}

#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Vec<LabelEntry>,
    fixups: Vec<(usize, Label)>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, not yet defined label
    pub fn create(&mut self, purpose: LabelPurpose) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelEntry {
            purpose,
            offset: None,
        });
        label
    }

    /// Fix `label` at code offset `offset`. A label is defined exactly once.
    pub fn define(&mut self, label: Label, offset: usize) -> Result<()> {
        let entry = self.entry_mut(label)?;
        if entry.offset.is_some() {
            return Err(JibJabError::Internal {
                message: format!("label {} defined twice", label_name(label, entry.purpose)),
            });
        }
        entry.offset = Some(offset);
        Ok(())
    }

    /// Record that the branch at `site` targets `label`
    pub fn reference(&mut self, site: usize, label: Label) {
        self.fixups.push((site, label));
    }

    #[cfg(test)]
    pub fn offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).and_then(|e| e.offset)
    }

    #[cfg(test)]
    pub fn purpose(&self, label: Label) -> Option<LabelPurpose> {
        self.labels.get(label.0 as usize).map(|e| e.purpose)
    }

    /// Labels created but never defined
    #[cfg(test)]
    pub fn undefined(&self) -> usize {
        self.labels.iter().filter(|e| e.offset.is_none()).count()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn fixup_count(&self) -> usize {
        self.fixups.len()
    }

    fn entry_mut(&mut self, label: Label) -> Result<&mut LabelEntry> {
        self.labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| JibJabError::Internal {
                message: format!("unknown label id {}", label.0),
            })
    }

    /// Patch every recorded branch in `code`
    pub fn resolve(&self, code: &mut [u8]) -> Result<()> {
        for &(site, label) in &self.fixups {
            let entry = &self.labels[label.0 as usize];
            let name = label_name(label, entry.purpose);
            let target = entry.offset.ok_or_else(|| JibJabError::Internal {
                message: format!("label {} referenced but never defined", name),
            })?;
            let insn = read_insn(code, site).ok_or_else(|| JibJabError::Internal {
                message: format!("branch site {:#x} outside the code buffer", site),
            })?;
            let form = branch_form(insn).ok_or_else(|| JibJabError::Internal {
                message: format!("instruction {:#010x} at {:#x} is not a branch", insn, site),
            })?;
            let displacement = target as i64 - site as i64;
            let patched = patch_branch(insn, displacement).ok_or_else(|| JibJabError::Internal {
                message: format!(
                    "branch to {} at {:#x} is {} bytes away, beyond the {} byte reach",
                    name,
                    site,
                    displacement,
                    form.reach()
                ),
            })?;
            trace!(site, target, label = %name, "patched branch");
            write_insn(code, site, patched).ok_or_else(|| JibJabError::Internal {
                message: format!("branch site {:#x} outside the code buffer", site),
            })?;
        }
        Ok(())
    }
}

fn label_name(label: Label, purpose: LabelPurpose) -> String {
    format!("L{}_{}", purpose, label.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::encoding::{b, cbz_x, movz_x};
    use crate::arm64::registers::Reg64;

    #[test]
    fn test_labels_are_unique() {
        let mut table = LabelTable::new();
        let a = table.create(LabelPurpose::LoopTop);
        let b = table.create(LabelPurpose::LoopTop);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.purpose(b), Some(LabelPurpose::LoopTop));
    }

    #[test]
    fn test_double_definition_is_internal_error() {
        let mut table = LabelTable::new();
        let l = table.create(LabelPurpose::Else);
        table.define(l, 0).unwrap();
        assert!(matches!(
            table.define(l, 4),
            Err(JibJabError::Internal { .. })
        ));
    }

    #[test]
    fn test_resolve_forward_and_backward() {
        let mut table = LabelTable::new();
        let top = table.create(LabelPurpose::LoopTop);
        let end = table.create(LabelPurpose::LoopEnd);
        let mut code = Vec::new();

        table.define(top, code.len()).unwrap();
        table.reference(code.len(), end);
        cbz_x(&mut code, Reg64::X0, 0);
        movz_x(&mut code, Reg64::X1, 0, 0);
        table.reference(code.len(), top);
        b(&mut code, 0);
        table.define(end, code.len()).unwrap();

        table.resolve(&mut code).unwrap();
        // CBZ X0, +12
        assert_eq!(read_insn(&code, 0), Some(0xB4000060));
        // B -8
        assert_eq!(read_insn(&code, 8), Some(0x17FFFFFE));
    }

    #[test]
    fn test_out_of_range_branch_is_internal_error() {
        let mut table = LabelTable::new();
        let far = table.create(LabelPurpose::LoopEnd);
        let mut code = Vec::new();
        table.reference(0, far);
        cbz_x(&mut code, Reg64::X0, 0);
        // Beyond the +/-1MB reach of CBZ
        table.define(far, 1 << 21).unwrap();
        let err = table.resolve(&mut code).unwrap_err();
        assert!(matches!(err, JibJabError::Internal { .. }));
        assert!(err.to_string().contains("reach"));
    }

    #[test]
    fn test_undefined_label_is_internal_error() {
        let mut table = LabelTable::new();
        let l = table.create(LabelPurpose::EndIf);
        let mut code = Vec::new();
        table.reference(0, l);
        b(&mut code, 0);
        let err = table.resolve(&mut code).unwrap_err();
        assert!(err.to_string().contains("never defined"));
    }
}
