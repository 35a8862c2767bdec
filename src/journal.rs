//! The operation journal: the ordered record of every operation whose
//! `perform` succeeded and whose component completed.
//!
//! Commits happen per component, and a committed entry is permanent as far
//! as rollback is concerned: a failure later in the run unwinds only the
//! failing component's uncommitted operations. Committed entries are
//! unwound by the maintenance tool's uninstall path, or by a
//! remove-before-update predecessor sweep. The encoded form is what the
//! artifact writer embeds into the maintenance tool.

use std::path::Path;

use anyhow::Result;

use crate::operation::Operation;
use crate::utils;
use crate::utils::wire::{Reader, Writer};

/// Bumped when the entry encoding changes shape.
const JOURNAL_FORMAT: u32 = 1;

#[derive(Debug, Default)]
pub struct Journal {
    committed: Vec<Operation>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal inherited from an earlier session's encoded form.
    pub fn from_encoded(data: &[u8]) -> Result<Self> {
        Ok(Self {
            committed: decode_operations(data)?,
        })
    }

    pub fn committed(&self) -> &[Operation] {
        &self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Commit a component's performed operations. Appends preserve
    /// execution order; the executor is the single writer.
    pub fn commit(&mut self, ops: impl IntoIterator<Item = Operation>) {
        self.committed.extend(ops);
    }

    /// Take every entry in reverse journal order: the full uninstall path.
    pub fn drain_reversed(&mut self) -> Vec<Operation> {
        let mut ops = std::mem::take(&mut self.committed);
        ops.reverse();
        ops
    }

    /// Remove the entries belonging to any of `names`, returning them in
    /// reverse journal order. Used by remove-before-update and by partial
    /// package removal.
    pub fn take_committed_of(&mut self, names: &[String]) -> Vec<Operation> {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for op in std::mem::take(&mut self.committed) {
            let matches = op
                .component()
                .map(|c| names.iter().any(|n| n == c))
                .unwrap_or(false);
            if matches {
                taken.push(op);
            } else {
                kept.push(op);
            }
        }
        self.committed = kept;
        taken.reverse();
        taken
    }

    /// All committed entries, oldest first, as the next maintenance tool
    /// will inherit them.
    pub fn all(&self) -> impl Iterator<Item = &Operation> {
        self.committed.iter()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32(JOURNAL_FORMAT);
        w.put_u32(self.committed.len() as u32);
        for op in &self.committed {
            w.put_bytes(&op.encode());
        }
        w.into_bytes()
    }

    /// Persist to a standalone file, atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        utils::replace_file("journal", path, &self.encode())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = utils::read_bytes("journal", path)?;
        Self::from_encoded(&data)
    }
}

fn decode_operations(data: &[u8]) -> Result<Vec<Operation>> {
    let mut r = Reader::new(data);
    let format = r.get_u32()?;
    if format != JOURNAL_FORMAT {
        anyhow::bail!("unsupported journal format {format}");
    }
    let count = r.get_u32()?;
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ops.push(Operation::decode(r.get_bytes()?)?);
    }
    Ok(ops)
}
