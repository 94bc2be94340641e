use crate::merkle::{fold_siblings, word_hash, Hash, LOG2_ROOT_SIZE, LOG2_WORD_SIZE};
use crate::MachineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

/// One recorded access against the Merkle-addressed state.
///
/// Word accesses (log2_size == 3) carry the value in the clear; the uarch
/// reset access covers a whole subtree and speaks only in hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub kind: AccessKind,
    pub address: u64,
    pub log2_size: u32,
    pub value_before: u64,
    pub value_after: Option<u64>,
    pub hash_before: Hash,
    pub hash_after: Option<Hash>,
    /// Present when the log was recorded with proofs; ordered from the
    /// access level up to level 63.
    pub sibling_hashes: Option<Vec<Hash>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogType {
    pub proofs: bool,
    pub annotations: bool,
}

impl LogType {
    pub fn with_proofs() -> Self {
        LogType { proofs: true, annotations: false }
    }
}

/// Ordered record of the state accesses performed by one uarch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLog {
    pub log_type: LogType,
    pub accesses: Vec<Access>,
    /// One human-readable note per access when annotations were requested.
    pub notes: Vec<String>,
}

impl AccessLog {
    pub fn new(log_type: LogType) -> Self {
        AccessLog { log_type, accesses: Vec::new(), notes: Vec::new() }
    }

    pub fn push(&mut self, access: Access, note: &str) {
        if self.log_type.annotations {
            self.notes.push(note.to_string());
        }
        self.accesses.push(access);
    }
}

/// Replay cursor over an access log.
///
/// Feeds recorded values back to the uarch interpreter while checking every
/// claim against the evolving root: reads must prove their value against the
/// current root, writes fold the new value into the next root. Divergence at
/// any point fails with the access index.
pub struct Replay<'a> {
    log: &'a AccessLog,
    next: usize,
    root: Hash,
}

impl<'a> Replay<'a> {
    pub fn new(log: &'a AccessLog, root_before: Hash) -> Result<Self, MachineError> {
        if !log.log_type.proofs {
            return Err(MachineError::verification("access log was recorded without proofs"));
        }
        Ok(Replay { log, next: 0, root: root_before })
    }

    fn take(&mut self, kind: AccessKind, address: u64) -> Result<(usize, &'a Access), MachineError> {
        let index = self.next;
        let log: &'a AccessLog = self.log;
        let access = log.accesses.get(index).ok_or_else(|| {
            MachineError::verification(format!(
                "access log ends early: expected {:?} of {:#x} at index {}",
                kind, address, index
            ))
        })?;
        self.next += 1;
        if access.kind != kind || access.address != address {
            return Err(MachineError::verification(format!(
                "access {} mismatch: log has {:?} of {:#x}, replay expects {:?} of {:#x}",
                index, access.kind, access.address, kind, address
            )));
        }
        if access.log2_size != LOG2_WORD_SIZE {
            return Err(MachineError::verification(format!(
                "access {} has log2_size {}, expected {}",
                index, access.log2_size, LOG2_WORD_SIZE
            )));
        }
        Ok((index, access))
    }

    fn check_before(&self, index: usize, access: &Access) -> Result<(), MachineError> {
        if word_hash(access.value_before) != access.hash_before {
            return Err(MachineError::verification(format!(
                "access {}: value_before does not match hash_before",
                index
            )));
        }
        let siblings = access.sibling_hashes.as_ref().ok_or_else(|| {
            MachineError::verification(format!("access {} carries no sibling hashes", index))
        })?;
        if siblings.len() as u32 != LOG2_ROOT_SIZE - LOG2_WORD_SIZE {
            return Err(MachineError::verification(format!(
                "access {}: wrong sibling count {}",
                index,
                siblings.len()
            )));
        }
        let folded = fold_siblings(access.address, LOG2_WORD_SIZE, &access.hash_before, siblings);
        if folded != self.root {
            return Err(MachineError::verification(format!(
                "access {}: proof does not match current root",
                index
            )));
        }
        Ok(())
    }

    pub fn read_word(&mut self, address: u64) -> Result<u64, MachineError> {
        let (index, access) = self.take(AccessKind::Read, address)?;
        self.check_before(index, access)?;
        Ok(access.value_before)
    }

    pub fn write_word(&mut self, address: u64, value: u64) -> Result<(), MachineError> {
        let (index, access) = self.take(AccessKind::Write, address)?;
        self.check_before(index, access)?;
        if access.value_after != Some(value) {
            return Err(MachineError::verification(format!(
                "access {}: logged written value {:?} differs from replayed value {:#x}",
                index, access.value_after, value
            )));
        }
        let hash_after = word_hash(value);
        if let Some(logged) = access.hash_after {
            if logged != hash_after {
                return Err(MachineError::verification(format!(
                    "access {}: hash_after does not match written value",
                    index
                )));
            }
        }
        let siblings = access.sibling_hashes.as_ref().expect("checked in check_before");
        self.root = fold_siblings(access.address, LOG2_WORD_SIZE, &hash_after, siblings);
        Ok(())
    }

    /// Final root after all accesses; fails if the log has extra entries.
    pub fn finish(self) -> Result<Hash, MachineError> {
        if self.next != self.log.accesses.len() {
            return Err(MachineError::verification(format!(
                "access log has {} unconsumed accesses",
                self.log.accesses.len() - self.next
            )));
        }
        Ok(self.root)
    }
}
