//! Descriptor table: typed entries behind small integer handles.
//!
//! One tagged variant per descriptor kind, checked at the lookup boundary.
//! Allocation hands out the lowest unused fd and reuses slots after a close.

use crate::abi::Errno;
use crate::buffer::GrowableBuffer;

/// One open entry in the descriptor table.
pub enum Descriptor {
    /// Fixed virtual root exposing a path-prefix namespace; lives for the
    /// whole session and is only ever a parent for `path_open`.
    Mount { label: &'static str, prefix: String },

    /// stdout/stderr capture; writes append, the orchestrator drains the
    /// final bytes directly at session end.
    Sink { buffer: GrowableBuffer },

    /// Opened for reading; contents fetched from the host once at open time
    /// and immutable afterwards.
    Input {
        path: String,
        bytes: Vec<u8>,
        position: u64,
    },

    /// Opened for writing; flushed to the host exactly once on close.
    Output {
        path: String,
        buffer: GrowableBuffer,
        position: u64,
    },
}

impl Descriptor {
    /// Logical size of the entry's contents.
    pub fn size(&self) -> u64 {
        match self {
            Descriptor::Mount { .. } => 0,
            Descriptor::Sink { buffer } => buffer.len() as u64,
            Descriptor::Input { bytes, .. } => bytes.len() as u64,
            Descriptor::Output { buffer, .. } => buffer.len() as u64,
        }
    }

    /// One-line description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Descriptor::Mount { label, prefix } => format!("mount {} -> {:?}", label, prefix),
            Descriptor::Sink { buffer } => format!("sink ({} bytes)", buffer.len()),
            Descriptor::Input {
                path,
                bytes,
                position,
            } => format!("input {:?} ({} bytes, pos {})", path, bytes.len(), position),
            Descriptor::Output {
                path,
                buffer,
                position,
            } => format!("output {:?} ({} bytes, pos {})", path, buffer.len(), position),
        }
    }
}

/// Registry mapping fds to descriptor entries.
pub struct FdTable {
    /// `Some` for open entries, `None` for free slots
    entries: Vec<Option<Descriptor>>,
    max: usize,
}

impl FdTable {
    /// Default cap on simultaneously open descriptors.
    pub const DEFAULT_MAX: usize = 64;

    /// Fresh table with the four fixed entries: stdout and stderr sinks on
    /// fds 1 and 2, the root and cwd mounts on fds 3 and 4. Slot 0 starts
    /// free, so the first allocation receives fd 0.
    pub fn new(root_prefix: &str, cwd_prefix: &str, max: usize) -> Self {
        let entries = vec![
            None,
            Some(Descriptor::Sink {
                buffer: GrowableBuffer::new(),
            }),
            Some(Descriptor::Sink {
                buffer: GrowableBuffer::new(),
            }),
            Some(Descriptor::Mount {
                label: "root",
                prefix: root_prefix.to_string(),
            }),
            Some(Descriptor::Mount {
                label: "cwd",
                prefix: cwd_prefix.to_string(),
            }),
        ];
        Self { entries, max }
    }

    /// Store `entry` under the smallest unused fd. `None` when the table is
    /// at its cap.
    pub fn allocate(&mut self, entry: Descriptor) -> Option<i32> {
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Some(i as i32);
            }
        }
        if self.entries.len() < self.max {
            self.entries.push(Some(entry));
            return Some((self.entries.len() - 1) as i32);
        }
        None
    }

    pub fn get(&self, fd: i32) -> Option<&Descriptor> {
        if fd < 0 {
            return None;
        }
        self.entries.get(fd as usize).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut Descriptor> {
        if fd < 0 {
            return None;
        }
        self.entries.get_mut(fd as usize).and_then(|e| e.as_mut())
    }

    /// Remove and return the entry. Any flush side-effect is the caller's
    /// responsibility, before the slot is freed.
    pub fn free(&mut self, fd: i32) -> Option<Descriptor> {
        if fd < 0 {
            return None;
        }
        self.entries.get_mut(fd as usize).and_then(|e| e.take())
    }

    /// Number of currently open entries.
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// (fd, entry) pairs for every open slot.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &Descriptor)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|d| (i as i32, d)))
    }
}

/// Join a mount's path prefix with a path requested by the guest.
///
/// The parent fd must resolve to a mount; anything else is the guest handing
/// us a descriptor that cannot act as a directory.
pub fn resolve_path(table: &FdTable, parent: i32, path: &str) -> Result<String, Errno> {
    match table.get(parent) {
        Some(Descriptor::Mount { prefix, .. }) => Ok(format!("{}{}", prefix, path)),
        _ => Err(Errno::Badf),
    }
}
