//! ABI types and constants shared between the shim and its guests.
//!
//! This is the stable surface: error numbers, record layouts, export names.
//! Everything here is expressed in explicit byte offsets because the guest
//! reads and writes these records in its own linear memory.

use bytemuck::{Pod, Zeroable};

/// Import module namespace the guest links its syscalls against.
pub const IMPORT_NAMESPACE: &str = "wasi_snapshot_preview1";

/// Required export names
pub mod exports {
    /// The linear memory export name
    pub const MEMORY: &str = "memory";
    /// The main entry point
    pub const MAIN: &str = "main";
    /// Guest-owned allocator, used for the argv region
    pub const MALLOC: &str = "malloc";
    /// Releases a region handed out by `malloc`
    pub const FREE: &str = "free";
}

/// Pre-assigned descriptor slots
pub mod fd {
    pub const STDOUT: i32 = 1;
    pub const STDERR: i32 = 2;
    pub const ROOT: i32 = 3;
    pub const CWD: i32 = 4;
}

/// `fd_seek` origin selectors
pub mod whence {
    pub const SET: i32 = 0;
    pub const CUR: i32 = 1;
    pub const END: i32 = 2;
}

/// Descriptor-kind tags written into fdstat/filestat records
pub mod filetype {
    pub const DIRECTORY: u8 = 3;
    pub const REGULAR_FILE: u8 = 4;
}

/// `path_open` open-flag bits
pub mod oflags {
    /// Create the file; the shim treats this as "open for writing".
    pub const CREAT: i32 = 1;
}

/// Size of the record written by `fd_fdstat_get`
pub const FDSTAT_SIZE: usize = 24;
/// Size of the record written by `fd_prestat_get`
pub const PRESTAT_SIZE: usize = 8;
/// Offset of the mount-name length inside a prestat record
pub const PRESTAT_NAME_LEN_OFFSET: usize = 4;
/// Size of the record written by `path_filestat_get`
pub const FILESTAT_SIZE: usize = 64;
/// Offset of the kind byte inside a filestat record
pub const FILESTAT_FILETYPE_OFFSET: usize = 16;
/// Size of one iovec record in guest memory
pub const IOVEC_SIZE: usize = 8;

/// Guest-visible error numbers (WASI preview1 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// No error.
    Success = 0,
    /// Bad file descriptor.
    Badf = 8,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// Function not supported.
    Nosys = 52,
}

impl Errno {
    /// The raw value returned to the guest.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Errno::Success => write!(f, "success"),
            Errno::Badf => write!(f, "bad file descriptor"),
            Errno::Inval => write!(f, "invalid argument"),
            Errno::Io => write!(f, "I/O error"),
            Errno::Nosys => write!(f, "function not supported"),
        }
    }
}

/// One scatter/gather element, as laid out in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Iovec {
    /// Guest address of the buffer
    pub ptr: u32,
    /// Buffer length in bytes
    pub len: u32,
}

/// Argv region layout
///
/// The entry point receives its arguments as a pointer table followed by the
/// NUL-terminated strings, packed into a single guest-allocated region. The
/// table sits at the region base (that base IS the argv value); every table
/// entry points past the table into the string area.
#[derive(Debug)]
pub struct ArgvLayout {
    /// Offset of each string from the region base
    string_offsets: Vec<usize>,
    /// Bytes occupied by the pointer table
    table_size: usize,
    /// Bytes occupied by the strings, terminators included
    strings_size: usize,
}

impl ArgvLayout {
    /// Guest pointers are 32-bit.
    pub const POINTER_SIZE: usize = 4;

    /// Calculate the layout for the given arguments.
    pub fn new(args: &[&str]) -> Self {
        let table_size = args.len() * Self::POINTER_SIZE;
        let mut offset = table_size;
        let mut string_offsets = Vec::with_capacity(args.len());

        for arg in args {
            string_offsets.push(offset);
            offset += arg.len() + 1; // +1 for the NUL terminator
        }

        Self {
            string_offsets,
            table_size,
            strings_size: offset - table_size,
        }
    }

    /// Total bytes the region needs.
    pub fn total_size(&self) -> usize {
        self.table_size + self.strings_size
    }

    /// Offset of argument `i`'s string from the region base.
    pub fn string_offset(&self, i: usize) -> usize {
        self.string_offsets[i]
    }

    /// Fill `buf` with the pointer table and the strings.
    ///
    /// `base` is the guest address the region will land at; table entries are
    /// absolute guest pointers. Returns the argv value for the entry point
    /// (the region base itself).
    pub fn write_to(&self, args: &[&str], base: u32, buf: &mut [u8]) -> u32 {
        assert!(buf.len() >= self.total_size());

        for (i, arg) in args.iter().enumerate() {
            let at = self.string_offsets[i];
            buf[at..at + arg.len()].copy_from_slice(arg.as_bytes());
            buf[at + arg.len()] = 0;

            let ptr = base + at as u32;
            let cell = i * Self::POINTER_SIZE;
            buf[cell..cell + Self::POINTER_SIZE].copy_from_slice(&ptr.to_le_bytes());
        }

        base
    }
}
