//! The host interface: the two operations the embedder supplies.
//!
//! Everything the guest reads or writes ultimately lands here. The embedder
//! decides what a path means - a real filesystem, a browser download, an
//! in-memory map - and the shim never looks behind the trait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

/// Virtual file interface consumed by the shim.
pub trait HostInterface {
    /// Full contents addressed by `path`, or `None` if unavailable.
    fn read(&mut self, path: &str) -> Option<Vec<u8>>;

    /// Persist `data` at `path`. A failure here aborts the whole session;
    /// the guest protocol has no code path to recover from it.
    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()>;
}

/// HashMap-backed host, for tests and self-contained embedders.
///
/// Keeps a log of write targets so callers can check how often (and with
/// what) the shim flushed.
pub struct MemoryHost {
    files: HashMap<String, Vec<u8>>,
    write_log: Vec<String>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            write_log: Vec::new(),
        }
    }

    /// Pre-populate a path, as if it already existed on the host side.
    pub fn insert(&mut self, path: &str, bytes: Vec<u8>) {
        self.files.insert(path.to_string(), bytes);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|b| b.as_slice())
    }

    /// Paths written so far, one entry per host `write` call.
    pub fn write_log(&self) -> &[String] {
        &self.write_log
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostInterface for MemoryHost {
    fn read(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        self.write_log.push(path.to_string());
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

/// Shared handle delegating to an inner host, so callers can keep a view of
/// the host's state after the session has consumed the boxed interface.
impl HostInterface for Rc<RefCell<MemoryHost>> {
    fn read(&mut self, path: &str) -> Option<Vec<u8>> {
        self.borrow_mut().read(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        self.borrow_mut().write(path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_path_is_none() {
        let mut host = MemoryHost::new();
        assert_eq!(host.read("/nope"), None);
    }

    #[test]
    fn write_then_read_back() {
        let mut host = MemoryHost::new();
        host.write("/out.bin", b"data").unwrap();
        assert_eq!(host.read("/out.bin"), Some(b"data".to_vec()));
        assert_eq!(host.write_log(), &["/out.bin".to_string()]);
    }

    #[test]
    fn shared_handle_sees_inner_state() {
        let host = Rc::new(RefCell::new(MemoryHost::new()));
        let mut handle = Rc::clone(&host);
        handle.write("/a", b"x").unwrap();
        assert_eq!(host.borrow().get("/a"), Some(&b"x"[..]));
    }
}
