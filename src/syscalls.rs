//! Syscall emulation over the per-session state.
//!
//! Each emulated call reads its arguments out of guest linear memory at
//! explicit byte offsets, writes results back the same way, and returns a
//! small integer status - never panicking, because the guest's own control
//! flow branches on that code. Anything the guest protocol has no code for
//! (a host write failure, above all) is latched as fatal and re-raised by
//! the orchestrator once the entry point returns.

use crate::abi::{self, Errno, Iovec, filetype, oflags, whence};
use crate::buffer::GrowableBuffer;
use crate::error::ShimError;
use crate::fd::{Descriptor, FdTable, resolve_path};
use crate::host::HostInterface;
use crate::memory::GuestMemory;
use crate::session::SessionOptions;
use crate::trace::SyscallTrace;

/// All state owned by one in-flight session: the descriptor table, the guest
/// memory handle, the host interface, and the diagnostics trace. Built fresh
/// for every `run` invocation; nothing survives it.
pub struct SessionState {
    memory: Option<GuestMemory>,
    table: FdTable,
    host: Box<dyn HostInterface>,
    trace: SyscallTrace,
    fatal: Option<ShimError>,
}

impl SessionState {
    pub fn new(host: Box<dyn HostInterface>, options: &SessionOptions) -> Self {
        Self {
            memory: None,
            table: FdTable::new(&options.root_prefix, &options.cwd_prefix, options.max_fds),
            host,
            trace: SyscallTrace::new(),
            fatal: None,
        }
    }

    /// Attach the guest's linear memory. On the browser target this happens
    /// after instantiation, so the field starts out empty.
    pub fn set_memory(&mut self, memory: GuestMemory) {
        self.memory = Some(memory);
    }

    /// Handle to the attached guest memory, if any.
    pub fn memory(&self) -> Option<GuestMemory> {
        self.memory.clone()
    }

    /// Take the latched fatal error, if a syscall hit one.
    pub fn take_fatal(&mut self) -> Option<ShimError> {
        self.fatal.take()
    }

    /// Number of currently open descriptors (the four fixed entries count).
    pub fn open_descriptors(&self) -> usize {
        self.table.open_count()
    }

    pub fn trace(&self) -> &SyscallTrace {
        &self.trace
    }

    /// One line per open descriptor, for the failure log.
    pub fn open_fd_summary(&self) -> Vec<String> {
        self.table
            .iter()
            .map(|(fd, entry)| format!("fd {}: {}", fd, entry.describe()))
            .collect()
    }

    /// Contents of a stream sink.
    pub fn sink_bytes(&self, fd: i32) -> Option<Vec<u8>> {
        match self.table.get(fd) {
            Some(Descriptor::Sink { buffer }) => Some(buffer.as_slice().to_vec()),
            _ => None,
        }
    }

    /// The stdout sink decoded as text.
    pub fn stdout_text(&self) -> String {
        self.sink_bytes(abi::fd::STDOUT)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    fn finish(&mut self, call: &'static str, fd: i32, errno: Errno) -> i32 {
        self.trace.record(call, fd, errno.code());
        errno.code()
    }

    // =========================================================================
    // Emulated syscalls
    // =========================================================================

    /// fd_close(fd) -> errno
    pub fn fd_close(&mut self, fd: i32) -> i32 {
        let errno = self.fd_close_inner(fd);
        self.finish("fd_close", fd, errno)
    }

    fn fd_close_inner(&mut self, fd: i32) -> Errno {
        // mounts and sinks stay open for the whole session
        let flush = match self.table.get(fd) {
            Some(Descriptor::Output { .. }) => true,
            Some(Descriptor::Input { .. }) => false,
            _ => return Errno::Badf,
        };

        if flush {
            if let Some(Descriptor::Output { path, buffer, .. }) = self.table.get(fd) {
                // one flush per close, trimmed to the logical size
                if let Err(err) = self.host.write(path, buffer.as_slice()) {
                    self.fatal = Some(ShimError::HostWrite {
                        path: path.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        let _ = self.table.free(fd);
        Errno::Success
    }

    /// fd_fdstat_get(fd, stat_ptr) -> errno
    pub fn fd_fdstat_get(&mut self, fd: i32, stat_ptr: u32) -> i32 {
        let errno = self.fd_fdstat_get_inner(fd, stat_ptr);
        self.finish("fd_fdstat_get", fd, errno)
    }

    fn fd_fdstat_get_inner(&mut self, fd: i32, stat_ptr: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let kind = match self.table.get(fd) {
            Some(Descriptor::Mount { .. }) => filetype::DIRECTORY,
            Some(_) => filetype::REGULAR_FILE,
            None => return Errno::Badf,
        };
        let mut stat = [0u8; abi::FDSTAT_SIZE];
        stat[0] = kind;
        memory.write(stat_ptr, &stat);
        Errno::Success
    }

    /// fd_fdstat_set_flags(fd, flags) -> errno; intentionally unsupported.
    pub fn fd_fdstat_set_flags(&mut self, fd: i32, _flags: i32) -> i32 {
        self.finish("fd_fdstat_set_flags", fd, Errno::Inval)
    }

    /// fd_prestat_get(fd, buf_ptr) -> errno
    pub fn fd_prestat_get(&mut self, fd: i32, buf_ptr: u32) -> i32 {
        let errno = self.fd_prestat_get_inner(fd, buf_ptr);
        self.finish("fd_prestat_get", fd, errno)
    }

    fn fd_prestat_get_inner(&mut self, fd: i32, buf_ptr: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let Some(Descriptor::Mount { prefix, .. }) = self.table.get(fd) else {
            return Errno::Badf;
        };
        // tag byte 0 = prestat_dir, name length at offset 4
        let mut buf = [0u8; abi::PRESTAT_SIZE];
        buf[abi::PRESTAT_NAME_LEN_OFFSET..abi::PRESTAT_NAME_LEN_OFFSET + 4]
            .copy_from_slice(&(prefix.len() as u32).to_le_bytes());
        memory.write(buf_ptr, &buf);
        Errno::Success
    }

    /// fd_prestat_dir_name(fd, path_ptr, path_len) -> errno
    pub fn fd_prestat_dir_name(&mut self, fd: i32, path_ptr: u32, path_len: u32) -> i32 {
        let errno = self.fd_prestat_dir_name_inner(fd, path_ptr, path_len);
        self.finish("fd_prestat_dir_name", fd, errno)
    }

    fn fd_prestat_dir_name_inner(&mut self, fd: i32, path_ptr: u32, path_len: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let Some(Descriptor::Mount { prefix, .. }) = self.table.get(fd) else {
            return Errno::Badf;
        };
        let n = (path_len as usize).min(prefix.len());
        memory.write(path_ptr, &prefix.as_bytes()[..n]);
        Errno::Success
    }

    /// path_open(parent, .., path_ptr, path_len, oflags, .., opened_fd_ptr) -> errno
    pub fn path_open(
        &mut self,
        parent: i32,
        path_ptr: u32,
        path_len: u32,
        open_flags: i32,
        opened_fd_ptr: u32,
    ) -> i32 {
        let errno = self.path_open_inner(parent, path_ptr, path_len, open_flags, opened_fd_ptr);
        self.finish("path_open", parent, errno)
    }

    fn path_open_inner(
        &mut self,
        parent: i32,
        path_ptr: u32,
        path_len: u32,
        open_flags: i32,
        opened_fd_ptr: u32,
    ) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let raw = memory.read_string(path_ptr, path_len);
        let path = match resolve_path(&self.table, parent, &raw) {
            Ok(path) => path,
            Err(errno) => return errno,
        };

        let entry = if open_flags & oflags::CREAT != 0 {
            Descriptor::Output {
                path,
                buffer: GrowableBuffer::new(),
                position: 0,
            }
        } else {
            match self.host.read(&path) {
                Some(bytes) => Descriptor::Input {
                    path,
                    bytes,
                    position: 0,
                },
                // nothing behind the path: no descriptor is allocated
                None => return Errno::Io,
            }
        };

        let Some(fd) = self.table.allocate(entry) else {
            return Errno::Io;
        };
        memory.write_u32(opened_fd_ptr, fd as u32);
        Errno::Success
    }

    /// path_filestat_get(parent, flags, path_ptr, path_len, buf_ptr) -> errno
    pub fn path_filestat_get(
        &mut self,
        parent: i32,
        _flags: i32,
        path_ptr: u32,
        path_len: u32,
        buf_ptr: u32,
    ) -> i32 {
        let errno = self.path_filestat_get_inner(parent, path_ptr, path_len, buf_ptr);
        self.finish("path_filestat_get", parent, errno)
    }

    fn path_filestat_get_inner(
        &mut self,
        parent: i32,
        path_ptr: u32,
        path_len: u32,
        buf_ptr: u32,
    ) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let raw = memory.read_string(path_ptr, path_len);
        if let Err(errno) = resolve_path(&self.table, parent, &raw) {
            return errno;
        }
        // only the kind byte is populated; every other field stays zero
        let mut stat = [0u8; abi::FILESTAT_SIZE];
        stat[abi::FILESTAT_FILETYPE_OFFSET] = if raw == "." {
            filetype::DIRECTORY
        } else {
            filetype::REGULAR_FILE
        };
        memory.write(buf_ptr, &stat);
        Errno::Success
    }

    /// path_remove_directory(parent, path_ptr, path_len) -> errno;
    /// intentionally unsupported.
    pub fn path_remove_directory(&mut self, parent: i32, _path_ptr: u32, _path_len: u32) -> i32 {
        self.finish("path_remove_directory", parent, Errno::Nosys)
    }

    /// fd_seek(fd, offset, whence, newpos_ptr) -> errno
    pub fn fd_seek(&mut self, fd: i32, offset: i64, whence_tag: i32, newpos_ptr: u32) -> i32 {
        let errno = self.fd_seek_inner(fd, offset, whence_tag, newpos_ptr);
        self.finish("fd_seek", fd, errno)
    }

    fn fd_seek_inner(&mut self, fd: i32, offset: i64, whence_tag: i32, newpos_ptr: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let Some(entry) = self.table.get_mut(fd) else {
            return Errno::Badf;
        };
        let (size, position) = match entry {
            Descriptor::Input {
                bytes, position, ..
            } => (bytes.len() as u64, position),
            Descriptor::Output {
                buffer, position, ..
            } => (buffer.len() as u64, position),
            _ => return Errno::Inval,
        };

        // offsets are unsigned on this ABI; a negative i64 lands out of range
        let target = match whence_tag {
            whence::SET => offset as u64,
            whence::CUR => match position.checked_add(offset as u64) {
                Some(target) => target,
                None => return Errno::Inval,
            },
            whence::END => size,
            _ => return Errno::Inval,
        };

        if target > size {
            return Errno::Inval;
        }
        *position = target;
        memory.write_u64(newpos_ptr, target);
        Errno::Success
    }

    /// fd_read(fd, iovs_ptr, iovs_len, nread_ptr) -> errno
    pub fn fd_read(&mut self, fd: i32, iovs_ptr: u32, iovs_len: u32, nread_ptr: u32) -> i32 {
        let errno = self.fd_read_inner(fd, iovs_ptr, iovs_len, nread_ptr);
        self.finish("fd_read", fd, errno)
    }

    fn fd_read_inner(&mut self, fd: i32, iovs_ptr: u32, iovs_len: u32, nread_ptr: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let Some(entry) = self.table.get_mut(fd) else {
            return Errno::Badf;
        };
        let total = match entry {
            Descriptor::Input {
                bytes, position, ..
            } => copy_out(&memory, iovs_ptr, iovs_len, bytes, position),
            Descriptor::Output {
                buffer, position, ..
            } => copy_out(&memory, iovs_ptr, iovs_len, buffer.as_slice(), position),
            _ => return Errno::Inval,
        };
        memory.write_u32(nread_ptr, total);
        Errno::Success
    }

    /// fd_write(fd, iovs_ptr, iovs_len, nwritten_ptr) -> errno
    pub fn fd_write(&mut self, fd: i32, iovs_ptr: u32, iovs_len: u32, nwritten_ptr: u32) -> i32 {
        let errno = self.fd_write_inner(fd, iovs_ptr, iovs_len, nwritten_ptr);
        self.finish("fd_write", fd, errno)
    }

    fn fd_write_inner(&mut self, fd: i32, iovs_ptr: u32, iovs_len: u32, nwritten_ptr: u32) -> Errno {
        let Some(memory) = self.memory.clone() else {
            return Errno::Io;
        };
        let Some(entry) = self.table.get_mut(fd) else {
            return Errno::Badf;
        };
        let total = match entry {
            Descriptor::Output {
                buffer, position, ..
            } => copy_in(&memory, iovs_ptr, iovs_len, buffer, position),
            Descriptor::Sink { buffer } => {
                // sink writes always append
                let mut end = buffer.len() as u64;
                copy_in(&memory, iovs_ptr, iovs_len, buffer, &mut end)
            }
            _ => return Errno::Inval,
        };
        memory.write_u32(nwritten_ptr, total);
        Errno::Success
    }
}

/// Decode iovec `index` of the array at `iovs_ptr`. An out-of-range record
/// decodes as a zero iovec, which every caller treats as a no-op.
fn read_iovec(memory: &GuestMemory, iovs_ptr: u32, index: u32) -> Iovec {
    let bytes = memory.read(iovs_ptr + index * abi::IOVEC_SIZE as u32, abi::IOVEC_SIZE as u32);
    if bytes.len() == abi::IOVEC_SIZE {
        bytemuck::pod_read_unaligned(&bytes)
    } else {
        Iovec { ptr: 0, len: 0 }
    }
}

/// Copy from `data` (bounded by its length) into guest memory, one iovec at
/// a time, advancing `position`. Returns the total bytes copied.
fn copy_out(
    memory: &GuestMemory,
    iovs_ptr: u32,
    iovs_len: u32,
    data: &[u8],
    position: &mut u64,
) -> u32 {
    let mut total = 0u32;
    for i in 0..iovs_len {
        let iov = read_iovec(memory, iovs_ptr, i);
        let available = (data.len() as u64).saturating_sub(*position);
        let n = u64::from(iov.len).min(available) as usize;
        if n > 0 {
            let start = *position as usize;
            memory.write(iov.ptr, &data[start..start + n]);
            *position += n as u64;
        }
        total += n as u32;
    }
    total
}

/// Copy from guest memory into `buffer` at `position`, one iovec at a time,
/// growing the buffer as needed. Returns the total bytes copied.
fn copy_in(
    memory: &GuestMemory,
    iovs_ptr: u32,
    iovs_len: u32,
    buffer: &mut GrowableBuffer,
    position: &mut u64,
) -> u32 {
    let mut total = 0u32;
    for i in 0..iovs_len {
        let iov = read_iovec(memory, iovs_ptr, i);
        if iov.len == 0 {
            continue;
        }
        let data = memory.read(iov.ptr, iov.len);
        buffer.write(*position as usize, &data);
        *position += data.len() as u64;
        total += data.len() as u32;
    }
    total
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::abi::fd;
    use crate::host::MemoryHost;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    const MEM_SIZE: usize = 65536;

    fn state_with_host(host: MemoryHost) -> (SessionState, GuestMemory) {
        let memory = GuestMemory::new(MEM_SIZE);
        let mut state = SessionState::new(Box::new(host), &SessionOptions::default());
        state.set_memory(memory.clone());
        (state, memory)
    }

    fn fresh_state() -> (SessionState, GuestMemory) {
        state_with_host(MemoryHost::new())
    }

    /// Write `data` and a single iovec describing it into guest memory.
    /// Returns (iovs_ptr, result_ptr).
    fn stage_iovec(memory: &GuestMemory, at: u32, data: &[u8]) -> (u32, u32) {
        memory.write(at, data);
        let iovs_ptr = at + data.len() as u32;
        memory.write_u32(iovs_ptr, at);
        memory.write_u32(iovs_ptr + 4, data.len() as u32);
        (iovs_ptr, iovs_ptr + 8)
    }

    /// Stage a path string for path_open-style calls. Returns (ptr, len).
    fn stage_path(memory: &GuestMemory, at: u32, path: &str) -> (u32, u32) {
        memory.write(at, path.as_bytes());
        (at, path.len() as u32)
    }

    fn read_u32(memory: &GuestMemory, at: u32) -> u32 {
        let bytes = memory.read(at, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn read_u64(memory: &GuestMemory, at: u32) -> u64 {
        let bytes = memory.read(at, 8);
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    // -------------------------------------------------------------------------
    // fd_write
    // -------------------------------------------------------------------------

    #[test]
    fn write_to_stdout_accumulates() {
        let (mut state, memory) = fresh_state();
        let (iovs, result) = stage_iovec(&memory, 1024, b"hello ");
        assert_eq!(state.fd_write(fd::STDOUT, iovs, 1, result), 0);
        assert_eq!(read_u32(&memory, result), 6);

        let (iovs, result) = stage_iovec(&memory, 2048, b"world");
        assert_eq!(state.fd_write(fd::STDOUT, iovs, 1, result), 0);

        assert_eq!(state.stdout_text(), "hello world");
    }

    #[test]
    fn write_gathers_iovecs_in_order() {
        let (mut state, memory) = fresh_state();
        memory.write(100, b"foo");
        memory.write(200, b"bar");
        // two iovecs at 1024
        memory.write_u32(1024, 100);
        memory.write_u32(1028, 3);
        memory.write_u32(1032, 200);
        memory.write_u32(1036, 3);

        assert_eq!(state.fd_write(fd::STDERR, 1024, 2, 2000), 0);
        assert_eq!(read_u32(&memory, 2000), 6);
        assert_eq!(state.sink_bytes(fd::STDERR).unwrap(), b"foobar");
    }

    #[test]
    fn zero_length_iovec_is_a_noop() {
        let (mut state, memory) = fresh_state();
        memory.write_u32(1024, 0);
        memory.write_u32(1028, 0);
        assert_eq!(state.fd_write(fd::STDOUT, 1024, 1, 2000), 0);
        assert_eq!(read_u32(&memory, 2000), 0);
        assert_eq!(state.stdout_text(), "");
    }

    #[test]
    fn write_to_unknown_fd_is_ebadf() {
        let (mut state, memory) = fresh_state();
        let (iovs, result) = stage_iovec(&memory, 1024, b"x");
        assert_eq!(state.fd_write(99, iovs, 1, result), Errno::Badf.code());
        assert_eq!(state.fd_write(0, iovs, 1, result), Errno::Badf.code());
    }

    #[test]
    fn write_to_mount_or_input_is_einval() {
        let mut host = MemoryHost::new();
        host.insert("/data", b"abc".to_vec());
        let (mut state, memory) = state_with_host(host);

        let (path_ptr, path_len) = stage_path(&memory, 100, "data");
        assert_eq!(state.path_open(fd::ROOT, path_ptr, path_len, 0, 200), 0);
        let input_fd = read_u32(&memory, 200) as i32;

        let (iovs, result) = stage_iovec(&memory, 1024, b"x");
        assert_eq!(state.fd_write(fd::ROOT, iovs, 1, result), Errno::Inval.code());
        assert_eq!(state.fd_write(input_fd, iovs, 1, result), Errno::Inval.code());
    }

    // -------------------------------------------------------------------------
    // path_open / fd_read
    // -------------------------------------------------------------------------

    #[test]
    fn open_for_read_pulls_contents_from_host() {
        let mut host = MemoryHost::new();
        host.insert("/scene.gltf", (0u8..10).collect());
        let (mut state, memory) = state_with_host(host);

        let (path_ptr, path_len) = stage_path(&memory, 100, "scene.gltf");
        assert_eq!(state.path_open(fd::ROOT, path_ptr, path_len, 0, 200), 0);
        // lowest unused fd: slot 0 is free at session start
        assert_eq!(read_u32(&memory, 200), 0);

        memory.write_u32(1024, 4096);
        memory.write_u32(1028, 10);
        assert_eq!(state.fd_read(0, 1024, 1, 2000), 0);
        assert_eq!(read_u32(&memory, 2000), 10);
        assert_eq!(memory.read(4096, 10), (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn open_missing_path_reports_eio_without_allocating() {
        let (mut state, memory) = fresh_state();
        let before = state.open_descriptors();

        let (path_ptr, path_len) = stage_path(&memory, 100, "nope.bin");
        assert_eq!(
            state.path_open(fd::ROOT, path_ptr, path_len, 0, 200),
            Errno::Io.code()
        );
        assert_eq!(state.open_descriptors(), before);
    }

    #[test]
    fn open_with_non_mount_parent_is_ebadf() {
        let (mut state, memory) = fresh_state();
        let (path_ptr, path_len) = stage_path(&memory, 100, "x");
        assert_eq!(
            state.path_open(fd::STDOUT, path_ptr, path_len, 0, 200),
            Errno::Badf.code()
        );
    }

    #[test]
    fn read_stops_at_end_of_contents() {
        let mut host = MemoryHost::new();
        host.insert("./short", b"abc".to_vec());
        let (mut state, memory) = state_with_host(host);

        let (path_ptr, path_len) = stage_path(&memory, 100, "short");
        assert_eq!(state.path_open(fd::CWD, path_ptr, path_len, 0, 200), 0);
        let file_fd = read_u32(&memory, 200) as i32;

        memory.write_u32(1024, 4096);
        memory.write_u32(1028, 100);
        assert_eq!(state.fd_read(file_fd, 1024, 1, 2000), 0);
        assert_eq!(read_u32(&memory, 2000), 3);

        // position is at the end now; the next read returns zero bytes
        assert_eq!(state.fd_read(file_fd, 1024, 1, 2000), 0);
        assert_eq!(read_u32(&memory, 2000), 0);
    }

    #[test]
    fn read_from_sink_is_einval() {
        let (mut state, memory) = fresh_state();
        memory.write_u32(1024, 4096);
        memory.write_u32(1028, 4);
        assert_eq!(state.fd_read(fd::STDOUT, 1024, 1, 2000), Errno::Inval.code());
        assert_eq!(state.fd_read(42, 1024, 1, 2000), Errno::Badf.code());
    }

    // -------------------------------------------------------------------------
    // fd_close
    // -------------------------------------------------------------------------

    #[test]
    fn close_output_flushes_logical_size_exactly_once() {
        let host = Rc::new(RefCell::new(MemoryHost::new()));
        let memory = GuestMemory::new(MEM_SIZE);
        let mut state = SessionState::new(
            Box::new(Rc::clone(&host)),
            &SessionOptions::default(),
        );
        state.set_memory(memory.clone());

        let (path_ptr, path_len) = stage_path(&memory, 100, "out.bin");
        assert_eq!(
            state.path_open(fd::CWD, path_ptr, path_len, oflags::CREAT, 200),
            0
        );
        let out_fd = read_u32(&memory, 200) as i32;

        let (iovs, result) = stage_iovec(&memory, 1024, &[1u8; 600]);
        assert_eq!(state.fd_write(out_fd, iovs, 1, result), 0);
        let (iovs, result) = stage_iovec(&memory, 4096, &[2u8; 400]);
        assert_eq!(state.fd_write(out_fd, iovs, 1, result), 0);

        assert_eq!(state.fd_close(out_fd), 0);

        let host = host.borrow();
        assert_eq!(host.write_log(), &["./out.bin".to_string()]);
        let written = host.get("./out.bin").unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(&written[..600], &[1u8; 600][..]);
        assert_eq!(&written[600..], &[2u8; 400][..]);
    }

    #[test]
    fn close_frees_the_slot_for_reuse() {
        let mut host = MemoryHost::new();
        host.insert("/a", vec![1]);
        host.insert("/b", vec![2]);
        host.insert("/c", vec![3]);
        let (mut state, memory) = state_with_host(host);

        let (ptr_a, len_a) = stage_path(&memory, 100, "a");
        let (ptr_b, len_b) = stage_path(&memory, 120, "b");
        let (ptr_c, len_c) = stage_path(&memory, 140, "c");

        assert_eq!(state.path_open(fd::ROOT, ptr_a, len_a, 0, 200), 0);
        assert_eq!(read_u32(&memory, 200), 0);
        assert_eq!(state.path_open(fd::ROOT, ptr_b, len_b, 0, 200), 0);
        assert_eq!(read_u32(&memory, 200), 5);

        assert_eq!(state.fd_close(0), 0);
        assert_eq!(state.path_open(fd::ROOT, ptr_c, len_c, 0, 200), 0);
        assert_eq!(read_u32(&memory, 200), 0);
    }

    #[test]
    fn close_rejects_unknown_mounts_and_sinks() {
        let (mut state, _memory) = fresh_state();
        assert_eq!(state.fd_close(99), Errno::Badf.code());
        assert_eq!(state.fd_close(fd::ROOT), Errno::Badf.code());
        assert_eq!(state.fd_close(fd::STDOUT), Errno::Badf.code());
        assert_eq!(state.open_descriptors(), 4);
    }

    struct RejectingHost;

    impl HostInterface for RejectingHost {
        fn read(&mut self, _path: &str) -> Option<Vec<u8>> {
            None
        }
        fn write(&mut self, _path: &str, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn host_write_failure_is_latched_as_fatal() {
        let memory = GuestMemory::new(MEM_SIZE);
        let mut state = SessionState::new(Box::new(RejectingHost), &SessionOptions::default());
        state.set_memory(memory.clone());

        let (path_ptr, path_len) = stage_path(&memory, 100, "out.bin");
        assert_eq!(
            state.path_open(fd::CWD, path_ptr, path_len, oflags::CREAT, 200),
            0
        );
        let out_fd = read_u32(&memory, 200) as i32;
        state.fd_close(out_fd);

        match state.take_fatal() {
            Some(ShimError::HostWrite { path, message }) => {
                assert_eq!(path, "./out.bin");
                assert!(message.contains("disk full"));
            }
            other => panic!("expected latched HostWrite, got {:?}", other),
        }
    }

    // -------------------------------------------------------------------------
    // fd_seek
    // -------------------------------------------------------------------------

    fn open_input(state: &mut SessionState, memory: &GuestMemory, name: &str) -> i32 {
        let (path_ptr, path_len) = stage_path(memory, 100, name);
        assert_eq!(state.path_open(fd::ROOT, path_ptr, path_len, 0, 200), 0);
        read_u32(memory, 200) as i32
    }

    #[test]
    fn seek_set_and_cur() {
        let mut host = MemoryHost::new();
        host.insert("/f", vec![0u8; 10]);
        let (mut state, memory) = state_with_host(host);
        let file_fd = open_input(&mut state, &memory, "f");

        assert_eq!(state.fd_seek(file_fd, 4, whence::SET, 2000), 0);
        assert_eq!(read_u64(&memory, 2000), 4);

        assert_eq!(state.fd_seek(file_fd, 3, whence::CUR, 2000), 0);
        assert_eq!(read_u64(&memory, 2000), 7);
    }

    #[test]
    fn seek_end_tracks_current_size() {
        let (mut state, memory) = fresh_state();
        let (path_ptr, path_len) = stage_path(&memory, 100, "out");
        assert_eq!(
            state.path_open(fd::CWD, path_ptr, path_len, oflags::CREAT, 200),
            0
        );
        let out_fd = read_u32(&memory, 200) as i32;

        assert_eq!(state.fd_seek(out_fd, 0, whence::END, 2000), 0);
        assert_eq!(read_u64(&memory, 2000), 0);

        let (iovs, result) = stage_iovec(&memory, 1024, &[7u8; 123]);
        assert_eq!(state.fd_write(out_fd, iovs, 1, result), 0);

        assert_eq!(state.fd_seek(out_fd, 0, whence::END, 2000), 0);
        assert_eq!(read_u64(&memory, 2000), 123);
    }

    #[test]
    fn seek_past_size_is_einval_and_mutates_nothing() {
        let mut host = MemoryHost::new();
        host.insert("/f", vec![0u8; 10]);
        let (mut state, memory) = state_with_host(host);
        let file_fd = open_input(&mut state, &memory, "f");

        assert_eq!(state.fd_seek(file_fd, 4, whence::SET, 2000), 0);
        assert_eq!(
            state.fd_seek(file_fd, 11, whence::SET, 2000),
            Errno::Inval.code()
        );
        // negative offsets are out of range too (unsigned ABI)
        assert_eq!(
            state.fd_seek(file_fd, -1, whence::SET, 2000),
            Errno::Inval.code()
        );

        // position is still 4
        assert_eq!(state.fd_seek(file_fd, 0, whence::CUR, 2000), 0);
        assert_eq!(read_u64(&memory, 2000), 4);
    }

    #[test]
    fn seek_on_sink_or_unknown_fd_fails() {
        let (mut state, _memory) = fresh_state();
        assert_eq!(
            state.fd_seek(fd::STDOUT, 0, whence::SET, 2000),
            Errno::Inval.code()
        );
        assert_eq!(state.fd_seek(9, 0, whence::SET, 2000), Errno::Badf.code());
    }

    // -------------------------------------------------------------------------
    // stat family
    // -------------------------------------------------------------------------

    #[test]
    fn fdstat_tags_mounts_as_directories() {
        let (mut state, memory) = fresh_state();
        assert_eq!(state.fd_fdstat_get(fd::ROOT, 3000), 0);
        assert_eq!(memory.read(3000, 1)[0], filetype::DIRECTORY);

        assert_eq!(state.fd_fdstat_get(fd::STDOUT, 3000), 0);
        assert_eq!(memory.read(3000, 1)[0], filetype::REGULAR_FILE);

        assert_eq!(state.fd_fdstat_get(42, 3000), Errno::Badf.code());
    }

    #[test]
    fn filestat_kind_follows_the_dot_path() {
        let (mut state, memory) = fresh_state();
        // fill the record area with junk first; the call must zero it
        memory.write(3000, &[0xFFu8; abi::FILESTAT_SIZE]);

        let (path_ptr, path_len) = stage_path(&memory, 100, ".");
        assert_eq!(state.path_filestat_get(fd::CWD, 0, path_ptr, path_len, 3000), 0);
        let record = memory.read(3000, abi::FILESTAT_SIZE as u32);
        assert_eq!(record[abi::FILESTAT_FILETYPE_OFFSET], filetype::DIRECTORY);
        for (i, byte) in record.iter().enumerate() {
            if i != abi::FILESTAT_FILETYPE_OFFSET {
                assert_eq!(*byte, 0, "byte {} should be zero", i);
            }
        }

        let (path_ptr, path_len) = stage_path(&memory, 100, "scene.gltf");
        assert_eq!(state.path_filestat_get(fd::ROOT, 0, path_ptr, path_len, 3000), 0);
        assert_eq!(
            memory.read(3000, abi::FILESTAT_SIZE as u32)[abi::FILESTAT_FILETYPE_OFFSET],
            filetype::REGULAR_FILE
        );
    }

    #[test]
    fn prestat_exposes_mount_names() {
        let (mut state, memory) = fresh_state();

        assert_eq!(state.fd_prestat_get(fd::ROOT, 3000), 0);
        let record = memory.read(3000, abi::PRESTAT_SIZE as u32);
        assert_eq!(record[0], 0); // prestat_dir tag
        assert_eq!(read_u32(&memory, 3000 + 4), 1); // "/" is one byte

        assert_eq!(state.fd_prestat_dir_name(fd::ROOT, 3100, 1), 0);
        assert_eq!(memory.read(3100, 1), b"/");

        assert_eq!(state.fd_prestat_get(fd::CWD, 3000), 0);
        assert_eq!(read_u32(&memory, 3000 + 4), 2); // "./"
        assert_eq!(state.fd_prestat_dir_name(fd::CWD, 3100, 2), 0);
        assert_eq!(memory.read(3100, 2), b"./");

        assert_eq!(state.fd_prestat_get(fd::STDOUT, 3000), Errno::Badf.code());
        assert_eq!(state.fd_prestat_get(0, 3000), Errno::Badf.code());
    }

    // -------------------------------------------------------------------------
    // stubs and trace
    // -------------------------------------------------------------------------

    #[test]
    fn unsupported_calls_return_their_fixed_codes() {
        let (mut state, _memory) = fresh_state();
        assert_eq!(state.path_remove_directory(fd::ROOT, 0, 0), Errno::Nosys.code());
        assert_eq!(state.fd_fdstat_set_flags(fd::STDOUT, 1), Errno::Inval.code());
    }

    #[test]
    fn every_call_lands_in_the_trace() {
        let (mut state, memory) = fresh_state();
        let (iovs, result) = stage_iovec(&memory, 1024, b"x");
        state.fd_write(fd::STDOUT, iovs, 1, result);
        state.fd_close(77);

        let calls: Vec<_> = state.trace().iter().map(|e| (e.call, e.code)).collect();
        assert_eq!(
            calls,
            vec![("fd_write", 0), ("fd_close", Errno::Badf.code())]
        );
    }

    #[test]
    fn fd_summary_lists_open_entries() {
        let mut host = MemoryHost::new();
        host.insert("/a", vec![1, 2, 3]);
        let (mut state, memory) = state_with_host(host);
        open_input(&mut state, &memory, "a");

        let summary = state.open_fd_summary();
        assert_eq!(summary.len(), 5);
        assert!(summary.iter().any(|line| line.contains("mount root")));
        assert!(summary.iter().any(|line| line.contains("input \"/a\"")));
    }
}
