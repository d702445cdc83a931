//! wasishim - a minimal syscall emulation layer for sandboxed WASM tools
//!
//! A guest module compiled against a POSIX-like (WASI preview1 style) ABI
//! performs file I/O as if it were talking to a real operating system, while
//! every actual byte is redirected to two callbacks supplied by the embedder:
//! `read(path)` and `write(path, bytes)`. The guest's own computation is
//! opaque to this crate; it only sees syscall numbers and raw byte buffers.
//!
//! # ABI Specification
//!
//! ## Required Exports
//!
//! Every guest module MUST export:
//!
//! | Export   | Type                            | Description                     |
//! |----------|---------------------------------|---------------------------------|
//! | `memory` | Memory                          | Linear memory for data exchange |
//! | `main`   | `(argc: i32, argv: i32) -> i32` | Entry point, returns status     |
//! | `malloc` | `(size: i32) -> i32`            | Guest-owned allocator           |
//! | `free`   | `(ptr: i32) -> ()`              | Releases a `malloc` region      |
//!
//! ## Syscall Imports
//!
//! The shim provides these calls in the `wasi_snapshot_preview1` namespace.
//! Every call returns a small integer status the guest branches on; the shim
//! never traps out of a syscall.
//!
//! ```text
//! fd_close(fd) -> errno
//!   Flushes an output file to the host (exactly once), frees the slot.
//!
//! fd_fdstat_get(fd, stat_ptr) -> errno
//!   Writes a 24-byte descriptor record; only the kind byte is populated
//!   (directory for mounts, regular file otherwise).
//!
//! path_open(parent_fd, dirflags, path_ptr, path_len, oflags,
//!           rights_base, rights_inheriting, fdflags, opened_fd_ptr) -> errno
//!   Resolves path against the parent mount. With the CREAT bit set,
//!   allocates an output file flushed to host.write on close; otherwise
//!   fetches contents through host.read (no data -> EIO, no fd allocated).
//!
//! path_filestat_get(parent_fd, flags, path_ptr, path_len, buf_ptr) -> errno
//!   Zero-filled 64-byte stat record; only the kind byte at offset 16 is
//!   set (directory when the relative path is ".", file otherwise).
//!
//! fd_prestat_get(fd, buf_ptr) -> errno
//! fd_prestat_dir_name(fd, path_ptr, path_len) -> errno
//!   Expose the two fixed mounts so the guest's libc can learn its
//!   virtual root names.
//!
//! path_remove_directory(..) -> ENOSYS     (intentionally stubbed)
//! fd_fdstat_set_flags(..)   -> EINVAL     (intentionally stubbed)
//!
//! fd_seek(fd, offset, whence, newpos_ptr) -> errno
//!   whence 0 = start, 1 = current, 2 = end (position becomes the size).
//!   A target past the logical size is EINVAL and mutates nothing.
//!
//! fd_read(fd, iovs_ptr, iovs_len, nread_ptr) -> errno
//! fd_write(fd, iovs_ptr, iovs_len, nwritten_ptr) -> errno
//!   Scatter/gather over {ptr: u32, len: u32} iovec records. Zero-length
//!   iovecs are no-ops. Writes grow the backing buffer by doubling.
//! ```
//!
//! ## Descriptor Table Layout
//!
//! | fd | Purpose                       |
//! |----|-------------------------------|
//! | 1  | stdout sink                   |
//! | 2  | stderr sink                   |
//! | 3  | root mount (prefix `/`)       |
//! | 4  | cwd mount (prefix `./`)       |
//!
//! Slot 0 is free at session start; `path_open` hands out the lowest unused
//! fd, so the first open descriptor is 0 and the next is 5.
//!
//! ## Error Codes
//!
//! | Code | Meaning                |
//! |------|------------------------|
//! | 0    | Success                |
//! | 8    | Bad file descriptor    |
//! | 28   | Invalid argument       |
//! | 29   | I/O error              |
//! | 52   | Function not supported |
//!
//! ## Argument Passing
//!
//! `main(argc, argv)` receives argv as a pointer table followed by the
//! NUL-terminated argument strings, all inside one `malloc`-ed region:
//!
//! ```text
//! Example for ["guest", "scene.gltf"] at base address A:
//!   A+0:  ptr to A+8        (i32, "guest")   <- argv points here
//!   A+4:  ptr to A+14       (i32, "scene.gltf")
//!   A+8:  "guest\0"         (6 bytes)
//!   A+14: "scene.gltf\0"    (11 bytes)
//! ```
//!
//! The region is released through the guest's `free` export after the entry
//! point returns, on success and failure alike.
//!
//! # Sessions
//!
//! One `run` invocation owns all shim state (descriptor table, buffers, the
//! host interface) through a per-session context object; nothing persists
//! between runs and nothing is global. Execution is fully synchronous inside
//! an invocation - the entry point runs to completion, re-entering the shim
//! through direct calls for every syscall. On the browser target the
//! asynchrony of [`executor::execute`] covers only module compilation and
//! result delivery, never the run itself.

pub mod abi;
pub mod buffer;
pub mod error;
pub mod executor;
pub mod fd;
pub mod host;
pub mod loader;
pub mod memory;
pub mod session;
pub mod syscalls;
pub mod trace;

pub use buffer::GrowableBuffer;
pub use error::{ShimError, ShimResult};
pub use executor::execute;
pub use fd::{Descriptor, FdTable};
pub use host::{HostInterface, MemoryHost};
pub use loader::validate_module;
pub use memory::GuestMemory;
pub use session::{GuestModule, SessionOptions, SharedSession, run, run_with};
pub use syscalls::SessionState;

/// Install a panic hook that forwards messages to the browser console.
#[cfg(target_arch = "wasm32")]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

#[doc(hidden)]
#[cfg(target_arch = "wasm32")]
pub fn __log(message: &str) {
    web_sys::console::log_1(&message.into());
}

/// Log to the browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::__log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
