//! Session orchestration: the single public entry point.
//!
//! One `run` invocation builds a fresh session context (descriptor table,
//! sinks, host interface), marshals argv into guest-owned memory, invokes
//! the guest's entry point, and resolves with the accumulated stdout text or
//! rejects with the failure. All shim state lives in that context object and
//! dies with it; two runs share nothing.

use std::cell::RefCell;
use std::rc::Rc;

use crate::abi::ArgvLayout;
use crate::error::{ShimError, ShimResult};
use crate::fd::FdTable;
use crate::host::HostInterface;
use crate::memory::GuestMemory;
use crate::syscalls::SessionState;

/// Session context shared between the orchestrator and the syscall layer.
/// On the browser target the import closures capture clones of this handle.
pub type SharedSession = Rc<RefCell<SessionState>>;

/// Knobs for a session. The defaults reproduce the standard layout: program
/// name `guest`, root mount `/`, cwd mount `./`.
pub struct SessionOptions {
    /// The fixed leading argument handed to the entry point as argv[0].
    pub program_name: String,
    /// Path prefix of the root mount (fd 3).
    pub root_prefix: String,
    /// Path prefix of the cwd mount (fd 4).
    pub cwd_prefix: String,
    /// Cap on simultaneously open descriptors.
    pub max_fds: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            program_name: "guest".to_string(),
            root_prefix: "/".to_string(),
            cwd_prefix: "./".to_string(),
            max_fds: FdTable::DEFAULT_MAX,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_name(mut self, name: &str) -> Self {
        self.program_name = name.to_string();
        self
    }

    pub fn root_prefix(mut self, prefix: &str) -> Self {
        self.root_prefix = prefix.to_string();
        self
    }

    pub fn cwd_prefix(mut self, prefix: &str) -> Self {
        self.cwd_prefix = prefix.to_string();
        self
    }

    pub fn max_fds(mut self, max: usize) -> Self {
        self.max_fds = max;
        self
    }
}

/// The guest seam: whatever can receive the entry-point call.
///
/// On the browser target this is the instantiated module's exports; in tests
/// it is a scripted stand-in driving the syscall layer directly. Either way
/// the orchestrator only needs the module's memory, its allocator, and its
/// entry point.
pub trait GuestModule {
    /// Handle to the module's linear memory, shared with the emulator.
    fn memory(&self) -> GuestMemory;

    /// Reserve `size` bytes inside the module's own heap (its `malloc`
    /// export). The region holds the argv block for one invocation.
    fn alloc(&mut self, size: u32) -> ShimResult<u32>;

    /// Release a region previously handed out by [`GuestModule::alloc`].
    fn free(&mut self, ptr: u32) -> ShimResult<()>;

    /// Call the exported entry point with `(argc, argv)`. Emulated syscalls
    /// arrive on `session` while this runs; the return value is the guest's
    /// exit status.
    fn invoke_entry(&mut self, session: &SharedSession, argc: i32, argv: u32) -> ShimResult<i32>;
}

/// Run one session with default options.
///
/// Resolves with the text the guest wrote to its stdout sink; rejects with
/// [`ShimError::GuestExit`] carrying that same text when the entry point
/// returns non-zero, or with whatever fatal error cut the session short.
pub fn run(
    guest: &mut dyn GuestModule,
    args: &[&str],
    host: Box<dyn HostInterface>,
) -> ShimResult<String> {
    run_with(guest, args, host, SessionOptions::default())
}

/// Run one session with explicit options.
pub fn run_with(
    guest: &mut dyn GuestModule,
    args: &[&str],
    host: Box<dyn HostInterface>,
    options: SessionOptions,
) -> ShimResult<String> {
    let state: SharedSession = Rc::new(RefCell::new(SessionState::new(host, &options)));
    state.borrow_mut().set_memory(guest.memory());
    drive(&state, guest, args, &options)
}

/// The common tail of a run, shared with the browser executor (which builds
/// the session before instantiation and attaches memory afterwards).
pub(crate) fn drive(
    state: &SharedSession,
    guest: &mut dyn GuestModule,
    args: &[&str],
    options: &SessionOptions,
) -> ShimResult<String> {
    let mut argv: Vec<&str> = Vec::with_capacity(args.len() + 1);
    argv.push(&options.program_name);
    argv.extend_from_slice(args);

    let Some(memory) = state.borrow().memory() else {
        return Err(ShimError::Instantiation {
            reason: "guest memory not attached".to_string(),
        });
    };

    let layout = ArgvLayout::new(&argv);
    let base = guest.alloc(layout.total_size() as u32)?;
    let mut region = vec![0u8; layout.total_size()];
    layout.write_to(&argv, base, &mut region);
    memory.write(base, &region);

    let status = guest.invoke_entry(state, argv.len() as i32, base);
    // the argv region is released on every exit path
    let freed = guest.free(base);
    let status = status?;
    freed?;

    let mut session = state.borrow_mut();
    if let Some(fatal) = session.take_fatal() {
        crate::console_log!("session aborted: {}", fatal);
        return Err(fatal);
    }

    let text = session.stdout_text();
    if status == 0 {
        Ok(text)
    } else {
        crate::console_log!("guest exited with status {}", status);
        for line in session.open_fd_summary() {
            crate::console_log!("  {}", line);
        }
        crate::console_log!("recent syscalls:\n{}", session.trace().dump());
        Err(ShimError::GuestExit {
            code: status,
            output: text,
        })
    }
}
