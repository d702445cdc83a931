//! Guest executor for the browser target.
//!
//! Compiles and instantiates the guest module through the WebAssembly API,
//! wires every syscall import as a closure over the shared session context,
//! then hands off to the common orchestrator in [`crate::session`]. The
//! `async` here covers compilation and result delivery only - once the entry
//! point starts, the run is fully synchronous.

use crate::error::{ShimError, ShimResult};
use crate::host::HostInterface;
use crate::loader::validate_module;
use crate::session::SessionOptions;

#[cfg(target_arch = "wasm32")]
use crate::abi::{self, exports as abi_exports};
#[cfg(target_arch = "wasm32")]
use crate::memory::GuestMemory;
#[cfg(target_arch = "wasm32")]
use crate::session::{GuestModule, SharedSession, drive};
#[cfg(target_arch = "wasm32")]
use crate::syscalls::SessionState;
#[cfg(target_arch = "wasm32")]
use js_sys::{Function, Object, Reflect, Uint8Array, WebAssembly};
#[cfg(target_arch = "wasm32")]
use std::cell::RefCell;
#[cfg(target_arch = "wasm32")]
use std::rc::Rc;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsCast;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

/// Execute a guest module with default options.
#[cfg(target_arch = "wasm32")]
pub async fn execute(
    module_bytes: &[u8],
    args: &[&str],
    host: Box<dyn HostInterface>,
) -> ShimResult<String> {
    execute_with(module_bytes, args, host, SessionOptions::default()).await
}

/// Execute a guest module with explicit options.
#[cfg(target_arch = "wasm32")]
pub async fn execute_with(
    module_bytes: &[u8],
    args: &[&str],
    host: Box<dyn HostInterface>,
    options: SessionOptions,
) -> ShimResult<String> {
    crate::init_panic_hook();
    validate_module(module_bytes)?;

    let module = compile(module_bytes).await?;

    // The import closures need the session before the instance exists, so
    // the memory handle is attached afterwards.
    let state: SharedSession = Rc::new(RefCell::new(SessionState::new(host, &options)));
    let imports = build_imports(&state)?;
    let instance = instantiate(&module, &imports).await?;
    let exports = instance.exports();

    let memory: WebAssembly::Memory = export(&exports, abi_exports::MEMORY)?
        .dyn_into()
        .map_err(|_| ShimError::WrongExportType {
            name: abi_exports::MEMORY,
            expected: "Memory",
        })?;
    let memory = GuestMemory::from_js(memory);
    state.borrow_mut().set_memory(memory.clone());

    let mut guest = WasmGuest {
        memory,
        main_fn: export_function(&exports, abi_exports::MAIN)?,
        malloc_fn: export_function(&exports, abi_exports::MALLOC)?,
        free_fn: export_function(&exports, abi_exports::FREE)?,
    };

    drive(&state, &mut guest, args, &options)
}

/// Instantiated guest module behind the [`GuestModule`] seam.
#[cfg(target_arch = "wasm32")]
pub struct WasmGuest {
    memory: GuestMemory,
    main_fn: Function,
    malloc_fn: Function,
    free_fn: Function,
}

#[cfg(target_arch = "wasm32")]
impl GuestModule for WasmGuest {
    fn memory(&self) -> GuestMemory {
        self.memory.clone()
    }

    fn alloc(&mut self, size: u32) -> ShimResult<u32> {
        let value = self
            .malloc_fn
            .call1(&JsValue::NULL, &JsValue::from(size))
            .map_err(|e| ShimError::Aborted {
                reason: js_reason(&e, "malloc trapped"),
            })?;
        match value.as_f64() {
            Some(ptr) if ptr != 0.0 => Ok(ptr as u32),
            _ => Err(ShimError::GuestAlloc { size }),
        }
    }

    fn free(&mut self, ptr: u32) -> ShimResult<()> {
        self.free_fn
            .call1(&JsValue::NULL, &JsValue::from(ptr))
            .map(|_| ())
            .map_err(|e| ShimError::Aborted {
                reason: js_reason(&e, "free trapped"),
            })
    }

    fn invoke_entry(&mut self, _session: &SharedSession, argc: i32, argv: u32) -> ShimResult<i32> {
        let value = self
            .main_fn
            .call2(&JsValue::NULL, &JsValue::from(argc), &JsValue::from(argv))
            .map_err(|e| ShimError::Aborted {
                reason: js_reason(&e, "entry point trapped"),
            })?;
        Ok(value.as_f64().unwrap_or(0.0) as i32)
    }
}

#[cfg(target_arch = "wasm32")]
fn js_reason(value: &JsValue, fallback: &str) -> String {
    value.as_string().unwrap_or_else(|| fallback.to_string())
}

/// Compile WASM bytecode into a module
#[cfg(target_arch = "wasm32")]
async fn compile(bytes: &[u8]) -> ShimResult<WebAssembly::Module> {
    let array = Uint8Array::new_with_length(bytes.len() as u32);
    array.copy_from(bytes);

    let promise = WebAssembly::compile(&array.buffer());
    let result = wasm_bindgen_futures::JsFuture::from(promise)
        .await
        .map_err(|e| ShimError::Instantiation {
            reason: js_reason(&e, "compilation failed"),
        })?;

    result
        .dyn_into::<WebAssembly::Module>()
        .map_err(|_| ShimError::Instantiation {
            reason: "failed to cast to Module".to_string(),
        })
}

/// Instantiate a compiled module with imports
#[cfg(target_arch = "wasm32")]
async fn instantiate(
    module: &WebAssembly::Module,
    imports: &Object,
) -> ShimResult<WebAssembly::Instance> {
    let promise = WebAssembly::instantiate_module(module, imports);
    let result = wasm_bindgen_futures::JsFuture::from(promise)
        .await
        .map_err(|e| ShimError::Instantiation {
            reason: js_reason(&e, "instantiation failed"),
        })?;

    result
        .dyn_into::<WebAssembly::Instance>()
        .map_err(|_| ShimError::Instantiation {
            reason: "failed to cast to Instance".to_string(),
        })
}

#[cfg(target_arch = "wasm32")]
fn export(exports: &Object, name: &'static str) -> ShimResult<JsValue> {
    Reflect::get(exports, &JsValue::from_str(name))
        .map_err(|_| ShimError::MissingExport { name })
}

#[cfg(target_arch = "wasm32")]
fn export_function(exports: &Object, name: &'static str) -> ShimResult<Function> {
    export(exports, name)?
        .dyn_into()
        .map_err(|_| ShimError::WrongExportType {
            name,
            expected: "Function",
        })
}

#[cfg(target_arch = "wasm32")]
fn set_import(target: &Object, name: &str, value: &JsValue) -> ShimResult<()> {
    Reflect::set(target, &JsValue::from_str(name), value)
        .map(|_| ())
        .map_err(|_| ShimError::Instantiation {
            reason: format!("failed to set {} import", name),
        })
}

/// Create the import object with all syscall implementations
#[cfg(target_arch = "wasm32")]
fn build_imports(state: &SharedSession) -> ShimResult<Object> {
    let imports = Object::new();
    let ns = Object::new();

    add_fd_close(&ns, Rc::clone(state))?;
    add_fd_fdstat_get(&ns, Rc::clone(state))?;
    add_fd_fdstat_set_flags(&ns, Rc::clone(state))?;
    add_fd_prestat_get(&ns, Rc::clone(state))?;
    add_fd_prestat_dir_name(&ns, Rc::clone(state))?;
    add_path_open(&ns, Rc::clone(state))?;
    add_path_filestat_get(&ns, Rc::clone(state))?;
    add_path_remove_directory(&ns, Rc::clone(state))?;
    add_fd_seek(&ns, Rc::clone(state))?;
    add_fd_read(&ns, Rc::clone(state))?;
    add_fd_write(&ns, Rc::clone(state))?;

    set_import(&imports, abi::IMPORT_NAMESPACE, &ns)?;
    Ok(imports)
}

#[cfg(target_arch = "wasm32")]
fn add_fd_close(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32| -> i32 {
        state.borrow_mut().fd_close(fd)
    }) as Box<dyn Fn(i32) -> i32>);
    set_import(ns, "fd_close", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_fdstat_get(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, stat_ptr: i32| -> i32 {
        state.borrow_mut().fd_fdstat_get(fd, stat_ptr as u32)
    }) as Box<dyn Fn(i32, i32) -> i32>);
    set_import(ns, "fd_fdstat_get", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_fdstat_set_flags(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, flags: i32| -> i32 {
        state.borrow_mut().fd_fdstat_set_flags(fd, flags)
    }) as Box<dyn Fn(i32, i32) -> i32>);
    set_import(ns, "fd_fdstat_set_flags", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_prestat_get(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, buf_ptr: i32| -> i32 {
        state.borrow_mut().fd_prestat_get(fd, buf_ptr as u32)
    }) as Box<dyn Fn(i32, i32) -> i32>);
    set_import(ns, "fd_prestat_get", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_prestat_dir_name(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, path_ptr: i32, path_len: i32| -> i32 {
        state
            .borrow_mut()
            .fd_prestat_dir_name(fd, path_ptr as u32, path_len as u32)
    }) as Box<dyn Fn(i32, i32, i32) -> i32>);
    set_import(ns, "fd_prestat_dir_name", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_path_open(ns: &Object, state: SharedSession) -> ShimResult<()> {
    // path_open takes nine parameters on the wire, more than Closure
    // supports; a JS trampoline narrows it to the five the shim emulates.
    let closure = Closure::wrap(Box::new(
        move |fd: i32, path_ptr: i32, path_len: i32, open_flags: i32, opened_fd_ptr: i32| -> i32 {
            state.borrow_mut().path_open(
                fd,
                path_ptr as u32,
                path_len as u32,
                open_flags,
                opened_fd_ptr as u32,
            )
        },
    )
        as Box<dyn Fn(i32, i32, i32, i32, i32) -> i32>);

    let factory = Function::new_with_args(
        "open",
        "return function(fd, dirflags, path_ptr, path_len, oflags, \
         rights_base, rights_inheriting, fdflags, opened_fd_ptr) { \
           return open(fd, path_ptr, path_len, oflags, opened_fd_ptr); \
         };",
    );
    let trampoline = factory
        .call1(&JsValue::NULL, closure.as_ref())
        .map_err(|_| ShimError::Instantiation {
            reason: "failed to build path_open trampoline".to_string(),
        })?;
    set_import(ns, "path_open", &trampoline)?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_path_filestat_get(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(
        move |fd: i32, flags: i32, path_ptr: i32, path_len: i32, buf_ptr: i32| -> i32 {
            state.borrow_mut().path_filestat_get(
                fd,
                flags,
                path_ptr as u32,
                path_len as u32,
                buf_ptr as u32,
            )
        },
    )
        as Box<dyn Fn(i32, i32, i32, i32, i32) -> i32>);
    set_import(ns, "path_filestat_get", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_path_remove_directory(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(move |fd: i32, path_ptr: i32, path_len: i32| -> i32 {
        state
            .borrow_mut()
            .path_remove_directory(fd, path_ptr as u32, path_len as u32)
    }) as Box<dyn Fn(i32, i32, i32) -> i32>);
    set_import(ns, "path_remove_directory", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_seek(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(
        move |fd: i32, offset: i64, whence: i32, newpos_ptr: i32| -> i32 {
            state
                .borrow_mut()
                .fd_seek(fd, offset, whence, newpos_ptr as u32)
        },
    ) as Box<dyn Fn(i32, i64, i32, i32) -> i32>);
    set_import(ns, "fd_seek", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_read(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(
        move |fd: i32, iovs_ptr: i32, iovs_len: i32, nread_ptr: i32| -> i32 {
            state
                .borrow_mut()
                .fd_read(fd, iovs_ptr as u32, iovs_len as u32, nread_ptr as u32)
        },
    ) as Box<dyn Fn(i32, i32, i32, i32) -> i32>);
    set_import(ns, "fd_read", closure.as_ref())?;
    closure.forget();
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn add_fd_write(ns: &Object, state: SharedSession) -> ShimResult<()> {
    let closure = Closure::wrap(Box::new(
        move |fd: i32, iovs_ptr: i32, iovs_len: i32, nwritten_ptr: i32| -> i32 {
            state
                .borrow_mut()
                .fd_write(fd, iovs_ptr as u32, iovs_len as u32, nwritten_ptr as u32)
        },
    ) as Box<dyn Fn(i32, i32, i32, i32) -> i32>);
    set_import(ns, "fd_write", closure.as_ref())?;
    closure.forget();
    Ok(())
}

/// Native stub: module execution needs the browser's WebAssembly API, so
/// only validation runs here.
#[cfg(not(target_arch = "wasm32"))]
pub async fn execute(
    module_bytes: &[u8],
    args: &[&str],
    host: Box<dyn HostInterface>,
) -> ShimResult<String> {
    execute_with(module_bytes, args, host, SessionOptions::default()).await
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn execute_with(
    module_bytes: &[u8],
    _args: &[&str],
    _host: Box<dyn HostInterface>,
    _options: SessionOptions,
) -> ShimResult<String> {
    validate_module(module_bytes)?;
    Err(ShimError::Instantiation {
        reason: "guest execution requires the wasm32 target".to_string(),
    })
}
