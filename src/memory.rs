//! Accessor for the guest module's linear memory.
//!
//! The emulator addresses guest memory with raw byte offsets; this type is
//! the only thing that knows where those bytes actually live. On the browser
//! target it wraps the instance's `WebAssembly.Memory` export; natively it is
//! a shared byte vector, which is what scripted guests and the test suite
//! run against.

#[cfg(target_arch = "wasm32")]
use js_sys::{Uint8Array, WebAssembly};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsCast;

#[cfg(not(target_arch = "wasm32"))]
use std::cell::RefCell;
#[cfg(not(target_arch = "wasm32"))]
use std::rc::Rc;

/// Handle to guest linear memory. Cloning yields another handle to the same
/// memory.
#[derive(Clone)]
pub struct GuestMemory {
    #[cfg(target_arch = "wasm32")]
    memory: WebAssembly::Memory,
    #[cfg(not(target_arch = "wasm32"))]
    data: Rc<RefCell<Vec<u8>>>,
}

#[cfg(target_arch = "wasm32")]
impl GuestMemory {
    pub fn from_js(memory: WebAssembly::Memory) -> Self {
        Self { memory }
    }

    /// Read bytes out of guest memory.
    pub fn read(&self, offset: u32, len: u32) -> Vec<u8> {
        let buffer = self.memory.buffer();
        let array = Uint8Array::new(&buffer);
        if u64::from(offset) + u64::from(len) > u64::from(array.length()) {
            return vec![];
        }
        let mut result = vec![0u8; len as usize];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = array.get_index(offset + i as u32);
        }
        result
    }

    /// Write bytes into guest memory.
    pub fn write(&self, offset: u32, data: &[u8]) {
        let buffer = self.memory.buffer();
        let array = Uint8Array::new(&buffer);
        let size = array.length();
        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i as u32;
            if at < size {
                array.set_index(at, byte);
            }
        }
    }

    /// Memory size in bytes.
    pub fn size(&self) -> u32 {
        let buffer = self.memory.buffer();
        let array_buffer: js_sys::ArrayBuffer = buffer.unchecked_into();
        array_buffer.byte_length()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl GuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0u8; size])),
        }
    }

    pub fn read(&self, offset: u32, len: u32) -> Vec<u8> {
        let data = self.data.borrow();
        let start = offset as usize;
        let end = start + len as usize;
        if end <= data.len() {
            data[start..end].to_vec()
        } else {
            vec![]
        }
    }

    pub fn write(&self, offset: u32, data: &[u8]) {
        let mut mem = self.data.borrow_mut();
        let start = offset as usize;
        for (i, &byte) in data.iter().enumerate() {
            if start + i < mem.len() {
                mem[start + i] = byte;
            }
        }
    }

    pub fn size(&self) -> u32 {
        self.data.borrow().len() as u32
    }
}

impl GuestMemory {
    /// Decode a length-delimited path string, truncated at the first NUL.
    pub fn read_string(&self, ptr: u32, len: u32) -> String {
        let mut bytes = self.read(ptr, len);
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn write_u32(&self, offset: u32, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&self, offset: u32, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }
}


#[cfg(all(test, target_arch = "wasm32"))]
mod wasm_tests {
    use super::*;
    use wasm_bindgen_test::wasm_bindgen_test;

    fn one_page() -> GuestMemory {
        let descriptor = js_sys::Object::new();
        js_sys::Reflect::set(&descriptor, &"initial".into(), &1.into()).unwrap();
        GuestMemory::from_js(WebAssembly::Memory::new(&descriptor).unwrap())
    }

    #[wasm_bindgen_test]
    fn read_write_roundtrip() {
        let mem = one_page();
        mem.write(128, b"hello");
        assert_eq!(mem.read(128, 5), b"hello");
        assert_eq!(mem.size(), 65536);
    }
}
