//! Guest module validation.
//!
//! Checks a module binary against the shim's ABI before any instantiation
//! attempt: magic number, version, and the four required exports. Catching a
//! missing `malloc` here gives a named error instead of a failure deep inside
//! argv marshaling.

use crate::abi::exports;
use crate::error::{ShimError, ShimResult};

/// WASM magic number: \0asm
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// WASM version 1
const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Export section id
const EXPORT_SECTION: u8 = 7;

/// Export kind tags
const KIND_FUNC: u8 = 0;
const KIND_MEMORY: u8 = 2;

/// (name, kind, human-readable kind) for every export a guest must provide.
const REQUIRED_EXPORTS: [(&str, u8, &str); 4] = [
    (exports::MEMORY, KIND_MEMORY, "Memory"),
    (exports::MAIN, KIND_FUNC, "Function"),
    (exports::MALLOC, KIND_FUNC, "Function"),
    (exports::FREE, KIND_FUNC, "Function"),
];

/// Validate a module binary against the shim ABI.
pub fn validate_module(bytes: &[u8]) -> ShimResult<()> {
    if bytes.len() < 8 {
        return Err(ShimError::InvalidModule {
            reason: "module too small".to_string(),
        });
    }
    if bytes[0..4] != WASM_MAGIC {
        return Err(ShimError::InvalidModule {
            reason: "invalid magic number".to_string(),
        });
    }
    if bytes[4..8] != WASM_VERSION {
        return Err(ShimError::InvalidModule {
            reason: "unsupported WASM version".to_string(),
        });
    }

    let mut found: Vec<(String, u8)> = Vec::new();

    let mut offset = 8;
    while offset < bytes.len() {
        let section_id = bytes[offset];
        offset += 1;

        let (size, size_bytes) = read_leb128(&bytes[offset..])?;
        offset += size_bytes;

        let section_end = offset + size as usize;
        if section_end > bytes.len() {
            return Err(ShimError::InvalidModule {
                reason: "section extends past end of module".to_string(),
            });
        }

        if section_id == EXPORT_SECTION {
            found = parse_export_section(&bytes[offset..section_end])?;
        }

        offset = section_end;
    }

    for (name, kind, expected) in REQUIRED_EXPORTS {
        match found.iter().find(|(n, _)| n.as_str() == name) {
            None => return Err(ShimError::MissingExport { name }),
            Some((_, k)) if *k != kind => {
                return Err(ShimError::WrongExportType { name, expected });
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Read an unsigned LEB128 value
fn read_leb128(bytes: &[u8]) -> ShimResult<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes.iter().take(5) {
        bytes_read += 1;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, bytes_read));
        }
        shift += 7;
    }

    Err(ShimError::InvalidModule {
        reason: "invalid LEB128".to_string(),
    })
}

/// Parse the export section into (name, kind) pairs.
fn parse_export_section(data: &[u8]) -> ShimResult<Vec<(String, u8)>> {
    let mut found = Vec::new();
    if data.is_empty() {
        return Ok(found);
    }

    let mut offset = 0;
    let (count, count_bytes) = read_leb128(&data[offset..])?;
    offset += count_bytes;

    for _ in 0..count {
        let (name_len, len_bytes) = read_leb128(&data[offset..])?;
        offset += len_bytes;

        let name_end = offset + name_len as usize;
        if name_end > data.len() {
            return Err(ShimError::InvalidModule {
                reason: "export name extends past section".to_string(),
            });
        }
        let name = String::from_utf8_lossy(&data[offset..name_end]).to_string();
        offset = name_end;

        if offset >= data.len() {
            return Err(ShimError::InvalidModule {
                reason: "unexpected end of export section".to_string(),
            });
        }
        let kind = data[offset];
        offset += 1;

        let (_index, index_bytes) = read_leb128(&data[offset..])?;
        offset += index_bytes;

        found.push((name, kind));
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build module binaries for testing
    struct ModuleBuilder {
        bytes: Vec<u8>,
    }

    impl ModuleBuilder {
        fn new() -> Self {
            Self {
                bytes: vec![
                    0x00, 0x61, 0x73, 0x6D, // magic: \0asm
                    0x01, 0x00, 0x00, 0x00, // version: 1
                ],
            }
        }

        fn push_leb128(bytes: &mut Vec<u8>, mut value: u32) {
            loop {
                let byte = (value & 0x7F) as u8;
                value >>= 7;
                if value == 0 {
                    bytes.push(byte);
                    break;
                }
                bytes.push(byte | 0x80);
            }
        }

        fn section(mut self, id: u8, content: &[u8]) -> Self {
            self.bytes.push(id);
            Self::push_leb128(&mut self.bytes, content.len() as u32);
            self.bytes.extend_from_slice(content);
            self
        }

        /// Memory section with one 1-page memory
        fn memory_section(self) -> Self {
            self.section(0x05, &[0x01, 0x00, 0x01])
        }

        /// Export section with the given (name, kind, index) triples
        fn export_section(self, entries: &[(&str, u8, u32)]) -> Self {
            let mut content = Vec::new();
            Self::push_leb128(&mut content, entries.len() as u32);
            for (name, kind, index) in entries {
                Self::push_leb128(&mut content, name.len() as u32);
                content.extend_from_slice(name.as_bytes());
                content.push(*kind);
                Self::push_leb128(&mut content, *index);
            }
            self.section(0x07, &content)
        }

        fn build(self) -> Vec<u8> {
            self.bytes
        }
    }

    fn conforming_module() -> Vec<u8> {
        ModuleBuilder::new()
            .memory_section()
            .export_section(&[
                ("memory", KIND_MEMORY, 0),
                ("main", KIND_FUNC, 0),
                ("malloc", KIND_FUNC, 1),
                ("free", KIND_FUNC, 2),
            ])
            .build()
    }

    #[test]
    fn empty_module_is_invalid() {
        assert!(matches!(
            validate_module(&[]),
            Err(ShimError::InvalidModule { .. })
        ));
    }

    #[test]
    fn bad_magic_is_invalid() {
        let bytes = [0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(matches!(
            validate_module(&bytes),
            Err(ShimError::InvalidModule { .. })
        ));
    }

    #[test]
    fn bad_version_is_invalid() {
        let bytes = [0x00, 0x61, 0x73, 0x6D, 0x02, 0x00, 0x00, 0x00];
        assert!(matches!(
            validate_module(&bytes),
            Err(ShimError::InvalidModule { .. })
        ));
    }

    #[test]
    fn conforming_module_passes() {
        assert!(validate_module(&conforming_module()).is_ok());
    }

    #[test]
    fn missing_allocator_is_reported_by_name() {
        let module = ModuleBuilder::new()
            .memory_section()
            .export_section(&[
                ("memory", KIND_MEMORY, 0),
                ("main", KIND_FUNC, 0),
                ("free", KIND_FUNC, 1),
            ])
            .build();
        assert!(matches!(
            validate_module(&module),
            Err(ShimError::MissingExport { name: "malloc" })
        ));
    }

    #[test]
    fn missing_memory_is_reported_by_name() {
        let module = ModuleBuilder::new()
            .export_section(&[
                ("main", KIND_FUNC, 0),
                ("malloc", KIND_FUNC, 1),
                ("free", KIND_FUNC, 2),
            ])
            .build();
        assert!(matches!(
            validate_module(&module),
            Err(ShimError::MissingExport { name: "memory" })
        ));
    }

    #[test]
    fn export_of_wrong_kind_is_rejected() {
        let module = ModuleBuilder::new()
            .memory_section()
            .export_section(&[
                ("memory", KIND_MEMORY, 0),
                ("main", KIND_MEMORY, 0), // exported as memory, not a function
                ("malloc", KIND_FUNC, 1),
                ("free", KIND_FUNC, 2),
            ])
            .build();
        assert!(matches!(
            validate_module(&module),
            Err(ShimError::WrongExportType { name: "main", .. })
        ));
    }

    #[test]
    fn truncated_section_is_invalid() {
        let mut module = conforming_module();
        // Claim a section larger than what remains
        module.push(0x0A);
        module.push(0x7F);
        assert!(matches!(
            validate_module(&module),
            Err(ShimError::InvalidModule { .. })
        ));
    }

    #[test]
    fn leb128_decoding() {
        assert_eq!(read_leb128(&[0x00]).unwrap(), (0, 1));
        assert_eq!(read_leb128(&[0x7F]).unwrap(), (127, 1));
        assert_eq!(read_leb128(&[0x80, 0x01]).unwrap(), (128, 2));
        assert_eq!(read_leb128(&[0xE5, 0x8E, 0x26]).unwrap(), (624485, 3));
    }
}
