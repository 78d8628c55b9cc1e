//! Source and binary input, reached only through the file provider.

use std::collections::HashMap;

/// The assembler's only window onto the outside world. Identifiers are
/// opaque strings; resolution is the provider's business.
pub trait FileProvider {
    fn exists(&self, identifier: &str) -> bool;

    fn file_size(&self, identifier: &str) -> usize;

    /// Whole-file read; `None` when the file cannot be delivered.
    fn read_file(&self, identifier: &str) -> Option<Vec<u8>>;
}

/// In-memory provider for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileProvider {
    sources: HashMap<String, Vec<u8>>,
}

impl MemoryFileProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, identifier: &str, content: &str) {
        self.sources.insert(identifier.to_string(), content.as_bytes().to_vec());
    }

    pub fn add_binary(&mut self, identifier: &str, content: &[u8]) {
        self.sources.insert(identifier.to_string(), content.to_vec());
    }
}

impl FileProvider for MemoryFileProvider {
    fn exists(&self, identifier: &str) -> bool {
        self.sources.contains_key(identifier)
    }

    fn file_size(&self, identifier: &str) -> usize {
        self.sources.get(identifier).map_or(0, Vec::len)
    }

    fn read_file(&self, identifier: &str) -> Option<Vec<u8>> {
        self.sources.get(identifier).cloned()
    }
}
