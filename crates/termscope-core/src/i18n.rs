//! Translation seam for human-facing error text.

use std::collections::HashMap;

/// Opaque `translate(key) -> string` collaborator.
pub trait Translator: Send + Sync {
    fn translate(&self, key: &str) -> String;
}

/// Returns the key unchanged. Useful when the caller localizes downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyTranslator;

impl Translator for KeyTranslator {
    fn translate(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Fixed key → message table, falling back to the key when absent.
#[derive(Debug, Clone, Default)]
pub struct StaticTranslator {
    messages: HashMap<String, String>,
}

impl StaticTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.messages.insert(key.into(), message.into());
        self
    }
}

impl Translator for StaticTranslator {
    fn translate(&self, key: &str) -> String {
        self.messages
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}
