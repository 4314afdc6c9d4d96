//! A case-insensitively keyed header map. Values are kept as raw byte
//! slices — the negotiator never assumes a charset beyond the ASCII header
//! names themselves, per the handshake design in `handshake.rs`.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: HashMap<String, Vec<u8>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Vec<u8>) {
        self.entries.insert(name.to_ascii_lowercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Case-insensitive membership test against a comma-separated list
    /// header value, e.g. `Connection: keep-alive, Upgrade`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_str(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn equals_ignore_case(&self, name: &str, expected: &str) -> bool {
        self.get_str(name)
            .map(|value| value.trim().eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}
