//! Supplier address directory loaded from `EmailAddress.csv`.
//!
//! The table is split on bare commas with no quoting or escaping. Addresses
//! and codes never contain commas in practice, and keeping the split this
//! simple keeps behaviour identical to the files operators already maintain.

use std::collections::HashMap;
use std::path::Path;

use crate::audit::AuditLog;
use crate::config::paths;
use crate::error::DirectoryError;

/// Separator used when several rows share a supplier code.
pub const ADDRESS_SEPARATOR: char = ';';

const BOM: char = '\u{feff}';

/// Supplier code → `;`-joined address list. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressDirectory {
    by_code: HashMap<String, String>,
}

impl AddressDirectory {
    /// Load the directory for a work root. Fails soft: a missing or
    /// unreadable table is logged as an error and yields an empty directory.
    pub fn load(work_root: &Path, audit: &AuditLog) -> Self {
        match Self::read(work_root) {
            Ok(directory) => directory,
            Err(e) => {
                audit.error(e.to_string());
                Self::default()
            }
        }
    }

    fn read(work_root: &Path) -> Result<Self, DirectoryError> {
        let path = paths::address_table(work_root);
        if !path.exists() {
            return Err(DirectoryError::NotFound(path));
        }
        let bytes = std::fs::read(&path).map_err(|source| DirectoryError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(Self::parse(&decode(&bytes)))
    }

    /// Parse table text. The first line is a header; each remaining row
    /// needs at least three fields, field 0 is the code and field 2 the
    /// address.
    pub fn parse(content: &str) -> Self {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for line in content.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 3 {
                continue;
            }
            let code = fields[0].trim();
            let address = fields[2].trim();
            if code.is_empty() || address.is_empty() {
                continue;
            }

            match index.get(code) {
                Some(&i) => grouped[i].1.push(address.to_string()),
                None => {
                    index.insert(code.to_string(), grouped.len());
                    grouped.push((code.to_string(), vec![address.to_string()]));
                }
            }
        }

        let by_code = grouped
            .into_iter()
            .map(|(code, addresses)| (code, addresses.join(&ADDRESS_SEPARATOR.to_string())))
            .collect();
        Self { by_code }
    }

    pub fn get(&self, code: &str) -> Option<&str> {
        self.by_code.get(code).map(String::as_str)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.by_code.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// UTF-8 with an optional byte-order mark, falling back to Latin-1.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix(BOM).unwrap_or(text).to_string(),
        Err(_) => {
            let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
            text.into_owned()
        }
    }
}
