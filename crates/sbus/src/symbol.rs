//! Symbol map files
//!
//! A `.map` file names the cells of one device: every non-empty,
//! non-comment line is `tag <space letter> <index>`, e.g.
//! `pump_speed r 118`. Comments start with `;` or `#`.

use sbus_core::command::AddressSpace;
use std::{collections::HashMap, fs, path::Path};
use tracing::{debug, warn};

/// Tag to address resolution for one device.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_tag: HashMap<String, (AddressSpace, u16)>,
    by_address: HashMap<(AddressSpace, u16), String>,
}

// === impl SymbolTable ===

impl SymbolTable {
    /// Parses a map file, replacing the current content.
    ///
    /// Unparsable lines are skipped with a warning; a missing file leaves
    /// the table empty.
    pub fn load(&mut self, path: &Path) -> usize {
        self.by_tag.clear();
        self.by_address.clear();

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!(target: "symbols", path = %path.display(), %err, "no symbol file");
                return 0;
            }
        };

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some((tag, space, index)) => {
                    self.by_address.insert((space, index), tag.clone());
                    self.by_tag.insert(tag, (space, index));
                }
                None => {
                    warn!(target: "symbols", path = %path.display(), line = number + 1, "skipping unparsable symbol line");
                }
            }
        }

        debug!(target: "symbols", path = %path.display(), count = self.count(), "symbols loaded");
        self.count()
    }

    fn parse_line(line: &str) -> Option<(String, AddressSpace, u16)> {
        let mut parts = line.split_whitespace();
        let tag = parts.next()?.to_lowercase();
        let space = AddressSpace::from_letter(parts.next()?.chars().next()?)?;
        let index = parts.next()?.parse().ok()?;
        Some((tag, space, index))
    }

    /// Resolves a tag, case-insensitively.
    pub fn lookup(&self, tag: &str) -> Option<(AddressSpace, u16)> {
        self.by_tag.get(&tag.to_lowercase()).copied()
    }

    /// Reverse lookup: the tag naming an address, if any.
    pub fn tag_for(&self, space: AddressSpace, index: u16) -> Option<&str> {
        self.by_address.get(&(space, index)).map(String::as_str)
    }

    pub fn count(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_map_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "; device symbols").unwrap();
        writeln!(file, "pump_speed r 118").unwrap();
        writeln!(file, "DoorOpen f 2001").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "broken line without index r").unwrap();
        file.flush().unwrap();

        let mut symbols = SymbolTable::default();
        assert_eq!(symbols.load(file.path()), 2);
        assert_eq!(symbols.lookup("pump_speed"), Some((AddressSpace::Register, 118)));
        // tags are case-insensitive
        assert_eq!(symbols.lookup("dooropen"), Some((AddressSpace::Flag, 2001)));
        assert_eq!(symbols.tag_for(AddressSpace::Flag, 2001), Some("dooropen"));
        assert_eq!(symbols.lookup("missing"), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let mut symbols = SymbolTable::default();
        assert_eq!(symbols.load(Path::new("/nonexistent/device.map")), 0);
        assert!(symbols.is_empty());
    }
}
