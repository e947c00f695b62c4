//! Ordered hierarchical key=value text serialization.
//!
//! A [`FieldSet`] is an insertion-ordered tree of string leaves and nested
//! subsets. On disk each leaf becomes one `dotted.path=value` line, so files
//! stay diffable and hand-editable. Parsing is all-or-nothing: any malformed
//! line fails the whole read with a [`FieldSetError`] distinct from plain I/O
//! failure, which lets callers tell "file is corrupt" from "file is missing".

use std::io::{self, BufRead, Write};

use hashlink::LinkedHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FieldSetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("missing field: {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("malformed line: {0:?}")]
    MalformedLine(String),
    #[error("conflicting leaf/subset entry at {0:?}")]
    Conflict(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Leaf(String),
    Subset(FieldSet),
}

/// Insertion-ordered map of names to string leaves or nested field sets.
///
/// Names must not contain `.` or `=`; leaf values must not contain newlines.
/// Both are the caller's responsibility, the writer does no escaping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldSet {
    entries: LinkedHashMap<String, Entry>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn put_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        // `replace` keeps an existing entry's position; `insert` would move
        // it to the back and reorder the wire form.
        self.entries.replace(name.into(), Entry::Leaf(value.into()));
    }

    pub fn put_u32(&mut self, name: impl Into<String>, value: u32) {
        self.put_str(name, value.to_string());
    }

    pub fn put_u64(&mut self, name: impl Into<String>, value: u64) {
        self.put_str(name, value.to_string());
    }

    /// Insert a nested subset. Empty subsets are dropped since they have no
    /// wire representation.
    pub fn put_subset(&mut self, name: impl Into<String>, subset: FieldSet) {
        if subset.is_empty() {
            return;
        }
        self.entries.replace(name.into(), Entry::Subset(subset));
    }

    pub fn get_str(&self, name: &str) -> Result<&str, FieldSetError> {
        match self.entries.get(name) {
            Some(Entry::Leaf(value)) => Ok(value),
            _ => Err(FieldSetError::Missing(name.to_owned())),
        }
    }

    pub fn get_u32(&self, name: &str) -> Result<u32, FieldSetError> {
        let value = self.get_str(name)?;
        value.parse().map_err(|_| FieldSetError::InvalidValue {
            key: name.to_owned(),
            value: value.to_owned(),
        })
    }

    pub fn get_u64(&self, name: &str) -> Result<u64, FieldSetError> {
        let value = self.get_str(name)?;
        value.parse().map_err(|_| FieldSetError::InvalidValue {
            key: name.to_owned(),
            value: value.to_owned(),
        })
    }

    pub fn subset(&self, name: &str) -> Option<&FieldSet> {
        match self.entries.get(name) {
            Some(Entry::Subset(subset)) => Some(subset),
            _ => None,
        }
    }

    /// Names of direct child subsets, in insertion order.
    pub fn direct_subset_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|(name, entry)| match entry {
            Entry::Subset(_) => Some(name.as_str()),
            Entry::Leaf(_) => None,
        })
    }

    /// Write one `dotted.path=value` line per leaf, in insertion order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.write_prefixed(writer, "")
    }

    fn write_prefixed<W: Write>(&self, writer: &mut W, prefix: &str) -> io::Result<()> {
        for (name, entry) in &self.entries {
            match entry {
                Entry::Leaf(value) => writeln!(writer, "{prefix}{name}={value}")?,
                Entry::Subset(subset) => {
                    let child_prefix = format!("{prefix}{name}.");
                    subset.write_prefixed(writer, &child_prefix)?;
                }
            }
        }
        Ok(())
    }

    /// Parse the wire form. Blank lines and `#` comments are skipped; any
    /// other irregularity fails the whole parse.
    pub fn parse<R: BufRead>(reader: R) -> Result<FieldSet, FieldSetError> {
        let mut root = FieldSet::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (path, value) = line
                .split_once('=')
                .ok_or_else(|| FieldSetError::MalformedLine(line.to_owned()))?;
            root.insert_path(path, value, line)?;
        }
        Ok(root)
    }

    fn insert_path(&mut self, path: &str, value: &str, line: &str) -> Result<(), FieldSetError> {
        let mut node = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(FieldSetError::MalformedLine(line.to_owned()));
            }
            if segments.peek().is_none() {
                if matches!(node.entries.get(segment), Some(Entry::Subset(_))) {
                    return Err(FieldSetError::Conflict(path.to_owned()));
                }
                node.put_str(segment, value);
                return Ok(());
            }
            let entry = node
                .entries
                .entry(segment.to_owned())
                .or_insert_with(|| Entry::Subset(FieldSet::new()));
            node = match entry {
                Entry::Subset(subset) => subset,
                Entry::Leaf(_) => return Err(FieldSetError::Conflict(path.to_owned())),
            };
        }
        Err(FieldSetError::MalformedLine(line.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_text(fs: &FieldSet) -> String {
        let mut buf = Vec::new();
        fs.write_to(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_put_get() {
        let mut fs = FieldSet::new();
        fs.put_u32("Version", 1);
        fs.put_u64("BootID", 123456789012345);
        fs.put_str("Name", "node-1");

        assert_eq!(fs.get_u32("Version").unwrap(), 1);
        assert_eq!(fs.get_u64("BootID").unwrap(), 123456789012345);
        assert_eq!(fs.get_str("Name").unwrap(), "node-1");
        assert!(matches!(
            fs.get_str("Other"),
            Err(FieldSetError::Missing(_))
        ));
    }

    #[test]
    fn test_invalid_value_distinct_from_missing() {
        let mut fs = FieldSet::new();
        fs.put_str("Version", "one");
        assert!(matches!(
            fs.get_u32("Version"),
            Err(FieldSetError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_write_ordering() {
        let mut fs = FieldSet::new();
        fs.put_u32("B", 2);
        fs.put_u32("A", 1);
        let mut child = FieldSet::new();
        child.put_str("X", "y");
        fs.put_subset("C", child);

        assert_eq!(to_text(&fs), "B=2\nA=1\nC.X=y\n");
    }

    #[test]
    fn test_empty_subset_dropped() {
        let mut fs = FieldSet::new();
        fs.put_subset("Peers", FieldSet::new());
        assert!(fs.subset("Peers").is_none());
        assert!(fs.is_empty());
    }

    #[test]
    fn test_roundtrip_nested() {
        let mut inner = FieldSet::new();
        inner.put_str("Address", "192.0.2.1:1234");
        inner.put_u64("Time", 1000);
        let mut peers = FieldSet::new();
        peers.put_subset("0", inner);
        let mut fs = FieldSet::new();
        fs.put_u32("Version", 1);
        fs.put_subset("Peers", peers);

        let text = to_text(&fs);
        let parsed = FieldSet::parse(text.as_bytes()).unwrap();
        assert_eq!(parsed, fs);

        let peer = parsed.subset("Peers").unwrap().subset("0").unwrap();
        assert_eq!(peer.get_str("Address").unwrap(), "192.0.2.1:1234");
        assert_eq!(peer.get_u64("Time").unwrap(), 1000);
    }

    #[test]
    fn test_direct_subset_names_in_order() {
        let mut fs = FieldSet::new();
        for name in ["0", "1", "2"] {
            let mut child = FieldSet::new();
            child.put_str("K", name);
            fs.put_subset(name, child);
        }
        fs.put_str("Leaf", "v");
        let names: Vec<_> = fs.direct_subset_names().collect();
        assert_eq!(names, ["0", "1", "2"]);
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let text = "# header\n\nVersion=1\r\n";
        let fs = FieldSet::parse(text.as_bytes()).unwrap();
        assert_eq!(fs.get_u32("Version").unwrap(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            FieldSet::parse("no equals sign".as_bytes()),
            Err(FieldSetError::MalformedLine(_))
        ));
        assert!(matches!(
            FieldSet::parse("a..b=1".as_bytes()),
            Err(FieldSetError::MalformedLine(_))
        ));
    }

    #[test]
    fn test_parse_rejects_leaf_subset_conflict() {
        assert!(matches!(
            FieldSet::parse("a=1\na.b=2".as_bytes()),
            Err(FieldSetError::Conflict(_))
        ));
        assert!(matches!(
            FieldSet::parse("a.b=2\na=1".as_bytes()),
            Err(FieldSetError::Conflict(_))
        ));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut fs = FieldSet::new();
        fs.put_u32("A", 1);
        fs.put_u32("B", 2);
        fs.put_u32("A", 3);
        assert_eq!(to_text(&fs), "A=3\nB=2\n");

        let mut sub = FieldSet::new();
        sub.put_str("K", "v");
        fs.put_subset("S", sub.clone());
        fs.put_u32("C", 4);
        sub.put_str("K", "w");
        fs.put_subset("S", sub);
        assert_eq!(to_text(&fs), "A=3\nB=2\nS.K=w\nC=4\n");
    }
}
