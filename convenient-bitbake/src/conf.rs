//! Structured editing of BitBake configuration files
//!
//! `.conf` and `.inc` files are read into a list of lines where every simple
//! `KEY op "value"` assignment is recognised. Edits replace only the quoted
//! value of one assignment; every other byte of the file is written back
//! unchanged.

use crate::ConfError;
use regex::Regex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

fn assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\s*(?:export\s+)?(?P<key>[A-Za-z0-9_\-${}/\[\]~:]+?)\s*(?P<op>\?\?=|\?=|:=|\+=|=\+|\.=|=\.|=)\s*"(?P<value>(?:[^"\\]|\\.)*)"\s*$"#,
        )
        .expect("assignment pattern is valid")
    })
}

/// A single `KEY op "value"` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: String,
    pub op: String,
    pub value: String,
    raw: String,
    value_span: Range<usize>,
}

impl Assignment {
    fn parse(raw: &str) -> Option<Self> {
        let body = raw.trim_end_matches(['\n', '\r']);
        let caps = assignment_regex().captures(body)?;
        let value = caps.name("value")?;
        Some(Assignment {
            key: caps["key"].to_string(),
            op: caps["op"].to_string(),
            value: value.as_str().to_string(),
            raw: raw.to_string(),
            value_span: value.range(),
        })
    }

    fn replace_value(&mut self, value: &str) {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        let mut raw = String::with_capacity(self.raw.len() + escaped.len());
        raw.push_str(&self.raw[..self.value_span.start]);
        raw.push_str(&escaped);
        raw.push_str(&self.raw[self.value_span.end..]);
        self.value_span = self.value_span.start..self.value_span.start + escaped.len();
        self.value = escaped;
        self.raw = raw;
    }

    /// The line exactly as it appears in the file, line ending included.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfLine {
    Assignment(Assignment),
    Other(String),
}

impl ConfLine {
    fn raw(&self) -> &str {
        match self {
            ConfLine::Assignment(a) => a.raw(),
            ConfLine::Other(raw) => raw,
        }
    }
}

/// A BitBake configuration file held line by line.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    path: Option<PathBuf>,
    lines: Vec<ConfLine>,
}

impl ConfFile {
    /// Parse configuration text.
    pub fn parse(text: &str) -> Self {
        let lines = text
            .split_inclusive('\n')
            .map(|raw| match Assignment::parse(raw) {
                Some(assignment) => ConfLine::Assignment(assignment),
                None => ConfLine::Other(raw.to_string()),
            })
            .collect();
        ConfFile { path: None, lines }
    }

    /// Read and parse a configuration file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))?;
        let mut conf = Self::parse(&text);
        conf.path = Some(path.to_path_buf());
        debug!(
            "Parsed {:?}: {} lines, {} assignments",
            path,
            conf.lines.len(),
            conf.assignments().count()
        );
        Ok(conf)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> &[ConfLine] {
        &self.lines
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.lines.iter().filter_map(|line| match line {
            ConfLine::Assignment(a) => Some(a),
            ConfLine::Other(_) => None,
        })
    }

    /// Value of the last assignment to `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.assignments()
            .filter(|a| a.key == key)
            .last()
            .map(|a| a.value.as_str())
    }

    /// Replace the value of the single assignment to `key`.
    ///
    /// Fails when the key is not assigned, or assigned more than once, so
    /// that an edit can never silently miss.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfError> {
        let origin = self.origin();
        let mut matches = self.lines.iter_mut().filter_map(|line| match line {
            ConfLine::Assignment(a) if a.key == key => Some(a),
            _ => None,
        });

        let target = matches
            .next()
            .ok_or_else(|| ConfError::KeyNotFound(key.to_string(), origin.clone()))?;
        let extra = matches.count();
        if extra > 0 {
            return Err(ConfError::AmbiguousKey(key.to_string(), extra + 1, origin));
        }

        target.replace_value(value);
        info!("Set {} = \"{}\" in {:?}", key, value, origin);
        Ok(())
    }

    /// Render the file back to text.
    pub fn to_text(&self) -> String {
        self.lines.iter().map(ConfLine::raw).collect()
    }

    /// Write the file to `path`.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_text())
            .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))
    }

    /// Write the file back to where it was read from.
    pub fn save(&self) -> Result<(), ConfError> {
        match &self.path {
            Some(path) => self.write(path),
            None => Err(ConfError::NoPath),
        }
    }

    fn origin(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("<memory>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const FEED_INC: &str = "# Feed of the oss layer\n\
OSS_IPK_SERVER_PATH = \"file:///old/path/ipk\"\n\
OSS_IPK_FEED_PRIORITY ?= \"10\"\n\
\n\
  export  DISTRO_FEED_URI:append = \"extra\"\r\n\
PACKAGE_FEED_URIS += \"${OSS_IPK_SERVER_PATH}\"\n\
python do_thing() {\n\
    bb.note(\"OSS_IPK_SERVER_PATH = \\\"x\\\"\")\n\
}\n";

    #[test]
    fn parse_recognises_assignment_operators() {
        let conf = ConfFile::parse(FEED_INC);
        let found: Vec<(&str, &str)> = conf
            .assignments()
            .map(|a| (a.key.as_str(), a.op.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("OSS_IPK_SERVER_PATH", "="),
                ("OSS_IPK_FEED_PRIORITY", "?="),
                ("DISTRO_FEED_URI:append", "="),
                ("PACKAGE_FEED_URIS", "+="),
            ]
        );
        assert_eq!(conf.get("OSS_IPK_FEED_PRIORITY"), Some("10"));
    }

    #[test]
    fn unchanged_file_renders_byte_identical() {
        let conf = ConfFile::parse(FEED_INC);
        assert_eq!(conf.to_text(), FEED_INC);
    }

    #[test]
    fn set_value_touches_exactly_one_line() {
        let mut conf = ConfFile::parse(FEED_INC);
        conf.set_value("OSS_IPK_SERVER_PATH", "file:///shared/rdk-arm64-oss/4.6.2-community/ipk")
            .unwrap();
        let text = conf.to_text();

        let before: Vec<&str> = FEED_INC.split_inclusive('\n').collect();
        let after: Vec<&str> = text.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());

        let changed: Vec<usize> = (0..before.len())
            .filter(|&i| before[i] != after[i])
            .collect();
        assert_eq!(changed, vec![1]);
        assert_eq!(
            after[1],
            "OSS_IPK_SERVER_PATH = \"file:///shared/rdk-arm64-oss/4.6.2-community/ipk\"\n"
        );
    }

    #[test]
    fn set_value_is_idempotent() {
        let mut conf = ConfFile::parse(FEED_INC);
        conf.set_value("OSS_IPK_SERVER_PATH", "file:///a").unwrap();
        let once = conf.to_text();
        let mut again = ConfFile::parse(&once);
        again.set_value("OSS_IPK_SERVER_PATH", "file:///a").unwrap();
        assert_eq!(again.to_text(), once);
    }

    #[test]
    fn set_value_escapes_quotes() {
        let mut conf = ConfFile::parse("A = \"x\"\n");
        conf.set_value("A", "say \"hi\"").unwrap();
        assert_eq!(conf.to_text(), "A = \"say \\\"hi\\\"\"\n");
    }

    #[test]
    fn missing_key_is_an_error() {
        let mut conf = ConfFile::parse(FEED_INC);
        match conf.set_value("VENDOR_IPK_SERVER_PATH", "x") {
            Err(ConfError::KeyNotFound(key, _)) => assert_eq!(key, "VENDOR_IPK_SERVER_PATH"),
            other => panic!("Expected KeyNotFound, got {:?}", other),
        }
        assert_eq!(conf.to_text(), FEED_INC);
    }

    #[test]
    fn duplicated_key_is_an_error() {
        let mut conf = ConfFile::parse("A = \"1\"\nA = \"2\"\n");
        match conf.set_value("A", "3") {
            Err(ConfError::AmbiguousKey(_, count, _)) => assert_eq!(count, 2),
            other => panic!("Expected AmbiguousKey, got {:?}", other),
        }
    }

    #[test]
    #[traced_test]
    fn read_and_save_round_trip_on_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("oss-ipk-feed.inc");
        std::fs::write(&path, FEED_INC).unwrap();

        let mut conf = ConfFile::read(&path).unwrap();
        conf.set_value("OSS_IPK_SERVER_PATH", "file:///new").unwrap();
        conf.save().unwrap();

        let reread = ConfFile::read(&path).unwrap();
        assert_eq!(reread.get("OSS_IPK_SERVER_PATH"), Some("file:///new"));
        assert!(logs_contain("Set OSS_IPK_SERVER_PATH = \"file:///new\""));
    }

    #[test]
    fn file_without_trailing_newline() {
        let mut conf = ConfFile::parse("A = \"1\"");
        conf.set_value("A", "2").unwrap();
        assert_eq!(conf.to_text(), "A = \"2\"");
    }
}
