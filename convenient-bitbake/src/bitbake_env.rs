//! Parser for the resolved variable dump printed by `bitbake -e <target>`
//!
//! Only plain variable lines (`VAR="value"`, optionally prefixed with
//! `export`) are kept. Comments describing the variable history, shell and
//! python function bodies and `unset` lines are skipped.

use crate::ConfError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(?:export\s+)?(?P<key>[A-Za-z0-9_][A-Za-z0-9_\-:${}/\.+~]*)="(?P<value>.*)"$"#)
            .expect("variable pattern is valid")
    })
}

/// Variables resolved by BitBake for one target.
#[derive(Debug, Clone, Default)]
pub struct BitbakeEnv {
    variables: HashMap<String, String>,
}

impl BitbakeEnv {
    pub fn parse(output: &str) -> Self {
        let mut variables = HashMap::new();
        let mut in_function = false;

        for line in output.lines() {
            if in_function {
                if line.starts_with('}') {
                    in_function = false;
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') || line.starts_with("unset ") {
                continue;
            }
            if line.trim_end().ends_with('{') {
                in_function = true;
                continue;
            }
            if let Some(caps) = variable_regex().captures(line) {
                let value = caps["value"].replace("\\\"", "\"").replace("\\\\", "\\");
                variables.insert(caps["key"].to_string(), value);
            }
        }

        debug!("Parsed {} resolved variables", variables.len());
        BitbakeEnv { variables }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// Like [`get`](Self::get) but a missing or empty variable is an error.
    pub fn require(&self, key: &str) -> Result<&str, ConfError> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ConfError::MissingVariable(key.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
