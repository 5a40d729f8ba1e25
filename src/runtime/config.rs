//! VM start options.
//!
//! This module defines the options used to create the embedded VM and renders
//! them into the runtime's option list.

use super::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[cfg(windows)]
const CLASS_PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const CLASS_PATH_SEPARATOR: &str = ":";

const CLASS_PATH_OPTION: &str = "-Djava.class.path=";
const HEADLESS_OPTION: &str = "-Djava.awt.headless=true";

/// Options for a single VM creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Raw options passed through to the runtime, e.g. `-Xss4m`
    pub args: Vec<String>,

    /// Class path entries, rendered as one `-Djava.class.path=` option
    pub class_path: Vec<PathBuf>,

    /// Maximum heap size such as `512m` (None = runtime default)
    pub max_heap_size: Option<String>,

    /// Run without a windowing subsystem
    pub headless: bool,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_class_path(mut self, entry: impl Into<PathBuf>) -> Self {
        self.class_path.push(entry.into());
        self
    }

    pub fn with_max_heap_size(mut self, size: impl Into<String>) -> Self {
        self.max_heap_size = Some(size.into());
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Check the options without rendering them.
    pub fn validate(&self) -> Result<()> {
        for arg in &self.args {
            if arg == "-cp" || arg == "-classpath" || arg.starts_with(CLASS_PATH_OPTION) {
                return Err(BridgeError::InvalidOption(format!(
                    "'{}' is not allowed, set the class path through `class_path`",
                    arg
                )));
            }
        }
        if let Some(size) = &self.max_heap_size {
            let digits = size.strip_suffix(&['k', 'K', 'm', 'M', 'g', 'G'][..]).unwrap_or(size);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(BridgeError::InvalidOption(format!(
                    "max heap size '{}' must be a number with an optional k, m or g suffix",
                    size
                )));
            }
        }
        if let Some(entry) = self
            .class_path
            .iter()
            .find(|entry| entry.to_string_lossy().contains(CLASS_PATH_SEPARATOR))
        {
            return Err(BridgeError::InvalidOption(format!(
                "class path entry '{}' contains the path separator",
                entry.display()
            )));
        }
        Ok(())
    }

    /// Render the option list handed to VM creation.
    pub fn to_vm_args(&self) -> Result<Vec<String>> {
        self.validate()?;
        let mut rendered = self.args.clone();
        if !self.class_path.is_empty() {
            let joined = self
                .class_path
                .iter()
                .map(|entry| entry.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(CLASS_PATH_SEPARATOR);
            rendered.push(format!("{}{}", CLASS_PATH_OPTION, joined));
        }
        if let Some(size) = &self.max_heap_size {
            rendered.push(format!("-Xmx{}", size));
        }
        if self.headless {
            rendered.push(HEADLESS_OPTION.to_string());
        }
        Ok(rendered)
    }
}
