use std::path::Path;

use crate::config::FilterConfig;

/// Capability implemented by every file filter. Filters in a chain are
/// ANDed: a file is included only if all of them agree.
pub trait FileFilter: Send + Sync {
    fn should_include(&self, path: &Path) -> bool;
}

/// Includes only files whose extension (lowercased) is in the allow list.
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }
}

impl FileFilter for ExtensionFilter {
    fn should_include(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.iter().any(|allowed| *allowed == ext.to_lowercase()),
            None => false,
        }
    }
}

/// Excludes files whose path contains any of the given substrings.
pub struct PatternFilter {
    exclude_patterns: Vec<String>,
}

impl PatternFilter {
    pub fn new(exclude_patterns: Vec<String>) -> Self {
        Self { exclude_patterns }
    }
}

impl FileFilter for PatternFilter {
    fn should_include(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        !self.exclude_patterns.iter().any(|p| text.contains(p.as_str()))
    }
}

/// Excludes files larger than `max_bytes`. Files whose size cannot be read
/// are excluded as well.
pub struct SizeFilter {
    max_bytes: u64,
}

impl SizeFilter {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl FileFilter for SizeFilter {
    fn should_include(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) => meta.len() <= self.max_bytes,
            Err(_) => false,
        }
    }
}

/// ANDed chain of filters built from configuration.
pub struct FilterChain {
    filters: Vec<Box<dyn FileFilter>>,
}

impl FilterChain {
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut filters: Vec<Box<dyn FileFilter>> = Vec::new();
        if !config.extensions.is_empty() {
            filters.push(Box::new(ExtensionFilter::new(config.extensions.clone())));
        }
        if !config.exclude_patterns.is_empty() {
            filters.push(Box::new(PatternFilter::new(
                config.exclude_patterns.clone(),
            )));
        }
        if let Some(max) = config.max_file_size {
            filters.push(Box::new(SizeFilter::new(max)));
        }
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl FileFilter for FilterChain {
    fn should_include(&self, path: &Path) -> bool {
        self.filters.iter().all(|f| f.should_include(path))
    }
}
