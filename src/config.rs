//! Programmatic configuration for a [`crate::coordinator::DataFileCache`].
//!
//! This is the typed surface a caller builds in code; parsing it out of a config file or CLI
//! flags is outside this crate's scope (see the crate-level docs' Non-goals).

use crate::error::{Error, Result};
use crate::scale::DataFileScale;

#[derive(Debug, Clone)]
pub struct PageStoreConfig {
    pub data_file_scale: DataFileScale,
    pub data_file_factor: u32,
    pub nio_data_file: bool,
    pub increment_backup: bool,
    pub file_spaces: bool,
    pub cache_max_rows: usize,
    pub cache_max_size: u64,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            data_file_scale: DataFileScale::default(),
            data_file_factor: 1,
            nio_data_file: false,
            increment_backup: false,
            file_spaces: false,
            cache_max_rows: 10_000,
            cache_max_size: 64 * 1024 * 1024,
        }
    }
}

impl PageStoreConfig {
    pub fn builder() -> PageStoreConfigBuilder {
        PageStoreConfigBuilder::default()
    }

    /// Maximum file size allowed by this configuration: `i32::MAX * scale * factor`.
    pub fn max_data_file_size(&self) -> u64 {
        i32::MAX as u64 * self.data_file_scale.get() as u64 * self.data_file_factor as u64
    }
}

#[derive(Debug, Default)]
pub struct PageStoreConfigBuilder {
    inner: PageStoreConfig,
}

impl PageStoreConfigBuilder {
    pub fn data_file_scale(mut self, scale: u32) -> Result<Self> {
        self.inner.data_file_scale = DataFileScale::new(scale)?;
        Ok(self)
    }

    pub fn data_file_factor(mut self, factor: u32) -> Result<Self> {
        if factor == 0 {
            return Err(Error::data_file("data_file_factor must be positive"));
        }
        self.inner.data_file_factor = factor;
        Ok(self)
    }

    pub fn nio_data_file(mut self, on: bool) -> Self {
        self.inner.nio_data_file = on;
        self
    }

    pub fn increment_backup(mut self, on: bool) -> Self {
        self.inner.increment_backup = on;
        self
    }

    pub fn file_spaces(mut self, on: bool) -> Self {
        self.inner.file_spaces = on;
        self
    }

    pub fn cache_max_rows(mut self, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::data_file("cache_max_rows must be positive"));
        }
        self.inner.cache_max_rows = n;
        Ok(self)
    }

    pub fn cache_max_size(mut self, bytes: u64) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::data_file("cache_max_size must be positive"));
        }
        self.inner.cache_max_size = bytes;
        Ok(self)
    }

    pub fn build(self) -> PageStoreConfig {
        self.inner
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = PageStoreConfig::default();
        assert_eq!(cfg.data_file_scale.get(), 32);
        assert!(cfg.max_data_file_size() > 0);
    }

    #[test]
    fn builder_validates_scale() {
        assert!(PageStoreConfig::builder().data_file_scale(7).is_err());
        let cfg = PageStoreConfig::builder()
            .data_file_scale(16)
            .unwrap()
            .cache_max_rows(4)
            .unwrap()
            .build();
        assert_eq!(cfg.data_file_scale.get(), 16);
        assert_eq!(cfg.cache_max_rows, 4);
    }
}
