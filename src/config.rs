use std::path::PathBuf;

/// Configuration for a [`crate::Log`] instance.
///
/// Plain data: a struct with a `Default` impl, no config-file parsing crate.
/// Loading one of these from disk (TOML, env, whatever an embedding
/// application prefers) is the enclosing application's concern, not this
/// crate's.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment file and commit metadata file.
    pub directory: PathBuf,
    /// log2 of the page size. Default 16 (64 KiB pages).
    pub page_size_bits: u8,
    /// Number of pages kept resident in memory at once (the ring depth).
    /// Must be at least 2 so one page can flush while another is open.
    pub pages_in_memory: usize,
    /// File name for the append-only segment, relative to `directory`.
    pub segment_file_name: String,
    /// File name for the commit metadata blob, relative to `directory`.
    pub commit_file_name: String,
}

impl LogConfig {
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_bits
    }

    pub fn segment_path(&self) -> PathBuf {
        self.directory.join(&self.segment_file_name)
    }

    pub fn commit_path(&self) -> PathBuf {
        self.directory.join(&self.commit_file_name)
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.pages_in_memory < 2 {
            return Err(crate::error::LogError::InvalidConfig(
                "pages_in_memory must be at least 2".to_string(),
            ));
        }
        if self.page_size_bits < 6 || self.page_size_bits > 30 {
            return Err(crate::error::LogError::InvalidConfig(format!(
                "page_size_bits {} out of sane range [6, 30]",
                self.page_size_bits
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            page_size_bits: 16,
            pages_in_memory: 8,
            segment_file_name: "log.segment".to_string(),
            commit_file_name: "log.commit".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LogConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_single_page_ring() {
        let mut cfg = LogConfig::default();
        cfg.pages_in_memory = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn page_size_matches_bits() {
        let mut cfg = LogConfig::default();
        cfg.page_size_bits = 12;
        assert_eq!(cfg.page_size(), 4096);
    }
}
