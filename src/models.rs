use std::path::{Path, PathBuf};

/// One firmware upgrade attempt. Immutable once the run starts; the
/// user-visible status line lives on the orchestrator, not here.
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub clear_data: bool,
    pub dry_run: bool,
    /// Parsed from `<image>.<software_set>.<running_mode>.<ext>` filenames;
    /// empty unless the name splits into exactly four dot-separated parts.
    pub software_set: String,
    pub running_mode: String,
}

impl UpgradeSession {
    pub fn new(path: impl Into<PathBuf>, file_size: u64, clear_data: bool, dry_run: bool) -> Self {
        let file_path = path.into();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (software_set, running_mode) = split_image_name(&file_name);

        Self {
            file_path,
            file_name,
            file_size,
            clear_data,
            dry_run,
            software_set,
            running_mode,
        }
    }

    /// Build a session from a file on disk, reading its size.
    pub async fn from_file(
        path: impl AsRef<Path>,
        clear_data: bool,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self::new(path, meta.len(), clear_data, dry_run))
    }
}

fn split_image_name(name: &str) -> (String, String) {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() == 4 {
        (parts[1].to_string(), parts[2].to_string())
    } else {
        (String::new(), String::new())
    }
}

/// Summary of a completed upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeReport {
    /// Firmware version reported by the device during installation.
    pub version: Option<String>,
    /// Items the device actually installed; zero means the firmware
    /// already matched and nothing was flashed.
    pub items_installed: Option<u32>,
    /// Whether the device rebooted and reconnected.
    pub rebooted: bool,
}

// A simple cancel token for aborting operations
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_part_names_yield_set_and_mode() {
        let s = UpgradeSession::new("/tmp/image.stable.main.swu", 1024, false, false);
        assert_eq!(s.file_name, "image.stable.main.swu");
        assert_eq!(s.software_set, "stable");
        assert_eq!(s.running_mode, "main");
    }

    #[test]
    fn other_part_counts_yield_empty() {
        for name in ["image.swu", "image.stable.swu", "a.b.c.d.swu", "image"] {
            let s = UpgradeSession::new(name, 1, false, false);
            assert_eq!(s.software_set, "", "{name}");
            assert_eq!(s.running_mode, "", "{name}");
        }
    }

    #[test]
    fn file_name_drops_directories() {
        let s = UpgradeSession::new("/var/tmp/fw.set.mode.swu", 1, false, false);
        assert_eq!(s.file_name, "fw.set.mode.swu");
        assert_eq!(s.software_set, "set");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
