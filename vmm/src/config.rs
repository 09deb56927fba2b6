use std::env;
use std::path::PathBuf;

pub const SCRATCH_DIR_ENV: &str = "EMU_VMM_SCRATCH_DIR";
pub const DEFAULT_SCRATCH_PREFIX: &str = "emu-vmm";

/// Runtime knobs of an address space. Page geometry and cache capacity are
/// fixed constants and not part of the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    /// Directory for the scratch store, the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub scratch_prefix: String,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            scratch_prefix: DEFAULT_SCRATCH_PREFIX.to_string(),
        }
    }
}

impl VmmConfig {
    pub fn from_env() -> Self {
        Self::from_scratch_var(env::var(SCRATCH_DIR_ENV).ok())
    }

    fn from_scratch_var(val: Option<String>) -> Self {
        let scratch_dir = match val {
            Some(val) if !val.is_empty() => Some(PathBuf::from(val)),
            _ => None,
        };

        Self {
            scratch_dir,
            ..Default::default()
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(env::temp_dir)
    }
}
