//! Centralized configuration and builder for QuiverPM.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - PmemConfig::from_env() reads the QPM_* variables.
//! - PmemConfigBuilder for programmatic overrides (tests use it to force a map mode).
//!
//! Defaults:
//! - map_mode = Auto (try MAP_SYNC, fall back to a regular shared mapping)
//! - paranoid_handles = false
//! - preallocate = true (reserve file blocks before mapping)
//! - test_dir = None (tests fall back to the OS temp directory)

use std::fmt;
use std::path::PathBuf;

use crate::pmem::MapMode;

/// Requested mapping mode. `Auto` resolves at map time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapModePref {
    Auto,
    Sync,
    Regular,
}

impl MapModePref {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(MapModePref::Auto),
            "sync" | "dax" => Some(MapModePref::Sync),
            "regular" | "mmap" => Some(MapModePref::Regular),
            _ => None,
        }
    }

    /// Modes to attempt, in order.
    pub fn candidates(self) -> &'static [MapMode] {
        match self {
            MapModePref::Auto => &[MapMode::Sync, MapMode::Regular],
            MapModePref::Sync => &[MapMode::Sync],
            MapModePref::Regular => &[MapMode::Regular],
        }
    }
}

impl fmt::Display for MapModePref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MapModePref::Auto => "auto",
            MapModePref::Sync => "sync",
            MapModePref::Regular => "regular",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct PmemConfig {
    /// Mapping mode for data files.
    /// Env: QPM_MAP_MODE = auto|sync|regular (default auto)
    pub map_mode: MapModePref,

    /// Validate every PersistenceHandle range against its mapping.
    /// Env: QPM_PARANOID = 0|1 (default 0)
    pub paranoid_handles: bool,

    /// Reserve file blocks (fallocate) before mapping a new data file.
    /// Env: QPM_PREALLOCATE = 0|1 (default 1)
    pub preallocate: bool,

    /// Directory for DAX-backed files used by the test suite.
    /// Env: QPM_TEST_DIR
    pub test_dir: Option<PathBuf>,
}

impl Default for PmemConfig {
    fn default() -> Self {
        Self {
            map_mode: MapModePref::Auto,
            paranoid_handles: false,
            preallocate: true,
            test_dir: None,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

impl PmemConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QPM_MAP_MODE") {
            if let Some(m) = MapModePref::parse(&v) {
                cfg.map_mode = m;
            } else {
                log::warn!("ignoring unknown QPM_MAP_MODE={:?}", v);
            }
        }

        if let Some(on) = env_flag("QPM_PARANOID") {
            cfg.paranoid_handles = on;
        }

        if let Some(on) = env_flag("QPM_PREALLOCATE") {
            cfg.preallocate = on;
        }

        if let Ok(v) = std::env::var("QPM_TEST_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.test_dir = Some(PathBuf::from(s));
            }
        }

        cfg
    }

    pub fn with_map_mode(mut self, mode: MapModePref) -> Self {
        self.map_mode = mode;
        self
    }

    pub fn with_paranoid_handles(mut self, on: bool) -> Self {
        self.paranoid_handles = on;
        self
    }

    pub fn with_preallocate(mut self, on: bool) -> Self {
        self.preallocate = on;
        self
    }

    pub fn with_test_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.test_dir = dir.map(Into::into);
        self
    }

    /// Directory for scratch files: `test_dir` or the OS temp dir.
    pub fn scratch_dir(&self) -> PathBuf {
        self.test_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl fmt::Display for PmemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PmemConfig {{ map_mode: {}, paranoid_handles: {}, preallocate: {}, test_dir: {} }}",
            self.map_mode,
            self.paranoid_handles,
            self.preallocate,
            self.test_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "default(temp)".to_string()),
        )
    }
}

/// Builder that produces a PmemConfig.
#[derive(Clone, Debug)]
pub struct PmemConfigBuilder {
    cfg: PmemConfig,
}

impl Default for PmemConfigBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: PmemConfig::from_env(),
        }
    }
}

impl PmemConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: PmemConfig::default(),
        }
    }

    pub fn map_mode(mut self, mode: MapModePref) -> Self {
        self.cfg.map_mode = mode;
        self
    }

    pub fn paranoid_handles(mut self, on: bool) -> Self {
        self.cfg.paranoid_handles = on;
        self
    }

    pub fn preallocate(mut self, on: bool) -> Self {
        self.cfg.preallocate = on;
        self
    }

    pub fn test_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.cfg.test_dir = dir.map(Into::into);
        self
    }

    pub fn build(self) -> PmemConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_mode_parse() {
        assert_eq!(MapModePref::parse("SYNC"), Some(MapModePref::Sync));
        assert_eq!(MapModePref::parse(" regular "), Some(MapModePref::Regular));
        assert_eq!(MapModePref::parse("auto"), Some(MapModePref::Auto));
        assert_eq!(MapModePref::parse("bogus"), None);
        assert_eq!(MapModePref::Auto.candidates().len(), 2);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = PmemConfigBuilder::from_default()
            .map_mode(MapModePref::Regular)
            .paranoid_handles(true)
            .preallocate(false)
            .test_dir(Some("/tmp/qpm"))
            .build();
        assert_eq!(cfg.map_mode, MapModePref::Regular);
        assert!(cfg.paranoid_handles);
        assert!(!cfg.preallocate);
        assert_eq!(cfg.scratch_dir(), PathBuf::from("/tmp/qpm"));
        assert!(cfg.to_string().contains("map_mode: regular"));
    }
}
