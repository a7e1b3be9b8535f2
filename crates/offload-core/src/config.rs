//! Run configuration
//!
//! A run is described by a [`RunConfig`], loaded from TOML and then
//! overridden field by field from the command line:
//!
//! ```toml
//! backend = "host"
//! device_class = "gpu"
//! policy = "auto"
//! tile = 16
//! repeat = 3
//! build_options = "-D UNROLL=4"
//!
//! [verify]
//! mode = "full_scan"
//! log_limit = 10
//!
//! [vec_add]
//! elements = 4096
//!
//! [mat_mul]
//! rows = 256
//! cols = 128
//! inner = 64
//! seed = 7
//! ```

use crate::backend::BackendType;
use crate::error::{Error, Result};
use crate::planner::TilePolicy;
use crate::problem::{MatMul, VectorAdd};
use crate::verify::VerifyMode;
use offload_backends::DeviceClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Which [`TilePolicy`] to build, before the tile edge is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Fixed,
    Divisor,
    #[default]
    Auto,
}

impl PolicyKind {
    pub fn with_edge(self, edge: usize) -> TilePolicy {
        match self {
            PolicyKind::Fixed => TilePolicy::Fixed { edge },
            PolicyKind::Divisor => TilePolicy::LargestDivisor,
            PolicyKind::Auto => TilePolicy::FixedOrDivisor { edge },
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyKind::Fixed => "fixed",
            PolicyKind::Divisor => "divisor",
            PolicyKind::Auto => "auto",
        })
    }
}

impl FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(PolicyKind::Fixed),
            "divisor" => Ok(PolicyKind::Divisor),
            "auto" => Ok(PolicyKind::Auto),
            other => Err(Error::config(format!(
                "unknown policy `{other}` (expected fixed, divisor or auto)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VecAddConfig {
    pub elements: usize,
}

impl Default for VecAddConfig {
    fn default() -> Self {
        Self {
            elements: VectorAdd::DEFAULT_ELEMENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatMulConfig {
    pub rows: usize,
    pub cols: usize,
    /// Shared dimension; `cols` when absent.
    pub inner: Option<usize>,
    pub seed: u64,
}

impl MatMulConfig {
    pub fn inner(&self) -> usize {
        self.inner.unwrap_or(self.cols)
    }
}

impl Default for MatMulConfig {
    fn default() -> Self {
        Self {
            rows: MatMul::DEFAULT_DIM,
            cols: MatMul::DEFAULT_DIM,
            inner: None,
            seed: 0,
        }
    }
}

/// Everything that parameterizes one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub backend: BackendType,
    /// Class of device to select. There is no fallback to other classes.
    pub device_class: DeviceClass,
    pub policy: PolicyKind,
    /// Tile edge; the problem's default when absent.
    pub tile: Option<usize>,
    pub verify: VerifyMode,
    /// Extra dispatches on the same buffers, each checked for identical output.
    pub repeat: usize,
    pub build_options: String,
    pub vec_add: VecAddConfig,
    pub mat_mul: MatMulConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            device_class: DeviceClass::Gpu,
            policy: PolicyKind::default(),
            tile: None,
            verify: VerifyMode::default(),
            repeat: 0,
            build_options: String::new(),
            vec_add: VecAddConfig::default(),
            mat_mul: MatMulConfig::default(),
        }
    }
}

impl RunConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.tile == Some(0) {
            return Err(Error::config("tile must be positive"));
        }
        if self.vec_add.elements == 0 {
            return Err(Error::config("vec_add.elements must be positive"));
        }
        if i32::try_from(self.vec_add.elements - 1).is_err() {
            return Err(Error::config("vec_add.elements does not fit a device int"));
        }
        let m = &self.mat_mul;
        if m.rows == 0 || m.cols == 0 || m.inner() == 0 {
            return Err(Error::config("mat_mul dimensions must be positive"));
        }
        Ok(())
    }

    /// Tile policy for a problem whose default edge is `default_edge`.
    pub fn tile_policy(&self, default_edge: usize) -> TilePolicy {
        self.policy.with_edge(self.tile.unwrap_or(default_edge))
    }

    pub fn vector_add(&self) -> Result<VectorAdd> {
        VectorAdd::iota(self.vec_add.elements)
    }

    pub fn matrix_multiply(&self) -> Result<MatMul> {
        let m = &self.mat_mul;
        MatMul::random(m.rows, m.cols, m.inner(), m.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.backend, BackendType::Host);
        assert_eq!(config.device_class, DeviceClass::Gpu);
        assert_eq!(config.vec_add.elements, 4096);
        assert_eq!(config.mat_mul.inner(), 1024);
        assert_eq!(config.tile_policy(16), TilePolicy::FixedOrDivisor { edge: 16 });
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config = RunConfig::from_toml_str(
            r#"
            device_class = "cpu"
            policy = "fixed"
            tile = 8
            repeat = 2

            [verify]
            mode = "full_scan"
            log_limit = 5

            [mat_mul]
            rows = 64
            cols = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.device_class, DeviceClass::Cpu);
        assert_eq!(config.tile_policy(16), TilePolicy::Fixed { edge: 8 });
        assert_eq!(config.verify, VerifyMode::FullScan { log_limit: 5 });
        assert_eq!(config.repeat, 2);
        assert_eq!(config.mat_mul.inner(), 32);
        assert_eq!(config.vec_add, VecAddConfig::default());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(RunConfig::from_toml_str("tiles = 4"), Err(Error::Config(_))));
        assert!(matches!(
            RunConfig::from_toml_str("backend = \"cuda\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(RunConfig::from_toml_str("tile = 0"), Err(Error::Config(_))));
        assert!(matches!(
            RunConfig::from_toml_str("[mat_mul]\nrows = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RunConfig::from_toml_str("[vec_add]\nelements = 4294967296"),
            Err(Error::Config(msg)) if msg.contains("device int")
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vec_add]\nelements = 128").unwrap();
        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.vec_add.elements, 128);
        assert!(matches!(
            RunConfig::from_file(file.path().with_extension("missing")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("divisor".parse::<PolicyKind>().unwrap(), PolicyKind::Divisor);
        assert_eq!(PolicyKind::Divisor.with_edge(4), TilePolicy::LargestDivisor);
        assert!("square".parse::<PolicyKind>().is_err());
    }
}
