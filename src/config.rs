//! Runtime configuration
//!
//! ```toml
//! profiling = true
//! max_workgroup_size = 256
//! build_options = ["-D SPLINE_KERNEL"]
//!
//! [math]
//! unsafe_math = false
//! ```

use crate::error::{Result, RuntimeError, fail};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Global runtime switches shared by the catalog, links and programs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Create profiling queues and log per-command device time
    pub profiling: bool,
    /// Upper bound for per-kernel workgroup sizes reported by devices
    pub max_workgroup_size: usize,
    pub math: MathOptions,
    /// Extra compiler options appended after the math flags
    pub build_options: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profiling: false,
            max_workgroup_size: 1024,
            math: MathOptions::default(),
            build_options: Vec::new(),
        }
    }
}

/// Floating-point optimization switches passed to the device compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MathOptions {
    pub fused_multiply_add: bool,
    pub unsafe_math: bool,
    pub finite_math_only: bool,
    pub flush_denormals: bool,
}

impl Default for MathOptions {
    fn default() -> Self {
        Self {
            fused_multiply_add: true,
            unsafe_math: true,
            finite_math_only: true,
            flush_denormals: true,
        }
    }
}

impl MathOptions {
    /// All optimizations off
    pub fn strict() -> Self {
        Self {
            fused_multiply_add: false,
            unsafe_math: false,
            finite_math_only: false,
            flush_denormals: false,
        }
    }

    /// Compiler flag string, always starting with `-cl-no-signed-zeros`
    pub fn flags(&self) -> String {
        let mut flags = String::from("-cl-no-signed-zeros");
        if self.flush_denormals {
            flags.push_str(" -cl-denorms-are-zero");
        }
        if self.finite_math_only {
            flags.push_str(" -cl-finite-math-only");
        }
        if self.fused_multiply_add {
            flags.push_str(" -cl-mad-enable");
        }
        if self.unsafe_math {
            flags.push_str(" -cl-unsafe-math-optimizations");
        }
        flags
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = match toml::from_str(text) {
            Ok(config) => config,
            Err(e) => {
                return fail(RuntimeError::Config {
                    message: e.to_string(),
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                return fail(RuntimeError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };
        tracing::debug!("Loading runtime configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).or_else(|e| {
            fail(RuntimeError::Config {
                message: e.to_string(),
            })
        })
    }

    fn validate(&self) -> Result<()> {
        if self.max_workgroup_size == 0 {
            return fail(RuntimeError::Config {
                message: "max_workgroup_size must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.profiling);
        assert_eq!(config.max_workgroup_size, 1024);
        assert_eq!(
            config.math.flags(),
            "-cl-no-signed-zeros -cl-denorms-are-zero -cl-finite-math-only \
             -cl-mad-enable -cl-unsafe-math-optimizations"
        );
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            profiling = true
            build_options = ["-D SPLINE"]

            [math]
            unsafe_math = false
            "#,
        )
        .unwrap();
        assert!(config.profiling);
        assert_eq!(config.max_workgroup_size, 1024);
        assert!(config.math.fused_multiply_add);
        assert!(!config.math.unsafe_math);
        assert_eq!(config.build_options, vec!["-D SPLINE".to_string()]);
    }

    #[test]
    fn test_strict_math_flags() {
        assert_eq!(MathOptions::strict().flags(), "-cl-no-signed-zeros");
    }

    #[test]
    fn test_invalid_config() {
        assert!(RuntimeConfig::from_toml_str("max_workgroup_size = 0").is_err());
        assert!(RuntimeConfig::from_toml_str("profiling = 3").is_err());
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_config_is_logged() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            assert!(RuntimeConfig::from_toml_str("max_workgroup_size = 0").is_err());
            assert!(RuntimeConfig::from_toml_str("profiling = 3").is_err());
            assert!(RuntimeConfig::load("/nonexistent/kernlink.toml").is_err());
        });

        let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let errors: Vec<&str> = logs.lines().filter(|l| l.contains("ERROR")).collect();
        assert_eq!(errors.len(), 3, "{logs}");
        assert!(errors[0].contains("max_workgroup_size must be at least 1"), "{logs}");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RuntimeConfig {
            profiling: true,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}
