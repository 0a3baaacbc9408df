//! Runtime configuration, read once at startup from the environment.

use std::env;

/// Knobs read from `BOX64R_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Print execution statistics (`ExecStats`) on exit.
    pub stats: bool,
    /// Disable JIT translation entirely and run every instruction
    /// through the interpreter fallback. Mostly useful for debugging
    /// miscompares against the deferred-flags model.
    pub no_jit: bool,
    /// Guest code buffer size in bytes.
    pub code_buf_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { stats: false, no_jit: false, code_buf_size: 16 * 1024 * 1024 }
    }
}

impl Config {
    /// Parse configuration from the environment. Unset variables keep
    /// their default; malformed values panic with a diagnostic, matching
    /// the teacher's `assert!`-heavy fail-fast style.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if env::var("BOX64R_STATS").is_ok() {
            cfg.stats = true;
        }
        if env::var("BOX64R_NO_JIT").is_ok() {
            cfg.no_jit = true;
        }
        if let Ok(s) = env::var("BOX64R_CODE_BUF_SIZE") {
            cfg.code_buf_size = s
                .parse()
                .unwrap_or_else(|_| panic!("BOX64R_CODE_BUF_SIZE: invalid size {s:?}"));
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_jit_enabled() {
        let cfg = Config::default();
        assert!(!cfg.no_jit);
        assert!(!cfg.stats);
        assert_eq!(cfg.code_buf_size, 16 * 1024 * 1024);
    }
}
