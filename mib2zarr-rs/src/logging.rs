use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// Logging setup resolved once from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
}

impl LogConfig {
    /// 0 = warn, 1 = info, 2+ = debug.
    pub fn from_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        };
        Self { level }
    }

    /// Install the global logger. `RUST_LOG` still overrides the level.
    pub fn init(&self) {
        let default = self.level.as_str().to_ascii_lowercase();
        Builder::from_env(Env::default().default_filter_or(default))
            .target(Target::Stdout)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(LogConfig::from_verbosity(0).level, LevelFilter::Warn);
        assert_eq!(LogConfig::from_verbosity(1).level, LevelFilter::Info);
        assert_eq!(LogConfig::from_verbosity(2).level, LevelFilter::Debug);
        assert_eq!(LogConfig::from_verbosity(7).level, LevelFilter::Debug);
    }
}
