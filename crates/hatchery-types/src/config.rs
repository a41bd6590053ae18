//! Pool sizing and behavior configuration.

use std::time::Duration;

use crate::charset::Charset;
use crate::error::{PoolError, PoolResult};

/// Configuration for a process pool.
///
/// The pool keeps between `min_size` and `max_size` shells alive and
/// tries to maintain `reserve_size` idle shells above active demand.
/// Shells are never culled to shrink the pool; shrinkage happens only
/// through the `keep_alive` idle timeout on individual shells.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of live shells.
    pub min_size: usize,
    /// Maximum number of live shells. At least 1 and at least `min_size`.
    pub max_size: usize,
    /// Desired idle head-room above active demand. At most `max_size`.
    pub reserve_size: usize,
    /// Idle interval after which a ready shell terminates itself.
    /// `None` (or a zero duration) means shells live forever.
    pub keep_alive: Option<Duration>,
    /// Charset applied to the children's standard streams.
    pub charset: Charset,
    /// Emit per-submission accounting at info level.
    pub verbose: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 1,
            reserve_size: 0,
            keep_alive: None,
            charset: Charset::default(),
            verbose: false,
        }
    }
}

impl PoolConfig {
    /// A pool holding exactly `size` shells at all times.
    pub fn fixed(size: usize) -> Self {
        Self {
            min_size: size,
            max_size: size.max(1),
            ..Self::default()
        }
    }

    /// A pool sized between `min_size` and `max_size`, keeping
    /// `reserve_size` idle shells above active demand.
    pub fn elastic(min_size: usize, max_size: usize, reserve_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            reserve_size,
            ..Self::default()
        }
    }

    /// Set the idle timeout after which ready shells terminate.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Set the stream charset.
    pub fn charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Enable per-submission accounting logs.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Check the sizing parameters for consistency.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size < 1 {
            return Err(PoolError::InvalidConfig(
                "maximum pool size must be at least 1".into(),
            ));
        }
        if self.max_size < self.min_size {
            return Err(PoolError::InvalidConfig(format!(
                "maximum pool size ({}) must be at least the minimum pool size ({})",
                self.max_size, self.min_size
            )));
        }
        if self.reserve_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "reserve size ({}) must not exceed the maximum pool size ({})",
                self.reserve_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Number of shells spawned at construction.
    pub fn initial_size(&self) -> usize {
        self.min_size.max(self.reserve_size)
    }

    /// Target shell count for the given demand.
    pub fn desired_size(&self, executing: usize, queued: usize) -> usize {
        self.min_size
            .max(executing + queued + self.reserve_size)
            .min(self.max_size)
    }

    /// The idle timeout with the zero-means-forever convention applied.
    pub fn effective_keep_alive(&self) -> Option<Duration> {
        self.keep_alive.filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero_max(PoolConfig { max_size: 0, ..PoolConfig::default() })]
    #[case::max_below_min(PoolConfig::elastic(4, 2, 0))]
    #[case::reserve_above_max(PoolConfig::elastic(0, 2, 3))]
    fn invalid_configs_are_rejected(#[case] config: PoolConfig) {
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[rstest]
    #[case::default(PoolConfig::default())]
    #[case::fixed(PoolConfig::fixed(4))]
    #[case::elastic(PoolConfig::elastic(2, 10, 3))]
    #[case::reserve_equals_max(PoolConfig::elastic(0, 4, 4))]
    fn valid_configs_pass(#[case] config: PoolConfig) {
        config.validate().unwrap();
    }

    #[test]
    fn initial_size_is_max_of_min_and_reserve() {
        assert_eq!(PoolConfig::elastic(2, 10, 3).initial_size(), 3);
        assert_eq!(PoolConfig::elastic(5, 10, 3).initial_size(), 5);
    }

    #[test]
    fn desired_size_clamps_to_max() {
        let config = PoolConfig::elastic(2, 10, 3);
        // executing + queued + reserve, floored by min, capped by max.
        assert_eq!(config.desired_size(0, 0), 3);
        assert_eq!(config.desired_size(4, 2), 9);
        assert_eq!(config.desired_size(20, 20), 10);
    }

    #[test]
    fn zero_keep_alive_means_forever() {
        let config = PoolConfig::default().keep_alive(Duration::ZERO);
        assert_eq!(config.effective_keep_alive(), None);
        let config = PoolConfig::default().keep_alive(Duration::from_millis(200));
        assert_eq!(
            config.effective_keep_alive(),
            Some(Duration::from_millis(200))
        );
    }
}
