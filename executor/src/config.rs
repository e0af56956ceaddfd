//! Pool configuration.
//!
//! A [`Config`] is the immutable, validated set of parameters a
//! [`Pool`](crate::Pool) is created from. Configurations are produced by a
//! [`Builder`], which checks every value as it is assigned and performs the
//! cross-field checks in [`Builder::build`].
//!
//! # Parameters
//!
//! | Parameter | Meaning | Default |
//! |-----------|---------|---------|
//! | `capacity` | admission permits beyond `maximum` | 100 |
//! | `minimum` | workers kept alive while idle | 1 |
//! | `maximum` | hard cap on live workers | 1 |
//! | `keep_alive` | idle time before a worker above `minimum` retires | 0 |
//!
//! The number of tasks that may be outstanding (queued or executing) at any
//! instant is `capacity + maximum`, see [`Config::permits`].
//!
//! # Example
//!
//! ```
//! use bounded_executor::config::Config;
//!
//! # fn main() -> bounded_executor::config::Result<()> {
//! let config = Config::builder()
//!     .capacity(5)?
//!     .minimum(2)?
//!     .maximum(4)?
//!     .keep_alive(time::Duration::seconds(1))?
//!     .build()?;
//!
//! assert_eq!(config.permits(), 9);
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MINIMUM: usize = 1;
pub const DEFAULT_MAXIMUM: usize = 1;
pub const DEFAULT_KEEP_ALIVE: time::Duration = time::Duration::ZERO;

/// A specialized `Result` type for configuration operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while assembling a [`Config`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The capacity was zero.
    #[error("Capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    /// The minimum worker count was zero.
    #[error("Minimum worker count must be at least 1, got {0}")]
    InvalidMinimum(usize),

    /// The maximum worker count was zero.
    #[error("Maximum worker count must be at least 1, got {0}")]
    InvalidMaximum(usize),

    /// The keep-alive duration was negative.
    #[error("Keep-alive must not be negative, got {0:?}")]
    NegativeKeepAlive(time::Duration),

    /// The minimum worker count is larger than the maximum.
    #[error("Minimum worker count {minimum} exceeds maximum worker count {maximum}")]
    MinimumExceedsMaximum { minimum: usize, maximum: usize },

    /// `capacity + maximum` is larger than the admission gate can track.
    #[error("Capacity {capacity} plus maximum {maximum} exceeds {limit} admission permits")]
    TooManyPermits {
        capacity: usize,
        maximum: usize,
        limit: usize,
    },
}

/// Validated pool parameters.
///
/// Obtain one from [`Config::builder`], or use [`Config::default`] for the
/// default values. With the `serde` feature a `Config` can also be read from
/// a configuration file; deserialization goes through [`Builder::build`], so
/// the same validation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "Builder", into = "Builder"))]
pub struct Config {
    capacity: usize,
    minimum: usize,
    maximum: usize,
    keep_alive: time::Duration,
}

impl Config {
    /// Returns a builder initialised with the default values.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Admission permits available beyond the `maximum` workers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers kept alive even when idle.
    pub fn minimum(&self) -> usize {
        self.minimum
    }

    /// Hard cap on concurrently live workers.
    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// How long a worker above `minimum` may sit idle before it is retired.
    pub fn keep_alive(&self) -> time::Duration {
        self.keep_alive
    }

    /// Total admission permits: the most tasks that may be queued or
    /// executing at the same time.
    pub fn permits(&self) -> usize {
        // Cannot overflow, `Builder::build` checked the sum
        self.capacity + self.maximum
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            minimum: DEFAULT_MINIMUM,
            maximum: DEFAULT_MAXIMUM,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl TryFrom<Builder> for Config {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self> {
        builder.build()
    }
}

/// Accumulates and validates [`Config`] parameters.
///
/// Every setter rejects an out-of-range value immediately, leaving the
/// previously assigned value in place. A builder can be reused: each call to
/// [`build`](Builder::build) returns an independent `Config`, and
/// [`reset`](Builder::reset) restores the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Builder {
    capacity: usize,
    minimum: usize,
    maximum: usize,

    // Whole milliseconds on the wire
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    keep_alive: time::Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Config::default().into()
    }
}

impl From<Config> for Builder {
    fn from(config: Config) -> Self {
        Self {
            capacity: config.capacity,
            minimum: config.minimum,
            maximum: config.maximum,
            keep_alive: config.keep_alive,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn capacity(&mut self, capacity: usize) -> Result<&mut Self> {
        self.capacity = check_capacity(capacity)?;
        Ok(self)
    }

    pub fn minimum(&mut self, minimum: usize) -> Result<&mut Self> {
        self.minimum = check_minimum(minimum)?;
        Ok(self)
    }

    pub fn maximum(&mut self, maximum: usize) -> Result<&mut Self> {
        self.maximum = check_maximum(maximum)?;
        Ok(self)
    }

    pub fn keep_alive(&mut self, keep_alive: time::Duration) -> Result<&mut Self> {
        self.keep_alive = check_keep_alive(keep_alive)?;
        Ok(self)
    }

    /// Restores every parameter to its default value.
    pub fn reset(&mut self) -> &mut Self {
        *self = Self::default();
        self
    }

    /// Validates the accumulated parameters and returns a new [`Config`].
    ///
    /// Fields are checked again here because a deserialized builder never
    /// went through the setters.
    pub fn build(&self) -> Result<Config> {
        let config = Config {
            capacity: check_capacity(self.capacity)?,
            minimum: check_minimum(self.minimum)?,
            maximum: check_maximum(self.maximum)?,
            keep_alive: check_keep_alive(self.keep_alive)?,
        };

        if config.minimum > config.maximum {
            return Err(Error::MinimumExceedsMaximum {
                minimum: config.minimum,
                maximum: config.maximum,
            });
        }

        let limit = crate::admission::MAX_PERMITS;
        if config
            .capacity
            .checked_add(config.maximum)
            .is_none_or(|permits| permits > limit)
        {
            return Err(Error::TooManyPermits {
                capacity: config.capacity,
                maximum: config.maximum,
                limit,
            });
        }

        Ok(config)
    }
}

fn check_capacity(capacity: usize) -> Result<usize> {
    if capacity < 1 {
        Err(Error::InvalidCapacity(capacity))
    } else {
        Ok(capacity)
    }
}

fn check_minimum(minimum: usize) -> Result<usize> {
    if minimum < 1 {
        Err(Error::InvalidMinimum(minimum))
    } else {
        Ok(minimum)
    }
}

fn check_maximum(maximum: usize) -> Result<usize> {
    if maximum < 1 {
        Err(Error::InvalidMaximum(maximum))
    } else {
        Ok(maximum)
    }
}

fn check_keep_alive(keep_alive: time::Duration) -> Result<time::Duration> {
    if keep_alive.is_negative() {
        Err(Error::NegativeKeepAlive(keep_alive))
    } else {
        Ok(keep_alive)
    }
}

#[cfg(feature = "serde")]
mod millis {
    pub fn serialize<S>(duration: &time::Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let millis = duration
            .whole_milliseconds()
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        serializer.serialize_i64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<time::Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <i64 as serde::Deserialize>::deserialize(deserializer).map(time::Duration::milliseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.capacity(), 100);
        assert_eq!(config.minimum(), 1);
        assert_eq!(config.maximum(), 1);
        assert_eq!(config.keep_alive(), time::Duration::ZERO);
        assert_eq!(config.permits(), 101);
    }

    #[test]
    fn valid_combination() {
        let config = Config::builder()
            .capacity(5)
            .unwrap()
            .minimum(2)
            .unwrap()
            .maximum(4)
            .unwrap()
            .keep_alive(time::Duration::milliseconds(1000))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.capacity(), 5);
        assert_eq!(config.minimum(), 2);
        assert_eq!(config.maximum(), 4);
        assert_eq!(config.keep_alive(), time::Duration::seconds(1));
        assert_eq!(config.permits(), 9);
    }

    #[test]
    fn setters_reject_out_of_range() {
        let mut builder = Builder::new();

        assert_eq!(builder.capacity(0).unwrap_err(), Error::InvalidCapacity(0));
        assert_eq!(builder.minimum(0).unwrap_err(), Error::InvalidMinimum(0));
        assert_eq!(builder.maximum(0).unwrap_err(), Error::InvalidMaximum(0));
        assert_eq!(
            builder
                .keep_alive(time::Duration::milliseconds(-1))
                .unwrap_err(),
            Error::NegativeKeepAlive(time::Duration::milliseconds(-1))
        );

        // Rejected values leave the builder untouched
        assert_eq!(builder, Builder::new());
    }

    #[test]
    fn minimum_above_maximum_fails_build() {
        let mut builder = Builder::new();
        builder.minimum(3).unwrap().maximum(2).unwrap();

        assert_eq!(
            builder.build().unwrap_err(),
            Error::MinimumExceedsMaximum {
                minimum: 3,
                maximum: 2
            }
        );

        // Equal bounds are fine
        builder.maximum(3).unwrap();
        assert!(builder.build().is_ok());
    }

    #[test]
    fn oversized_capacity_fails_build() {
        let mut builder = Builder::new();
        builder.capacity(usize::MAX).unwrap();

        assert!(matches!(
            builder.build(),
            Err(Error::TooManyPermits { .. })
        ));
    }

    #[test]
    fn builder_reuse_and_reset() {
        let mut builder = Builder::new();
        builder.capacity(7).unwrap().maximum(3).unwrap();
        let first = builder.build().unwrap();

        builder.capacity(9).unwrap();
        let second = builder.build().unwrap();

        // The first config is unaffected by later changes
        assert_eq!(first.capacity(), 7);
        assert_eq!(second.capacity(), 9);
        assert_eq!(second.maximum(), 3);

        builder.reset();
        assert_eq!(builder.build().unwrap(), Config::default());
    }

    #[test]
    fn error_messages_name_the_constraint() {
        assert_eq!(
            Error::InvalidCapacity(0).to_string(),
            "Capacity must be at least 1, got 0"
        );
        assert_eq!(
            Error::MinimumExceedsMaximum {
                minimum: 4,
                maximum: 2
            }
            .to_string(),
            "Minimum worker count 4 exceeds maximum worker count 2"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_applies_defaults_and_validation() {
        let config: Config =
            serde_json::from_str(r#"{ "maximum": 4, "keep_alive": 250 }"#).unwrap();
        assert_eq!(config.capacity(), DEFAULT_CAPACITY);
        assert_eq!(config.minimum(), DEFAULT_MINIMUM);
        assert_eq!(config.maximum(), 4);
        assert_eq!(config.keep_alive(), time::Duration::milliseconds(250));

        assert!(serde_json::from_str::<Config>(r#"{ "capacity": 0 }"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{ "keep_alive": -1 }"#).is_err());
        assert!(serde_json::from_str::<Config>(r#"{ "minimum": 2 }"#).is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serialize_uses_milliseconds() {
        let config = Config::builder()
            .keep_alive(time::Duration::seconds(2))
            .unwrap()
            .build()
            .unwrap();

        let value = serde_json::to_value(config).unwrap();
        assert_eq!(value["keep_alive"], 2000);
        assert_eq!(value["capacity"], 100);
    }
}
