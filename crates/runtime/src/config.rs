// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Configuration knobs for the scheduling core.
//!
//! All bounds are validated at configuration time, not at use time.

use std::time::Duration;

use axon_core::{Error, Result};
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_THREAD_MAX: usize = 8192;
pub(crate) const DEFAULT_IDLE_MIN: usize = 2;
pub(crate) const DEFAULT_IDLE_MAX: usize = usize::MAX / 2;
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the backing thread pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
	/// Hard cap on live plus starting threads.
	pub thread_max: usize,
	/// The launcher keeps at least this many idle threads warm.
	pub idle_min: usize,
	/// Idle threads beyond this count expire opportunistically.
	pub idle_max: usize,
	/// How long an idle thread waits for work before considering expiry.
	pub idle_timeout: Duration,
	/// Throttle window for thread creation.
	pub throttle_period: Duration,
	/// Creations allowed per throttle window before the launcher slows.
	pub throttle_limit: usize,
	/// Optional sleep applied once the throttle limit is exceeded.
	pub throttle_sleep: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			thread_max: DEFAULT_THREAD_MAX,
			idle_min: DEFAULT_IDLE_MIN,
			idle_max: DEFAULT_IDLE_MAX,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			throttle_period: Duration::from_secs(1),
			throttle_limit: 256,
			throttle_sleep: Duration::ZERO,
		}
	}
}

impl PoolConfig {
	pub fn validate(&self) -> Result<()> {
		if self.thread_max == 0 {
			return Err(Error::Config("thread_max must be greater than zero".to_string()));
		}

		if self.idle_min == 0 {
			return Err(Error::Config("idle_min must be greater than zero".to_string()));
		}

		if self.thread_max < self.idle_min {
			return Err(Error::Config(format!(
				"idle_min ({}) must not exceed thread_max ({})",
				self.idle_min, self.thread_max
			)));
		}

		if self.idle_max < self.idle_min {
			return Err(Error::Config(format!(
				"idle_max ({}) must not be below idle_min ({})",
				self.idle_max, self.idle_min
			)));
		}

		if self.throttle_limit == 0 {
			return Err(Error::Config("throttle_limit must be greater than zero".to_string()));
		}

		Ok(())
	}
}

/// Configuration for one actor's delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
	/// Ring capacity, rounded up to a power of two.
	pub capacity: usize,
	/// Whether producers may park on a full ring. A non-blocking queue
	/// uses the no-op blocker and relies on wake signaling alone.
	pub blocking: bool,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			capacity: 1024,
			blocking: true,
		}
	}
}

impl QueueConfig {
	pub fn validate(&self) -> Result<()> {
		if self.capacity < 2 {
			return Err(Error::Config("queue capacity must be at least 2".to_string()));
		}
		Ok(())
	}
}

/// Configuration for one actor's worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
	/// How long a drained worker parks before releasing its backing
	/// thread. `None` releases the thread immediately.
	pub idle_timeout: Option<Duration>,
	/// Permanent workers re-arm a fixed park timeout instead of going
	/// idle.
	pub permanent: bool,
	/// Messages delivered per batch before the outbox is flushed.
	pub batch_max: usize,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			idle_timeout: None,
			permanent: false,
			batch_max: 64,
		}
	}
}

impl WorkerConfig {
	pub fn validate(&self) -> Result<()> {
		if self.batch_max == 0 {
			return Err(Error::Config("batch_max must be greater than zero".to_string()));
		}
		Ok(())
	}
}

/// Combined per-actor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorConfig {
	pub queue: QueueConfig,
	pub worker: WorkerConfig,
}

impl ActorConfig {
	pub fn validate(&self) -> Result<()> {
		self.queue.validate()?;
		self.worker.validate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_are_valid() {
		assert!(PoolConfig::default().validate().is_ok());
		assert!(ActorConfig::default().validate().is_ok());
	}

	#[test]
	fn test_idle_min_above_thread_max_rejected() {
		let config = PoolConfig {
			thread_max: 2,
			idle_min: 4,
			..Default::default()
		};
		assert!(matches!(config.validate(), Err(Error::Config(_))));
	}

	#[test]
	fn test_zero_bounds_rejected() {
		let config = PoolConfig {
			thread_max: 0,
			..Default::default()
		};
		assert!(config.validate().is_err());

		let config = QueueConfig {
			capacity: 1,
			..Default::default()
		};
		assert!(config.validate().is_err());

		let config = WorkerConfig {
			batch_max: 0,
			..Default::default()
		};
		assert!(config.validate().is_err());
	}
}
