// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Policy
//!
//! Decides how long to wait before each reconnection attempt and when to give
//! up. The default waits one second between attempts and never gives up.

use backoff::{backoff::Backoff, backoff::Constant, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_DELAY_MS: u64 = 1000;

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
    /// Growing delay, randomized by `jitter` (0 disables it)
    Exponential {
        #[serde(default = "default_delay_ms")]
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_jitter")]
        jitter: f64,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: DEFAULT_DELAY_MS,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> ReconnectPolicy {
        ReconnectPolicy::Fixed {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            max_attempts: None,
        }
    }

    /// Starts a fresh sequence of delays.
    pub fn schedule(&self) -> ReconnectSchedule {
        match self {
            ReconnectPolicy::Fixed {
                delay_ms,
                max_attempts,
            } => ReconnectSchedule {
                backoff: Box::new(Constant::new(Duration::from_millis(*delay_ms))),
                attempts: 0,
                max_attempts: *max_attempts,
            },
            ReconnectPolicy::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
                max_attempts,
            } => {
                let backoff = ExponentialBackoffBuilder::new()
                    .with_initial_interval(Duration::from_millis(*initial_ms))
                    .with_max_interval(Duration::from_millis(*max_ms))
                    .with_multiplier(*multiplier)
                    .with_randomization_factor(*jitter)
                    .with_max_elapsed_time(None)
                    .build();

                ReconnectSchedule {
                    backoff: Box::new(backoff),
                    attempts: 0,
                    max_attempts: *max_attempts,
                }
            }
        }
    }
}

/// Delays of one reconnection sequence.
pub struct ReconnectSchedule {
    backoff: Box<dyn Backoff + Send>,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl ReconnectSchedule {
    /// Delay before the next attempt, `None` once the attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        self.attempts += 1;
        self.backoff.next_backoff()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
