//! Resilience primitives for the data sink
//!
//! This library provides the retry building blocks used by the forwarder:
//! - **Backoff**: Exponential delay schedule with a cap and optional jitter
//! - **Retry**: Bounded retries of a fallible async operation
//! - **Timeout**: Time limits on external calls that keep the inner error
//! - **Presets**: Pre-tuned settings for Kafka, MongoDB and dead-letter publishing
//!
//! # Example: Retry a storage call
//!
//! ```rust,no_run
//! use resilience::{presets, with_retry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = presets::document_store_connect();
//!
//!     let result = with_retry(&config, || async {
//!         // Your storage call here
//!         Ok::<_, String>(())
//!     })
//!     .await;
//! }
//! ```
//!
//! # Example: Exponential wait between failures
//!
//! ```rust
//! use resilience::{Backoff, BackoffConfig};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(BackoffConfig {
//!     initial: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     multiplier: 2.0,
//!     jitter: false,
//! });
//!
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! ```

pub mod backoff;
pub mod presets;
pub mod retry;
pub mod timeout;

pub use backoff::{Backoff, BackoffConfig};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutError};
