//! Utility functions for the sketch orchestrator
//!
//! This module provides utility functions used throughout the workspace.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        let millis = duration.subsec_millis();
        if millis == 0 {
            return format!("{}us", duration.subsec_micros());
        }
        return format!("{}ms", millis);
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();
    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }
    if minutes > 0 || hours > 0 {
        result.push_str(&format!("{}m ", minutes));
    }
    result.push_str(&format!("{}s", seconds));

    result
}

/// Runs a future under a deadline, cancelling `token` if the deadline passes
///
/// The future is dropped on timeout and the token is cancelled so that any work
/// the future spawned, and which observes the token, also stops.
///
/// # Examples
///
/// ```
/// use common::utils::execute_with_deadline;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test_block_on(async {
/// let token = CancellationToken::new();
/// let result = execute_with_deadline(
///     async { Ok(42) },
///     Duration::from_secs(1),
///     &token,
///     "example operation",
/// ).await.unwrap();
/// assert_eq!(result, 42);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub async fn execute_with_deadline<T, F>(
    future: F,
    duration: Duration,
    token: &CancellationToken,
    operation_name: &str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled(format!(
            "Operation '{}' was cancelled",
            operation_name
        ))),
        outcome = timeout(duration, future) => match outcome {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(Error::InferenceTimeout(format!(
                    "Operation '{}' timed out after {}",
                    operation_name,
                    format_duration(duration)
                )))
            }
        },
    }
}

/// Returns an error if the token has been cancelled
pub fn ensure_not_cancelled(token: &CancellationToken, what: &str) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled(format!("{} cancelled", what)))
    } else {
        Ok(())
    }
}
