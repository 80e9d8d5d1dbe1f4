//! Crawl error taxonomy and the retry classifier.

use std::time::Duration;

use thiserror::Error;

/// Sentinel errors shared across the politeness gate and the processors.
///
/// The permanent variants are policy decisions and must never be retried;
/// `DelayRequired` carries the remaining politeness wait.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The host's robots.txt forbids fetching this path.
    #[error("robots.txt disallows crawling")]
    RobotsDisallowed,

    /// Content tripped the prompt-injection screen in fail-hard mode.
    #[error("security policy violation: potential prompt injection")]
    SecurityViolation,

    /// The base domain hit its page quota.
    #[error("domain crawl quota exceeded")]
    QuotaExceeded,

    /// The politeness penalty has not elapsed yet.
    #[error("politeness delay required: wait {:.2}s", .wait.as_secs_f64())]
    DelayRequired {
        /// Remaining wait before the URL may be retried.
        wait: Duration,
    },
}

/// Classifies an error chain as retryable and yields the wait duration.
///
/// Wrapped errors are unwrapped through the full `anyhow` context chain so
/// nesting depth never hides a sentinel. Unknown errors default to retryable
/// with zero wait: transport-level failures should be redelivered.
pub fn is_retryable(err: &anyhow::Error) -> (bool, Duration) {
    for cause in err.chain() {
        if let Some(crawl) = cause.downcast_ref::<CrawlError>() {
            return match crawl {
                CrawlError::DelayRequired { wait } => (true, *wait),
                CrawlError::RobotsDisallowed
                | CrawlError::SecurityViolation
                | CrawlError::QuotaExceeded => (false, Duration::ZERO),
            };
        }
    }
    (true, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_required_is_retryable_with_wait() {
        let err = anyhow::Error::new(CrawlError::DelayRequired {
            wait: Duration::from_secs(3),
        });
        let (retry, wait) = is_retryable(&err);
        assert!(retry);
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn permanent_sentinels_are_not_retryable() {
        for err in [
            CrawlError::RobotsDisallowed,
            CrawlError::SecurityViolation,
            CrawlError::QuotaExceeded,
        ] {
            let (retry, wait) = is_retryable(&anyhow::Error::new(err));
            assert!(!retry);
            assert_eq!(wait, Duration::ZERO);
        }
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        let err = anyhow::anyhow!("random error");
        let (retry, wait) = is_retryable(&err);
        assert!(retry);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn wrapped_sentinels_are_detected() {
        let err = anyhow::Error::new(CrawlError::DelayRequired {
            wait: Duration::from_millis(1500),
        })
        .context("layer 1")
        .context("layer 2");

        let (retry, wait) = is_retryable(&err);
        assert!(retry);
        assert!(wait > Duration::ZERO);

        let err = anyhow::Error::new(CrawlError::RobotsDisallowed).context("processor failed");
        let (retry, _) = is_retryable(&err);
        assert!(!retry);
    }

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(
            CrawlError::RobotsDisallowed.to_string(),
            "robots.txt disallows crawling"
        );
        assert_eq!(
            CrawlError::SecurityViolation.to_string(),
            "security policy violation: potential prompt injection"
        );
        assert_eq!(
            CrawlError::DelayRequired {
                wait: Duration::from_secs(3)
            }
            .to_string(),
            "politeness delay required: wait 3.00s"
        );
    }
}
