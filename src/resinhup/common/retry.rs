use log::warn;
use rand::Rng;
use std::ops::Range;
use std::thread::sleep;
use std::time::Duration;

use crate::common::{UpdError, UpdErrorKind};

// Drives a fallible operation up to max_attempts times, sleeping a
// uniformly random number of seconds from backoff_secs before every
// attempt except the first. The first success short-circuits the
// remaining attempts.
pub(crate) fn retry_with_backoff<T, F>(
    max_attempts: u32,
    backoff_secs: Range<u64>,
    mut op: F,
) -> Result<T, UpdError>
where
    F: FnMut(u32) -> Result<T, UpdError>,
{
    let mut last_error: Option<UpdError> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = rand::thread_rng().gen_range(backoff_secs.clone());
            warn!(
                "Attempt {} of {} failed, retrying after {} seconds",
                attempt - 1,
                max_attempts,
                delay
            );
            sleep(Duration::from_secs(delay));
        }

        match op(attempt) {
            Ok(result) => return Ok(result),
            Err(why) => {
                warn!("Attempt {} of {} failed: {}", attempt, max_attempts, why);
                last_error = Some(why);
            }
        }
    }

    Err(UpdError::from_remark(
        UpdErrorKind::FetchExhausted,
        &format!(
            "all {} attempts failed, last error: {:?}",
            max_attempts, last_error
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::retry_with_backoff;
    use crate::common::{UpdError, UpdErrorKind};

    #[test]
    fn first_success_makes_one_call() {
        let mut calls = 0;
        let res = retry_with_backoff(3, 0..1, |_attempt| {
            calls += 1;
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(calls, 1);
    }

    #[test]
    fn success_on_last_attempt() {
        let mut calls = 0;
        let res = retry_with_backoff(3, 0..1, |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(UpdError::from_remark(UpdErrorKind::Upstream, "transient"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhaustion_is_bounded() {
        let mut calls = 0;
        let res: Result<(), UpdError> = retry_with_backoff(3, 0..1, |_attempt| {
            calls += 1;
            Err(UpdError::from_remark(UpdErrorKind::Upstream, "permanent"))
        });
        assert_eq!(calls, 3);
        assert_eq!(res.unwrap_err().kind(), UpdErrorKind::FetchExhausted);
    }
}
