// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::ready;
use futures::stream::repeat_with;
use tempstash_error::{make_err, Code, Error};
use tempstash_util::retry::{ExponentialBackoff, Retrier, RetryResult};

const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Simulates a blob backend whose write endpoint refuses the first
/// `outage_len` attempts with a transient error and accepts the next one.
/// `attempts` counts every call, successful or not.
fn flaky_put(
    attempts: Arc<AtomicUsize>,
    outage_len: usize,
) -> impl FnMut() -> RetryResult<String> {
    move || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= outage_len {
            return RetryResult::Retry(make_err!(
                Code::Unavailable,
                "Blob backend refused write on attempt {attempt}"
            ));
        }
        RetryResult::Ok(format!("stored-on-attempt-{attempt}"))
    }
}

/// A retrier whose sleeps resolve immediately, so tests only observe the
/// attempt bookkeeping.
fn no_sleep_retrier() -> Retrier {
    Retrier::new(Box::new(|_duration| Box::pin(ready(()))))
}

#[cfg(test)]
mod retry_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn healthy_backend_writes_on_the_first_attempt() -> Result<(), Error> {
        let retrier = no_sleep_retrier();
        let attempts = Arc::new(AtomicUsize::new(0));

        let stored = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(5),
                repeat_with(flaky_put(attempts.clone(), 0)),
            )
            .await?;
        assert_eq!(stored, "stored-on-attempt-1");
        assert_eq!(
            attempts.load(Ordering::Relaxed),
            1,
            "A healthy backend must not be asked twice"
        );
        Ok(())
    }

    #[tokio::test]
    async fn transient_outage_recovers_within_the_budget() -> Result<(), Error> {
        let retrier = no_sleep_retrier();
        let attempts = Arc::new(AtomicUsize::new(0));

        // Two refusals, then the write lands; the budget of 5 retries is
        // not exhausted.
        let stored = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(5),
                repeat_with(flaky_put(attempts.clone(), 2)),
            )
            .await?;
        assert_eq!(stored, "stored-on-attempt-3");
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[tokio::test]
    async fn write_fails_once_the_retry_budget_is_exhausted() -> Result<(), Error> {
        let retrier = no_sleep_retrier();
        let attempts = Arc::new(AtomicUsize::new(0));

        // The outage outlasts the budget: 1 initial attempt + 3 retries.
        let result = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(3),
                repeat_with(flaky_put(attempts.clone(), usize::MAX)),
            )
            .await;
        assert_eq!(
            attempts.load(Ordering::Relaxed),
            4,
            "Expected the initial attempt plus every budgeted retry"
        );
        let err = result.unwrap_err();
        assert_eq!(err.code, Code::Unavailable, "Got: {err:?}");
        assert!(
            err.message_string().contains("refused write on attempt 4"),
            "The surfaced error must be the last attempt's, got: {err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() -> Result<(), Error> {
        let retrier = no_sleep_retrier();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_op = attempts.clone();

        // A missing record is a fact, not a fault; retrying cannot help.
        let result = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(5),
                repeat_with(move || {
                    attempts_in_op.fetch_add(1, Ordering::Relaxed);
                    RetryResult::<String>::Err(make_err!(
                        Code::NotFound,
                        "Record stash-42 does not exist"
                    ))
                }),
            )
            .await;
        assert_eq!(
            attempts.load(Ordering::Relaxed),
            1,
            "Permanent failures must stop the loop immediately"
        );
        assert_eq!(result.unwrap_err().code, Code::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn backoff_doubles_between_attempts() -> Result<(), Error> {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let slept_in_fn = slept.clone();
        let retrier = Retrier::new(Box::new(move |duration| {
            let slept_in_fn = slept_in_fn.clone();
            Box::pin(async move {
                slept_in_fn.lock().unwrap().push(duration);
            })
        }));
        let attempts = Arc::new(AtomicUsize::new(0));

        let result = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(3),
                repeat_with(flaky_put(attempts.clone(), usize::MAX)),
            )
            .await;
        assert!(result.is_err(), "The outage never ends, got: {result:?}");
        assert_eq!(
            *slept.lock().unwrap(),
            vec![
                BACKOFF_BASE,
                BACKOFF_BASE * 2,
                BACKOFF_BASE * 4,
            ],
            "Each retry must wait twice as long as the previous one"
        );
        Ok(())
    }

    #[tokio::test]
    async fn no_sleep_happens_before_the_first_attempt() -> Result<(), Error> {
        let sleep_count = Arc::new(AtomicUsize::new(0));
        let sleep_count_in_fn = sleep_count.clone();
        let retrier = Retrier::new(Box::new(move |_duration| {
            let sleep_count_in_fn = sleep_count_in_fn.clone();
            Box::pin(async move {
                sleep_count_in_fn.fetch_add(1, Ordering::Relaxed);
            })
        }));
        let attempts = Arc::new(AtomicUsize::new(0));

        // One refusal, one success: exactly one sleep in between.
        Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(BACKOFF_BASE).take(5),
                repeat_with(flaky_put(attempts.clone(), 1)),
            )
            .await?;
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(
            sleep_count.load(Ordering::Relaxed),
            1,
            "The first attempt runs without any delay"
        );
        Ok(())
    }
}
