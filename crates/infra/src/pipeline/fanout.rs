//! Bounded fan-out inside a single stage.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Run `f` over `items` with at most `limit` calls in flight.
///
/// Results come back in input order. After the first error no further items
/// are started; calls already in flight are allowed to finish and the first
/// error is returned.
pub async fn for_each_bounded<T, R, E, F, Fut>(
    items: Vec<T>,
    limit: usize,
    f: F,
) -> Result<Vec<R>, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: From<JoinError> + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let f = Arc::new(f);
    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    let mut first_err: Option<E> = None;
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        while let Some(done) = tasks.try_join_next() {
            record(done, &mut slots, &mut first_err);
        }
        if first_err.is_some() {
            break;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let f = f.clone();
        tasks.spawn(async move {
            let _permit = permit;
            (index, f(item).await)
        });
    }

    while let Some(done) = tasks.join_next().await {
        record(done, &mut slots, &mut first_err);
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(slots.into_iter().flatten().collect())
}

fn record<R, E: From<JoinError>>(
    done: Result<(usize, Result<R, E>), JoinError>,
    slots: &mut [Option<R>],
    first_err: &mut Option<E>,
) {
    match done {
        Ok((index, Ok(value))) => slots[index] = Some(value),
        Ok((_, Err(err))) => {
            first_err.get_or_insert(err);
        }
        Err(join) => {
            first_err.get_or_insert(E::from(join));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Bad(u32),
        Aborted,
    }

    impl From<JoinError> for TestError {
        fn from(_: JoinError) -> Self {
            TestError::Aborted
        }
    }

    #[tokio::test]
    async fn preserves_input_order() {
        let out = for_each_bounded((0u64..20).collect(), 4, |n| async move {
            tokio::time::sleep(Duration::from_millis(20 - n)).await;
            Ok::<_, TestError>(n * 2)
        })
        .await
        .unwrap();
        assert_eq!(out, (0u64..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_the_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, b) = (in_flight.clone(), peak.clone());

        for_each_bounded((0..32).collect::<Vec<u32>>(), 3, move |_| {
            let in_flight = a.clone();
            let peak = b.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stops_starting_work_after_an_error() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let result = for_each_bounded((0..100).collect::<Vec<u32>>(), 1, move |n| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 2 { Err(TestError::Bad(n)) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Err(TestError::Bad(2)));
        assert!(started.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn empty_input_is_fine() {
        let out = for_each_bounded(Vec::<u8>::new(), 0, |n| async move { Ok::<_, TestError>(n) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
