use std::future::Future;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};

/// Run `tasks` with at most `max_concurrency` in flight, returning results
/// in submission order regardless of completion order.
///
/// A finished task (success or failure alike) immediately frees its slot for
/// the next queued one. With `progress_bar_name` set, a progress bar ticks
/// once per completed task; `keep_progress_bar` leaves the finished bar
/// visible instead of clearing it.
///
/// Failure tolerance is the caller's choice of `T`: use `T = Result<..>` to
/// capture per-task errors in their slots, or [`try_gather_with_concurrency`]
/// to abort the batch on the first error.
pub async fn gather_with_concurrency<T, Fut>(
    max_concurrency: usize,
    tasks: Vec<Fut>,
    progress_bar_name: Option<&str>,
    keep_progress_bar: bool,
) -> Vec<T>
where
    Fut: Future<Output = T>,
{
    let progress = progress_bar(tasks.len() as u64, progress_bar_name);
    let progress_ref = &progress;
    let results = stream::iter(tasks.into_iter().map(|task| async move {
        let result = task.await;
        progress_ref.inc(1);
        result
    }))
    .buffered(max_concurrency.max(1))
    .collect::<Vec<T>>()
    .await;
    finish(progress, keep_progress_bar);
    results
}

/// Like [`gather_with_concurrency`], but the first task error cancels all
/// remaining tasks and is propagated.
pub async fn try_gather_with_concurrency<T, E, Fut>(
    max_concurrency: usize,
    tasks: Vec<Fut>,
    progress_bar_name: Option<&str>,
    keep_progress_bar: bool,
) -> Result<Vec<T>, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let progress = progress_bar(tasks.len() as u64, progress_bar_name);
    let progress_ref = &progress;
    let results = stream::iter(tasks.into_iter().map(|task| async move {
        let result = task.await;
        progress_ref.inc(1);
        result
    }))
    .buffered(max_concurrency.max(1))
    .try_collect::<Vec<T>>()
    .await;
    finish(progress, keep_progress_bar && results.is_ok());
    results
}

fn progress_bar(total: u64, name: Option<&str>) -> ProgressBar {
    match name {
        Some(name) => {
            let bar = ProgressBar::new(total);
            bar.set_style(ProgressStyle::default_bar());
            bar.set_message(name.to_string());
            bar
        }
        None => ProgressBar::hidden(),
    }
}

fn finish(progress: ProgressBar, keep: bool) {
    if keep {
        progress.finish();
    } else {
        progress.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    /// Tracks the number of concurrently-active tasks and the observed peak.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_bound() {
        let n = 8;
        for k in 1..=n {
            let gauge = Arc::new(Gauge::default());
            let tasks = (0..n)
                .map(|i| {
                    let gauge = gauge.clone();
                    async move {
                        gauge.enter();
                        sleep(Duration::from_millis(10 + i as u64)).await;
                        gauge.exit();
                        i
                    }
                })
                .collect::<Vec<_>>();
            let results = gather_with_concurrency(k, tasks, None, false).await;
            assert_eq!(results, (0..n).collect::<Vec<_>>());
            assert!(gauge.peak.load(Ordering::SeqCst) <= k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_submission_order() {
        let n = 6u64;
        let tasks = (0..n)
            .map(|i| async move {
                // later submissions complete first
                sleep(Duration::from_millis(10 * (n - i))).await;
                i
            })
            .collect::<Vec<_>>();
        let results = gather_with_concurrency(n as usize, tasks, None, false).await;
        assert_eq!(results, (0..n).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn captures_errors_per_slot() {
        let tasks = (0..4)
            .map(|i| async move {
                sleep(Duration::from_millis(5)).await;
                if i == 2 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i)
                }
            })
            .collect::<Vec<_>>();
        let results = gather_with_concurrency(2, tasks, None, false).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[2], Err("task 2 failed".to_string()));
        assert_eq!(results[3], Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn first_error_cancels_unstarted_tasks() {
        let later_ran = Arc::new(AtomicBool::new(false));
        let flag = later_ran.clone();
        let failing = async { Err::<(), _>("boom") };
        let queued = async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        };
        let result = try_gather_with_concurrency(1, vec![
            Box::pin(failing) as std::pin::Pin<Box<dyn Future<Output = _>>>,
            Box::pin(queued),
        ], None, false)
        .await;
        assert_eq!(result, Err("boom"));
        assert!(!later_ran.load(Ordering::SeqCst));
    }
}
