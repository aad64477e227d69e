use std::future::Future;
use std::time::Instant;

/// Reports the timing of one future, see [`measure`].
struct Timing {
    task_name: &'static str,
    created: Instant,
    status: Option<&'static str>,
}

impl Timing {
    fn new(task_name: &'static str) -> Self {
        Self {
            task_name,
            created: Instant::now(),
            status: None,
        }
    }

    fn first_poll(&self) {
        metric!(
            timer("futures.wait_time") = self.created.elapsed(),
            "task_name" => self.task_name,
        );
    }
}

impl Drop for Timing {
    fn drop(&mut self) {
        metric!(
            timer("futures.done") = self.created.elapsed(),
            "task_name" => self.task_name,
            "status" => self.status.unwrap_or("canceled"),
        );
    }
}

/// Measures the timing of a future and reports metrics.
///
///  - `futures.wait_time`: Time between creation of the future and the first poll.
///  - `futures.done`: Time between creation of the future and completion, tagged with the
///    status derived by `get_status`, or `"canceled"` if the future is dropped early.
///
/// See the [`m`] module for status helpers.
pub fn measure<F, S>(
    task_name: &'static str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
    S: FnOnce(&F::Output) -> &'static str,
{
    let mut timing = Timing::new(task_name);

    async move {
        timing.first_poll();
        let output = f.await;
        timing.status = Some(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    use crate::fetch::FetchResult;

    /// `"ok"` or `"err"`, depending on the result.
    pub fn result<T, E>(result: &Result<T, E>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(_) => "err",
        }
    }

    /// Like [`result`], but `"timeout"` if the future timed out.
    pub fn timed_result<T, E>(
        result: &Result<Result<T, E>, tokio::time::error::Elapsed>,
    ) -> &'static str {
        match result {
            Ok(inner) => self::result(inner),
            Err(_) => "timeout",
        }
    }

    /// `"ok"`, or the kind of fetch error.
    pub fn fetch(result: &FetchResult) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(error) => error.metrics_tag(),
        }
    }
}
