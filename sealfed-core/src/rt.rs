use once_cell::sync::Lazy;
use tokio::runtime::{self, Handle, RuntimeFlavor};

static RUNTIME: Lazy<runtime::Runtime> = Lazy::new(|| {
    runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("sealfed-http")
        .build()
        .expect("build sealfed runtime")
});

/// Drive a future to completion from blocking code.
///
/// Inside a multi-threaded tokio runtime the current worker is handed over with
/// `block_in_place`. A current-thread runtime cannot do that, so the future is sent to
/// the crate's own runtime and the caller blocks on the result.
pub fn sync_await<F>(fut: F) -> F::Output
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        Ok(_) => {
            let (tx, rx) = std::sync::mpsc::channel();
            RUNTIME.spawn(async move {
                let _ = tx.send(fut.await);
            });
            rx.recv().expect("sealfed runtime dropped a pending request")
        }
        Err(_) => RUNTIME.block_on(fut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_outside_any_runtime() {
        assert_eq!(sync_await(async { 7 }), 7);
    }

    #[test]
    fn runs_inside_current_thread_runtime() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let value = rt.block_on(async { sync_await(async { "inner" }) });
        assert_eq!(value, "inner");
    }
}
