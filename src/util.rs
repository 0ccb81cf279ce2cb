use std::any::Any;
use std::future::Future;

use anyhow::anyhow;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};

/// Try to figure out what's in the box, and print it if we can.
///
/// The actual error type we will get from `panic::catch_unwind` is really poorly documented.
/// However, the `panic::set_hook` functions deal with a `PanicInfo` type, and its payload is
/// documented as "commonly, but not always, the associated payload of the `panic!` macro",
/// which is typically a string.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(x) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {x}")
    } else if let Some(x) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {x}")
    } else {
        anyhow!("job panicked")
    }
}

/// Wrap a job execution in a sentry transaction so failures show up with
/// the job type attached.
pub(crate) async fn with_sentry_transaction<F, R, E, Fut>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Hub::new_from_top(Hub::current());
    let client_options = hub.client().as_ref().map(|client| client.options().clone());

    let tx_ctx = TransactionContext::new(transaction_name, "queue.task");
    let transaction = sentry_core::start_transaction(tx_ctx);

    hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

    let result = callback().bind_hub(hub).await;

    if client_options.is_some_and(|options| options.traces_sample_rate > 0.0) {
        transaction.set_status(match result.is_ok() {
            true => sentry_core::protocol::SpanStatus::Ok,
            false => sentry_core::protocol::SpanStatus::UnknownError,
        });
    }
    transaction.finish();

    result
}
