use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Runs `callback` inside a Sentry performance transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "workqueue.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turns the payload of a caught panic into an error message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: boom"
        );

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: kaboom"
        );

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked");
    }

    #[tokio::test]
    async fn transaction_passes_result_through() {
        let ok: Result<u8, &str> = with_sentry_transaction("test", || async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));

        let err: Result<u8, &str> = with_sentry_transaction("test", || async { Err("no") }).await;
        assert_eq!(err, Err("no"));
    }
}
