use anyhow::anyhow;
use std::any::Any;

/// Turn a panic payload caught by `catch_unwind` into an error.
///
/// Payloads are usually a `&'static str` or a `String`. Anything else gets a
/// generic message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
