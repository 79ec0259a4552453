//! Scoped transport buffer widening.
//!
//! The transport runs with a small default capacity so short command/response
//! exchanges stay fast. Anything that may not fit (a serialized waveform, a
//! long catalog listing) is wrapped in [`with_buffer`], which widens the
//! relevant direction, runs the transfer and then restores the previous
//! capacity whether or not the transfer succeeded.

use crate::error::AppResult;
use crate::transport::{BufferDirection, Transport};
use futures::future::BoxFuture;

/// Run `op` with the `direction` capacity of `transport` set to at least
/// `size_bytes`.
///
/// When the current capacity already fits, `op` runs without touching the
/// transport. Otherwise the capacity is raised and the transport reopened,
/// `op` runs, and the previous capacity is put back (with another reopen)
/// even if `op` failed.
///
/// # Errors
/// Returns the error of `op` if it failed; otherwise any error raised while
/// widening or restoring.
///
/// # Example
/// ```no_run
/// # use rust_fgen::buffer::with_buffer;
/// # use rust_fgen::transport::{BufferDirection, MockFunctionGenerator, Transport};
/// # async fn demo() -> rust_fgen::error::AppResult<()> {
/// let mut transport = MockFunctionGenerator::new();
/// let payload = "SOUR1:DATA:ARB:DAC ramp,0,1,2,3,4,5,6,7".to_string();
/// with_buffer(&mut transport, BufferDirection::Output, 4096, move |t| {
///     Box::pin(async move { t.write(&payload).await })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_buffer<T, R, F>(
    transport: &mut T,
    direction: BufferDirection,
    size_bytes: usize,
    op: F,
) -> AppResult<R>
where
    T: Transport,
    F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, AppResult<R>>,
{
    let previous = transport.buffer_capacity(direction);
    if size_bytes <= previous {
        return op(transport).await;
    }

    tracing::debug!(%direction, from = previous, to = size_bytes, "Widening transport buffer");
    transport.set_buffer_capacity(direction, size_bytes);
    if let Err(e) = transport.reopen().await {
        restore(transport, direction, previous).await.ok();
        return Err(e);
    }

    let result = op(transport).await;
    let restored = restore(transport, direction, previous).await;

    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_err)) => {
            tracing::error!(error = %restore_err, "Failed to restore transport buffer after failed transfer");
            Err(e)
        }
    }
}

async fn restore<T: Transport>(
    transport: &mut T,
    direction: BufferDirection,
    capacity: usize,
) -> AppResult<()> {
    transport.set_buffer_capacity(direction, capacity);
    transport.reopen().await?;
    tracing::debug!(%direction, capacity, "Transport buffer restored");
    Ok(())
}
