//! Device reset through the modem control lines

use crate::core::context::RuntimeContext;
use crate::core::transport::{drain_input, ByteTransport, TransportError};
use std::time::Duration;
use tracing::{debug, info};

/// How long DTR/RTS are held low
pub const RESET_HOLD: Duration = Duration::from_millis(250);

/// Settle time after the lines come back up
pub const RESET_SETTLE: Duration = Duration::from_millis(50);

/// Pause after flushing boot noise
pub const POST_RESET_PAUSE: Duration = Duration::from_millis(500);

const FLUSH_QUIET: Duration = Duration::from_millis(50);

/// Drive DTR and RTS together
pub async fn set_lines(transport: &mut dyn ByteTransport, asserted: bool) -> Result<(), TransportError> {
    debug!(asserted, "setting control lines");
    transport.set_control_lines(asserted).await
}

/// Pulse the control lines low to reboot the attached microcontroller, then
/// discard whatever it prints while coming up. Returns the discarded bytes.
pub async fn reset_device(
    device: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
) -> Result<Vec<u8>, TransportError> {
    info!(device = %device.describe(), "resetting device");
    set_lines(device, false).await?;
    pause(ctx, RESET_HOLD).await;
    set_lines(device, true).await?;
    pause(ctx, RESET_SETTLE).await;

    let garbage = drain_input(device, FLUSH_QUIET).await?;
    if !garbage.is_empty() {
        debug!(bytes = garbage.len(), "discarded reset noise");
    }
    pause(ctx, POST_RESET_PAUSE).await;
    Ok(garbage)
}

/// Wait `secs` seconds for the device to boot, printing a dot per second
/// on `console` unless the context is quiet. Returns early on quit.
pub async fn wait_for_boot(
    console: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    secs: u64,
) -> Result<(), TransportError> {
    if secs == 0 {
        return Ok(());
    }
    let chatty = !ctx.is_quiet();
    if chatty {
        console.write(b"Waiting for device reset to complete...").await?;
    }
    for _ in 0..secs {
        if !pause(ctx, Duration::from_secs(1)).await {
            break;
        }
        if chatty {
            console.write(b".").await?;
        }
    }
    if chatty {
        console.write(b"\r\n").await?;
    }
    Ok(())
}

/// Sleep unless quit is requested first; false when interrupted
async fn pause(ctx: &RuntimeContext, duration: Duration) -> bool {
    tokio::select! {
        () = ctx.quit_requested() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
