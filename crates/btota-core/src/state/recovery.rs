//! Stale-input drain used before a pull is resumed.
//!
//! After a sequence or integrity error the host keeps streaming the rest of
//! the abandoned pull. Those bytes are discarded until the stream has been
//! quiet for a window that scales with what was still outstanding.

use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::constants::DRAIN_BYTES_PER_MS;
use crate::session::SessionConfig;
use crate::transport::{ByteSource, OtaTransport, TransportReader};

/// Quiet period required before resuming: `remaining / 50` ms on top of the
/// configured base, which is also the floor of the window.
pub fn drain_window(remaining: u32, config: &SessionConfig) -> Duration {
    Duration::from_millis(u64::from(remaining) / DRAIN_BYTES_PER_MS + config.drain_base_ms)
}

/// Discard input until nothing has arrived for `window`.
///
/// The quiet timer restarts whenever bytes are drained. Returns the number of
/// bytes discarded.
pub fn drain_stale_input<T: OtaTransport + ?Sized>(
    transport: &T,
    window: Duration,
    poll: Duration,
) -> Result<usize> {
    let poll = poll.max(Duration::from_millis(1));
    let mut drained = 0usize;
    let mut quiet = Duration::ZERO;

    debug!(window_ms = window.as_millis() as u64, "Draining stale input");
    while quiet < window {
        let pending = transport.available();
        if pending > 0 {
            TransportReader::new(transport).skip(pending)?;
            drained += pending;
            quiet = Duration::ZERO;
        }
        thread::sleep(poll);
        quiet += poll;
    }

    if drained > 0 {
        info!(drained, "Discarded stale input");
    }
    Ok(drained)
}
