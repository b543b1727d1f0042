//! Inbound-message loop: one line at a time from the device, routed to the
//! manager, with the resulting command bytes written straight back.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::channel::ActuationChannel;
use crate::clock::Clock;
use crate::manager::{AckOutcome, EffectorManager};
use crate::persist::{EffectorRow, Recorder, Row};
use crate::protocol::{decode, Inbound};

/// Pause after a failed read before reading again.
const READ_RETRY_DELAY: Duration = if cfg!(test) {
    Duration::from_millis(10)
} else {
    Duration::from_secs(2)
};

/// Run until the device link closes. A failed read is logged and retried;
/// only a closed link ends the loop, as an error.
pub async fn run<Ch, C>(
    manager: &mut EffectorManager<C>,
    channel: &mut Ch,
    recorder: &Recorder,
    self_test_byte: Option<u8>,
) -> Result<()>
where
    Ch: ActuationChannel,
    C: Clock,
{
    if let Some(byte) = self_test_byte {
        info!(byte = %char::from(byte), "requesting effector self-test");
        if let Err(e) = channel.send(byte).await {
            error!("self-test request failed: {e:#}");
        }
    }

    loop {
        match channel.recv_line().await {
            Ok(Some(line)) => handle_line(manager, channel, recorder, &line).await,
            Ok(None) => anyhow::bail!("device link closed"),
            Err(e) => {
                error!("device read failed: {e:#}");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

/// Process one inbound line to completion.
pub async fn handle_line<Ch, C>(
    manager: &mut EffectorManager<C>,
    channel: &mut Ch,
    recorder: &Recorder,
    line: &[u8],
) where
    Ch: ActuationChannel,
    C: Clock,
{
    match decode(line) {
        Inbound::Sensor(text) => {
            let snapshot = match manager.ingest_sensor_line(text) {
                Ok(s) => s,
                Err(e) => {
                    error!(
                        line = text,
                        kept = ?manager.snapshot().map(|s| s.captured_at),
                        "rejected sensor line: {e}"
                    );
                    return;
                }
            };

            let commands = manager.manage(&snapshot);
            debug!(
                sending = commands.len(),
                in_flight = manager.tracker().len(),
                pending = ?manager.pending_commands(),
                drying = ?manager.drying_phase(),
                "cycle complete"
            );
            for command in commands {
                // A failed write keeps its tracker record, so the timeout
                // path resends it.
                if let Err(e) = channel.send(command.byte()).await {
                    error!(?command, "command write failed: {e:#}");
                }
            }

            recorder.record(Row::Sensor(snapshot));
            recorder.record(Row::Effectors(EffectorRow::capture(manager)));
        }
        Inbound::Ack(command) => {
            if let AckOutcome::Confirmed(..) = manager.acknowledge(command) {
                recorder.record(Row::Effectors(EffectorRow::capture(manager)));
            }
        }
        Inbound::DeviceLog(text) => info!(target: "device", "{text}"),
        Inbound::Empty => debug!("empty line"),
        Inbound::Unknown(bytes) => {
            error!(line = %String::from_utf8_lossy(bytes), "unknown message, dropped");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
