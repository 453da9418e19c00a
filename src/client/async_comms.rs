use async_trait::async_trait;
use tokio::select;
use tokio::time::sleep;
use tracing::trace;

use crate::client::comm_client::{ClientCore, CommsStrategy};
use crate::comms::message::{Message, MessageType};
use crate::comms::packet::Packet;
use crate::comms::protocol::ASYNC_TIMING_KEY;
use crate::comms::transport::{Connection, PacketReader, PacketWriter};
use crate::error::MoosError;

/// Reader and writer run independently. Posting wakes the writer up right away, and the
///  server pushes mail as soon as it is written. Round trips are measured with timing probes
///  that the server echoes.
pub(crate) struct AsyncComms;

#[async_trait]
impl CommsStrategy for AsyncComms {
    fn is_asynchronous(&self) -> bool {
        true
    }

    async fn run(&self, core: &ClientCore, connection: Connection) -> anyhow::Result<()> {
        let Connection { reader, writer, .. } = connection;

        // whichever side fails first takes the connection down
        select! {
            result = write_loop(core, writer) => result,
            result = read_loop(core, reader) => result,
        }
    }
}

async fn write_loop(core: &ClientCore, mut writer: PacketWriter) -> anyhow::Result<()> {
    let timing_interval = core.config.async_timing_interval.as_secs_f64();
    let mut last_probe = f64::NEG_INFINITY;

    loop {
        let mut messages = core.take_outgoing().await;

        let now = core.runtime.local_time();
        if now - last_probe >= timing_interval {
            messages.insert(0, Message::new_double(MessageType::Timing, ASYNC_TIMING_KEY, 0.0, now));
            last_probe = now;
        }

        let packet = Packet::new(messages);
        writer.write_packet(&packet).await?;
        core.record_sent(&packet);

        select! {
            _ = core.outbox_signal.notified() => {}
            _ = sleep(core.comms_tick()) => {}
        }
    }
}

/// The server answers every packet we send, and we send at least once per tick: silence for
///  longer than the read timeout means the connection is gone.
async fn read_loop(core: &ClientCore, mut reader: PacketReader) -> anyhow::Result<()> {
    loop {
        let packet = reader.read_packet_timeout(core.config.read_timeout).await?
            .ok_or_else(|| MoosError::Timeout("waiting for data from the server".to_string()))?;
        trace!(num_messages = packet.messages.len(), "received packet");
        core.on_packet(packet, None).await;
    }
}
