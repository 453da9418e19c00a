use async_trait::async_trait;
use tokio::select;
use tokio::time::sleep;

use crate::client::comm_client::{ClientCore, CommsStrategy};
use crate::comms::packet::Packet;
use crate::comms::transport::Connection;
use crate::error::MoosError;

/// Lock-step exchange: once per tick the whole outbox goes out as one packet, and the client
///  waits for the server's reply before doing anything else. The reply's leading `Null` carries
///  the server's transmit time, which together with our send and receive times feeds the skew
///  filter.
pub(crate) struct SyncComms;

#[async_trait]
impl CommsStrategy for SyncComms {
    fn is_asynchronous(&self) -> bool {
        false
    }

    async fn run(&self, core: &ClientCore, connection: Connection) -> anyhow::Result<()> {
        let Connection { mut reader, mut writer, .. } = connection;

        loop {
            let packet = Packet::new(core.take_outgoing().await);
            let request_time = core.runtime.local_time();
            writer.write_packet(&packet).await?;
            core.record_sent(&packet);

            let reply = reader.read_packet_timeout(core.config.read_timeout).await?
                .ok_or_else(|| MoosError::Timeout("waiting for the server's reply".to_string()))?;
            core.on_packet(reply, Some(request_time)).await;

            select! {
                _ = sleep(core.comms_tick()) => {}
                _ = core.outbox_signal.notified() => {}
            }
        }
    }
}
