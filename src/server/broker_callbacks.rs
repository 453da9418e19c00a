use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::comms::message::Message;

/// The seam between the comm server and whatever owns the variable table. The server calls
///  these from its single dispatch task, so implementations see one client event at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerCallbacks: Send + Sync + 'static {
    /// Processes one inbound packet's messages (`Null` included, `Timing` excluded) and returns
    ///  the messages to send back to this client in the reply.
    async fn on_rx(&self, client: &str, messages: Vec<Message>) -> Vec<Message>;

    /// Drains the client's held mail, used for unsolicited pushes to asynchronous clients
    async fn fetch_all_mail(&self, client: &str) -> Vec<Message>;

    async fn on_connect(&self, client: &str);

    /// called exactly once per connection that got past the handshake
    async fn on_disconnect(&self, client: &str);
}
