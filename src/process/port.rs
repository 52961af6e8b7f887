/// Linked message-port pairs
///
/// A `MessageChannel` yields two ports wired to each other: whatever is
/// posted on one end is received on the other. One end is transferred to a
/// worker, the other stays with whoever asked for the private channel.
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
pub struct MessagePort {
    id: Uuid,
    peer: Uuid,
    tx: mpsc::UnboundedSender<Value>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl MessagePort {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the port on the other end of the channel
    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    /// Post a message to the other end
    /// Returns false once the other end has been dropped
    pub fn post_message(&self, message: Value) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Receive the next message from the other end
    /// Returns None once the other end has been dropped and drained
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

pub struct MessageChannel;

impl MessageChannel {
    /// Create a linked pair of ports
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let left_id = Uuid::new_v4();
        let right_id = Uuid::new_v4();

        (
            MessagePort {
                id: left_id,
                peer: right_id,
                tx: right_tx,
                rx: left_rx,
            },
            MessagePort {
                id: right_id,
                peer: left_id,
                tx: left_tx,
                rx: right_rx,
            },
        )
    }
}
