use crate::gateway::event::ServerEvent;
use crate::gateway::registry::{ConnectionId, ConnectionRegistry};

/// Fans an event out to every connection currently subscribed to the
/// room, minus the excluded one. Snapshot-then-iterate: the subscriber
/// set is read once, then each delivery is an independent enqueue. A
/// connection that disconnected between snapshot and delivery is
/// skipped without affecting the rest of the batch.
///
/// Returns the number of connections the event was enqueued for.
pub async fn publish(
    registry: &ConnectionRegistry,
    room_id: &str,
    event: ServerEvent,
    exclude: Option<ConnectionId>,
) -> usize {
    let targets = registry.delivery_targets(room_id, exclude).await;

    let mut delivered = 0;
    for (id, sender) in targets {
        if sender.send(event.clone()).is_err() {
            tracing::debug!("skipped delivery to closed connection {id}");
        } else {
            delivered += 1;
        }
    }
    delivered
}
