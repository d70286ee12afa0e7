use gantry_core::events::Event;
use gantry_core::ports::EventBus;
use tracing::warn;

/// Publish events produced by an already committed change set.
///
/// The state is persisted at this point, so a failed publication is logged
/// and does not fail the pass.
pub(crate) async fn publish_all(bus: &dyn EventBus, events: Vec<Event>) {
    for event in events {
        let subject = event.subject();
        if let Err(e) = bus.publish(event).await {
            warn!(subject = %subject, error = %e, "Failed to publish event");
        }
    }
}
