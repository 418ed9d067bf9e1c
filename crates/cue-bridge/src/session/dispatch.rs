//! Inbound topic routing

use crate::registry::{DeviceRegistry, EntityTopics, EntryId};

/// Which light a command applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Aggregate,
    Device(EntryId),
}

/// Destination of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Refresh poke on the aggregate state topic
    AggregateState,
    /// Refresh poke on the control switch state topic
    SwitchState,
    /// Refresh poke on a device state topic
    DeviceState(EntryId),
    /// JSON light command
    Command(Target),
    /// Plain `ON`/`OFF` on the control switch
    SwitchCommand,
    Ignored,
}

/// Resolve a topic; the first matching rule wins
pub fn route(
    topic: &str,
    registry: &DeviceRegistry,
    aggregate: &EntityTopics,
    switch: &EntityTopics,
) -> Route {
    if topic == aggregate.state {
        Route::AggregateState
    } else if topic == switch.state {
        Route::SwitchState
    } else if let Some(id) = registry.find_by_state_topic(topic) {
        Route::DeviceState(id)
    } else if topic == aggregate.command {
        Route::Command(Target::Aggregate)
    } else if let Some(id) = registry.find_by_set_topic(topic) {
        Route::Command(Target::Device(id))
    } else if topic == switch.command {
        Route::SwitchCommand
    } else {
        Route::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSnapshot, Rgb};
    use crate::registry::TopicScheme;

    #[test]
    fn test_routes() {
        let scheme = TopicScheme::default();
        let mut registry = DeviceRegistry::new(scheme.clone());
        registry.register(DeviceSnapshot::new("Fan", 0, Rgb::BLACK));
        let aggregate = scheme.aggregate();
        let switch = scheme.control_switch();
        let device = registry.all()[0].topics.clone();

        let r = |topic: &str| route(topic, &registry, &aggregate, &switch);

        assert_eq!(r(&aggregate.state), Route::AggregateState);
        assert_eq!(r(&switch.state), Route::SwitchState);
        assert_eq!(r(&device.state), Route::DeviceState(0));
        assert_eq!(r(&aggregate.command), Route::Command(Target::Aggregate));
        assert_eq!(r(&device.command), Route::Command(Target::Device(0)));
        assert_eq!(r(&switch.command), Route::SwitchCommand);
        assert_eq!(r(&device.config), Route::Ignored);
        assert_eq!(r("homeassistant/status"), Route::Ignored);
    }
}
