//! Device Registry
//!
//! Owns every bridged device, assigns entity ids and MQTT topics, and answers
//! topic lookups for inbound message routing.
//!
//! The entry list and both topic indices are only touched by
//! [`DeviceRegistry::register`], so they can never drift apart.

use std::collections::HashMap;

use crate::device::{DeviceSnapshot, Rgb};
use crate::discovery::PowerState;

/// Object id of the virtual "all devices" light
pub const AGGREGATE_ID: &str = "all_icue";

/// Object id of the control-priority switch
pub const CONTROL_SWITCH_ID: &str = "icue_control";

/// The three topics every entity owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTopics {
    /// Retained state, also subscribed to as a refresh poke
    pub state: String,
    /// Inbound commands
    pub command: String,
    /// Retained discovery document
    pub config: String,
}

/// Topic naming for one bridge instance.
///
/// Layout: `<discovery_prefix>/<component>/<node_id>/<object_id>/{state,set,config}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    pub discovery_prefix: String,
    pub node_id: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("homeassistant", "icue2mqtt")
    }
}

impl TopicScheme {
    pub fn new(discovery_prefix: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into(),
            node_id: node_id.into(),
        }
    }

    fn entity(&self, component: &str, object_id: &str) -> EntityTopics {
        let base = format!(
            "{}/{}/{}/{}",
            self.discovery_prefix, component, self.node_id, object_id
        );
        EntityTopics {
            state: format!("{base}/state"),
            command: format!("{base}/set"),
            config: format!("{base}/config"),
        }
    }

    /// Topics for a light entity
    pub fn light(&self, object_id: &str) -> EntityTopics {
        self.entity("light", object_id)
    }

    /// Topics for the aggregate light
    pub fn aggregate(&self) -> EntityTopics {
        self.light(AGGREGATE_ID)
    }

    /// Topics for the control-priority switch
    pub fn control_switch(&self) -> EntityTopics {
        self.entity("switch", CONTROL_SWITCH_ID)
    }
}

/// Index of an entry in the registry (stable for the process lifetime)
pub type EntryId = usize;

/// One bridged device
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub snapshot: DeviceSnapshot,
    /// Topic-safe identifier, unique across the registry
    pub entity_id: String,
    /// Name advertised in the discovery document
    pub display_name: String,
    pub topics: EntityTopics,
    /// Most recent non-off colour, restored by a bare "ON"
    pub last_on_color: Rgb,
    /// Reported by the most recent enumeration pass
    present: bool,
}

impl RegistryEntry {
    /// SDK index of the device, or `None` once a later pass stopped
    /// reporting it.
    ///
    /// The SDK renumbers devices on every enumeration, so a stale index may
    /// belong to another device.
    pub fn device_index(&self) -> Option<usize> {
        self.present.then_some(self.snapshot.device_index)
    }

    /// Colour a bare "ON" should restore
    pub fn restore_color(&self) -> Rgb {
        restore_or_white(self.last_on_color)
    }

    /// Record the current colour before the device is switched off.
    ///
    /// An already dark device keeps its previous `last_on_color`.
    pub fn remember_on_color(&mut self) {
        if self.snapshot.color.is_on() {
            self.last_on_color = self.snapshot.color;
        }
    }

    /// Store a colour that was successfully written to the hardware
    pub fn apply_color(&mut self, color: Rgb) {
        self.snapshot.color = color;
        if color.is_on() {
            self.last_on_color = color;
        }
    }
}

/// Derived state of the "all devices" light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateState {
    pub state: PowerState,
    /// `None` only when the registry is empty
    pub color: Option<Rgb>,
}

/// Registry of all bridged devices
#[derive(Debug)]
pub struct DeviceRegistry {
    scheme: TopicScheme,
    entries: Vec<RegistryEntry>,
    /// state topic -> entry
    by_state_topic: HashMap<String, EntryId>,
    /// command topic -> entry
    by_set_topic: HashMap<String, EntryId>,
    /// (model, suffix) -> entry
    by_key: HashMap<(String, usize), EntryId>,
    /// Devices of each model seen in the current enumeration pass
    pass_counts: HashMap<String, usize>,
    /// Last non-off aggregate mean
    last_average: Rgb,
}

impl DeviceRegistry {
    /// Create an empty registry using the given topic layout
    pub fn new(scheme: TopicScheme) -> Self {
        Self {
            scheme,
            entries: Vec::new(),
            by_state_topic: HashMap::new(),
            by_set_topic: HashMap::new(),
            by_key: HashMap::new(),
            pass_counts: HashMap::new(),
            last_average: Rgb::BLACK,
        }
    }

    /// Start a new enumeration pass.
    ///
    /// Duplicate-model suffixes restart from zero, so re-enumerating the same
    /// hardware maps every device back onto its existing entry.
    ///
    /// Every entry counts as missing until [`Self::register`] sees it again.
    pub fn begin_pass(&mut self) {
        self.pass_counts.clear();
        for entry in &mut self.entries {
            entry.present = false;
        }
    }

    /// Register every snapshot of one enumeration pass.
    ///
    /// Entries the pass did not report stay registered (their topics are
    /// still known to the broker) but go dark and lose their device index.
    pub fn register_all(&mut self, snapshots: impl IntoIterator<Item = DeviceSnapshot>) {
        self.begin_pass();
        for snapshot in snapshots {
            self.register(snapshot);
        }
        for entry in self.entries.iter_mut().filter(|e| !e.present) {
            if entry.snapshot.color.is_on() {
                entry.last_on_color = entry.snapshot.color;
            }
            entry.snapshot.color = Rgb::BLACK;
            tracing::info!(entity_id = %entry.entity_id, "Device no longer reported by the SDK");
        }
    }

    /// Register a device seen in the current enumeration pass.
    ///
    /// The first device of a model gets the bare model id, later ones get
    /// `_1`, `_2`, ... appended. A (model, suffix) pair that is already known
    /// overwrites its entry in place and keeps its topics.
    pub fn register(&mut self, snapshot: DeviceSnapshot) -> &RegistryEntry {
        let seen = self.pass_counts.entry(snapshot.model.clone()).or_insert(0);
        let suffix = *seen;
        *seen += 1;

        let key = (snapshot.model.clone(), suffix);
        if let Some(&id) = self.by_key.get(&key) {
            let entry = &mut self.entries[id];
            tracing::debug!(entity_id = %entry.entity_id, "Re-registered device");
            if snapshot.color.is_on() {
                entry.last_on_color = snapshot.color;
            }
            entry.snapshot = snapshot;
            entry.present = true;
            return &self.entries[id];
        }

        let base = sanitize(&snapshot.model);
        let (entity_id, tail) = self.unique_entity_id(&base, suffix);
        let display_name = format!("{}{}", snapshot.model, tail);
        let topics = self.scheme.light(&entity_id);

        let id = self.entries.len();
        self.by_state_topic.insert(topics.state.clone(), id);
        self.by_set_topic.insert(topics.command.clone(), id);
        self.by_key.insert(key, id);

        tracing::info!(
            entity_id = %entity_id,
            device_index = snapshot.device_index,
            "Registered device {}",
            display_name
        );

        self.entries.push(RegistryEntry {
            last_on_color: snapshot.color,
            snapshot,
            entity_id,
            display_name,
            topics,
            present: true,
        });
        &self.entries[id]
    }

    /// Pick an entity id not used by any other entry or virtual entity.
    ///
    /// Returns the id and the suffix text appended to the model name.
    fn unique_entity_id(&self, base: &str, suffix: usize) -> (String, String) {
        let mut n = suffix;
        loop {
            let tail = if n == 0 { String::new() } else { format!("_{n}") };
            let candidate = format!("{base}{tail}");
            if !self.is_taken(&candidate) {
                return (candidate, tail);
            }
            n += 1;
        }
    }

    fn is_taken(&self, entity_id: &str) -> bool {
        entity_id == AGGREGATE_ID
            || self
                .by_state_topic
                .contains_key(&self.scheme.light(entity_id).state)
    }

    /// Look up an entry by its state topic
    pub fn find_by_state_topic(&self, topic: &str) -> Option<EntryId> {
        self.by_state_topic.get(topic).copied()
    }

    /// Look up an entry by its command topic
    pub fn find_by_set_topic(&self, topic: &str) -> Option<EntryId> {
        self.by_set_topic.get(topic).copied()
    }

    pub fn get(&self, id: EntryId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(id)
    }

    /// All entries in registration order
    pub fn all(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut RegistryEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mean colour of all present entries.
    ///
    /// Caches the result for restore-on-ON whenever it is not dark.
    pub fn aggregate_state(&mut self) -> AggregateState {
        let present = self.entries.iter().filter(|e| e.present);
        let Some(mean) = Rgb::average(present.map(|e| &e.snapshot.color)) else {
            return AggregateState {
                state: PowerState::Off,
                color: None,
            };
        };
        if mean.is_on() {
            self.last_average = mean;
        }
        AggregateState {
            state: PowerState::from_color(mean),
            color: Some(mean),
        }
    }

    /// Colour a bare "ON" on the aggregate should restore
    pub fn aggregate_restore_color(&self) -> Rgb {
        restore_or_white(self.last_average)
    }

    /// Snapshot every device's colour (and the aggregate mean) before a
    /// global "OFF"
    pub fn remember_on_colors(&mut self) {
        let _ = self.aggregate_state();
        for entry in &mut self.entries {
            entry.remember_on_color();
        }
    }
}

/// Devices that were never lit have nothing to restore; fall back to white.
fn restore_or_white(color: Rgb) -> Rgb {
    if color.is_on() { color } else { Rgb::WHITE }
}

/// Turn a model name into a topic-safe object id
fn sanitize(model: &str) -> String {
    model
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '+' | '#' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(TopicScheme::default())
    }

    fn snap(model: &str, index: usize, color: Rgb) -> DeviceSnapshot {
        DeviceSnapshot::new(model, index, color)
    }

    #[test]
    fn test_topic_layout() {
        let mut reg = registry();
        let entry = reg.register(snap("K70 RGB MK.2", 0, Rgb::BLACK));

        assert_eq!(entry.entity_id, "K70_RGB_MK.2");
        assert_eq!(
            entry.topics.state,
            "homeassistant/light/icue2mqtt/K70_RGB_MK.2/state"
        );
        assert_eq!(
            entry.topics.command,
            "homeassistant/light/icue2mqtt/K70_RGB_MK.2/set"
        );
        assert_eq!(
            entry.topics.config,
            "homeassistant/light/icue2mqtt/K70_RGB_MK.2/config"
        );

        let switch = TopicScheme::default().control_switch();
        assert_eq!(switch.command, "homeassistant/switch/icue2mqtt/icue_control/set");
    }

    #[test]
    fn test_duplicate_models_get_suffixes() {
        let mut reg = registry();
        reg.register_all(vec![
            snap("LL Fan", 0, Rgb::BLACK),
            snap("LL Fan", 1, Rgb::BLACK),
            snap("Strip", 2, Rgb::BLACK),
            snap("LL Fan", 3, Rgb::BLACK),
        ]);

        let ids: Vec<_> = reg.all().iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["LL_Fan", "LL_Fan_1", "Strip", "LL_Fan_2"]);

        let names: Vec<_> = reg.all().iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["LL Fan", "LL Fan_1", "Strip", "LL Fan_2"]);
    }

    #[test]
    fn test_entity_ids_unique_across_colliding_models() {
        let mut reg = registry();
        reg.register_all(vec![
            snap("A B", 0, Rgb::BLACK),
            snap("A_B", 1, Rgb::BLACK),
            snap("A B", 2, Rgb::BLACK),
            snap("all icue", 3, Rgb::BLACK),
        ]);

        let ids: HashSet<_> = reg.all().iter().map(|e| e.entity_id.clone()).collect();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(AGGREGATE_ID));

        let states: HashSet<_> = reg.all().iter().map(|e| e.topics.state.clone()).collect();
        assert_eq!(states.len(), 4);
    }

    #[test]
    fn test_reregistration_overwrites_in_place() {
        let mut reg = registry();
        reg.register_all(vec![
            snap("Fan", 0, Rgb::new(1, 1, 1)),
            snap("Fan", 1, Rgb::new(2, 2, 2)),
        ]);
        let topics_before: Vec<_> = reg.all().iter().map(|e| e.topics.clone()).collect();

        reg.register_all(vec![
            snap("Fan", 0, Rgb::new(9, 9, 9)),
            snap("Fan", 1, Rgb::new(8, 8, 8)),
        ]);

        assert_eq!(reg.len(), 2);
        let topics_after: Vec<_> = reg.all().iter().map(|e| e.topics.clone()).collect();
        assert_eq!(topics_before, topics_after);
        assert_eq!(reg.all()[0].snapshot.color, Rgb::new(9, 9, 9));
        assert_eq!(reg.all()[1].snapshot.color, Rgb::new(8, 8, 8));

        let id = reg.find_by_state_topic(&topics_after[1].state).unwrap();
        assert_eq!(reg.get(id).unwrap().snapshot.color, Rgb::new(8, 8, 8));
        let id = reg.find_by_set_topic(&topics_after[0].command).unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn test_new_device_in_later_pass_is_appended() {
        let mut reg = registry();
        reg.register_all(vec![snap("Fan", 0, Rgb::BLACK)]);
        reg.register_all(vec![snap("Fan", 0, Rgb::BLACK), snap("Fan", 1, Rgb::BLACK)]);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.all()[1].entity_id, "Fan_1");
        assert!(reg.find_by_set_topic(&reg.all()[1].topics.command).is_some());
    }

    #[test]
    fn test_unreported_device_loses_its_index() {
        let mut reg = registry();
        reg.register_all(vec![snap("Fan", 0, Rgb::new(40, 0, 0)), snap("Strip", 1, Rgb::new(0, 0, 20))]);

        // Fan unplugged: Strip moves down to index 0
        reg.register_all(vec![snap("Strip", 0, Rgb::new(0, 0, 20))]);

        let fan = &reg.all()[0];
        assert_eq!(fan.device_index(), None);
        assert_eq!(fan.snapshot.color, Rgb::BLACK);
        assert_eq!(fan.restore_color(), Rgb::new(40, 0, 0));
        assert!(reg.find_by_set_topic(&fan.topics.command).is_some());

        assert_eq!(reg.all()[1].device_index(), Some(0));
        assert_eq!(reg.aggregate_state().color, Some(Rgb::new(0, 0, 20)));
    }

    #[test]
    fn test_returning_device_is_present_again() {
        let mut reg = registry();
        reg.register_all(vec![snap("Fan", 0, Rgb::WHITE), snap("Strip", 1, Rgb::WHITE)]);
        reg.register_all(vec![snap("Strip", 0, Rgb::WHITE)]);
        reg.register_all(vec![snap("Strip", 0, Rgb::WHITE), snap("Fan", 1, Rgb::new(3, 3, 3))]);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.all()[0].device_index(), Some(1));
        assert_eq!(reg.all()[0].snapshot.color, Rgb::new(3, 3, 3));
        assert_eq!(reg.all()[1].device_index(), Some(0));
    }

    #[test]
    fn test_aggregate_of_only_missing_devices_has_no_color() {
        let mut reg = registry();
        reg.register_all(vec![snap("Fan", 0, Rgb::WHITE)]);
        reg.register_all(Vec::new());

        let agg = reg.aggregate_state();
        assert_eq!(agg.state, PowerState::Off);
        assert_eq!(agg.color, None);
    }

    #[test]
    fn test_lookup_misses() {
        let mut reg = registry();
        reg.register(snap("Fan", 0, Rgb::BLACK));
        assert!(reg.find_by_state_topic("homeassistant/light/icue2mqtt/Nope/state").is_none());
        // A command topic is not a state topic
        let cmd = reg.all()[0].topics.command.clone();
        assert!(reg.find_by_state_topic(&cmd).is_none());
    }

    #[test]
    fn test_aggregate_mean() {
        let mut reg = registry();
        reg.register_all(vec![
            snap("A", 0, Rgb::new(10, 0, 0)),
            snap("B", 1, Rgb::new(20, 0, 0)),
            snap("C", 2, Rgb::new(30, 0, 0)),
        ]);

        let agg = reg.aggregate_state();
        assert_eq!(agg.state, PowerState::On);
        assert_eq!(agg.color, Some(Rgb::new(20, 0, 0)));
    }

    #[test]
    fn test_aggregate_rounds_down() {
        let mut reg = registry();
        reg.register_all(vec![snap("A", 0, Rgb::new(1, 0, 0)), snap("B", 1, Rgb::BLACK)]);

        let agg = reg.aggregate_state();
        assert_eq!(agg.color, Some(Rgb::BLACK));
        assert_eq!(agg.state, PowerState::Off);
    }

    #[test]
    fn test_empty_aggregate_is_off_without_color() {
        let mut reg = registry();
        let agg = reg.aggregate_state();
        assert_eq!(agg.state, PowerState::Off);
        assert_eq!(agg.color, None);
    }

    #[test]
    fn test_all_devices_off_keeps_color_field() {
        let mut reg = registry();
        reg.register(snap("A", 0, Rgb::BLACK));
        let agg = reg.aggregate_state();
        assert_eq!(agg.state, PowerState::Off);
        assert_eq!(agg.color, Some(Rgb::BLACK));
    }

    #[test]
    fn test_remember_on_color_ignores_dark_devices() {
        let mut reg = registry();
        reg.register(snap("A", 0, Rgb::new(0, 50, 0)));
        let entry = reg.get_mut(0).unwrap();

        entry.remember_on_color();
        entry.apply_color(Rgb::BLACK);
        entry.remember_on_color();
        assert_eq!(entry.restore_color(), Rgb::new(0, 50, 0));
    }

    #[test]
    fn test_restore_falls_back_to_white() {
        let mut reg = registry();
        reg.register(snap("A", 0, Rgb::BLACK));
        assert_eq!(reg.get(0).unwrap().restore_color(), Rgb::WHITE);
        assert_eq!(reg.aggregate_restore_color(), Rgb::WHITE);
    }

    #[test]
    fn test_aggregate_restore_uses_last_lit_mean() {
        let mut reg = registry();
        reg.register_all(vec![snap("A", 0, Rgb::new(0, 0, 40)), snap("B", 1, Rgb::new(0, 0, 20))]);
        reg.remember_on_colors();
        for entry in reg.all_mut() {
            entry.apply_color(Rgb::BLACK);
        }
        assert_eq!(reg.aggregate_state().state, PowerState::Off);
        assert_eq!(reg.aggregate_restore_color(), Rgb::new(0, 0, 30));
    }
}
