//! Pairing lifecycle events.

/// Changes to the set of paired controllers.
///
/// The advertisement layer only needs to know whether the accessory is paired;
/// these events let it react without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A controller was added, either by pair-setup or by an admin `AddPairing`.
    DevicePaired { controller_id: String },
    /// A controller was removed through `RemovePairing`.
    DeviceUnpaired { controller_id: String },
}

impl PairingEvent {
    /// Pairing identifier of the controller this event concerns.
    pub fn controller_id(&self) -> &str {
        match self {
            PairingEvent::DevicePaired { controller_id }
            | PairingEvent::DeviceUnpaired { controller_id } => controller_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_id_for_each_variant() {
        let paired = PairingEvent::DevicePaired {
            controller_id: "ctrl-a".to_string(),
        };
        let unpaired = PairingEvent::DeviceUnpaired {
            controller_id: "ctrl-b".to_string(),
        };
        assert_eq!(paired.controller_id(), "ctrl-a");
        assert_eq!(unpaired.controller_id(), "ctrl-b");
    }

    #[test]
    fn events_are_cloneable_and_comparable() {
        let event = PairingEvent::DevicePaired {
            controller_id: "x".to_string(),
        };
        assert_eq!(event.clone(), event);
    }
}
