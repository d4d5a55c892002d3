use serde::{Deserialize, Serialize};

use super::island::Island;
use super::team::TeamView;

/// Lifecycle events fanned out to subscribed clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    IslandUpdated(Island),
    IslandDeleted { island_id: i64 },
    TeamUpdated(TeamView),
    GracefulShutdownForUpdate { island_id: i64 },
}

/// What actually travels over the bus channel: the event plus the ids of
/// the clients it is addressed to. Each worker process forwards the event
/// to the recipients it has a live local connection for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub recipient_ids: Vec<String>,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = Envelope {
            recipient_ids: vec!["11111111-1111-1111-1111-111111111111".to_string()],
            event: Event::IslandDeleted { island_id: 7 },
        };

        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed.recipient_ids, envelope.recipient_ids);
        assert!(matches!(
            parsed.event,
            Event::IslandDeleted { island_id: 7 }
        ));
    }
}
