//! Eventos de mudança publicados após cada commit.
//!
//! Os assinantes tratam cada evento como "algo mudou, busque de novo": a
//! ordem entre eventos não é garantida e o payload não substitui a leitura.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_db::models::Party;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Partnership,
    Referral,
    ConsentRequest,
    SharedSubscription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub entity: EntityKind,
    pub id: Uuid,
    /// Partes cujas visões dependem desta entidade
    pub parties: Vec<Party>,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn concerns(&self, party: Party) -> bool {
        self.parties.contains(&party)
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, entity: EntityKind, id: Uuid, parties: Vec<Party>) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ChangeEvent {
            sequence,
            entity,
            id,
            parties,
            at: Utc::now(),
        };
        // Sem assinantes o envio falha; não é um erro
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let clinic = Party::Clinic(Uuid::new_v4());
        let id = Uuid::new_v4();

        bus.publish(EntityKind::Partnership, id, vec![clinic]);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.sequence, 1);
        assert!(event.concerns(clinic));
        assert!(!event.concerns(Party::Ally(Uuid::new_v4())));
    }

    #[test]
    fn publish_without_subscribers_still_counts() {
        let bus = EventBus::new(4);
        bus.publish(EntityKind::Referral, Uuid::new_v4(), vec![]);
        bus.publish(EntityKind::Referral, Uuid::new_v4(), vec![]);
        assert_eq!(bus.sequence(), 2);
    }
}
