//! `GET /api/events`: eventos de mudança via server-sent events.
//!
//! Cada evento significa "algo mudou, busque de novo"; quem ficar para trás
//! pula os eventos perdidos.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use common_db::models::Party;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::watch;
use tracing::warn;

use super::auth::Actor;
use super::AppState;
use crate::error::NetworkResult;
use crate::events::ChangeEvent;

/// Eventos do canal que dizem respeito à parte, até o canal fechar
pub fn changes_for(
    receiver: Receiver<ChangeEvent>,
    party: Party,
) -> impl Stream<Item = ChangeEvent> + Send + 'static {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) if event.concerns(party) => return Some((event, receiver)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%party, skipped, "Assinante atrasado, eventos descartados");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// Corta o fluxo quando o servidor começa a encerrar
pub fn until_shutdown<S>(
    changes: S,
    mut shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = S::Item> + Send + 'static
where
    S: Stream + Send + 'static,
{
    changes.take_until(async move {
        // Erro significa que o estado do servidor já foi descartado
        let _ = shutdown.wait_for(|closing| *closing).await;
    })
}

fn to_sse(event: &ChangeEvent) -> Event {
    let base = || {
        Event::default()
            .event("change")
            .id(event.sequence.to_string())
    };
    base().json_data(event).unwrap_or_else(|e| {
        warn!(error = %e, "Falha ao serializar evento");
        base()
    })
}

pub async fn stream_changes(
    State(state): State<AppState>,
    actor: Actor,
) -> NetworkResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let party = actor.require_party()?;
    let receiver = state.service.events().subscribe();

    let events = until_shutdown(changes_for(receiver, party), state.shutdown_signal())
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EntityKind, EventBus};
    use uuid::Uuid;

    #[tokio::test]
    async fn only_events_of_the_party_pass() {
        let bus = EventBus::new(16);
        let me = Party::Clinic(Uuid::new_v4());
        let other = Party::Ally(Uuid::new_v4());
        let stream = changes_for(bus.subscribe(), me);
        futures_util::pin_mut!(stream);

        let unrelated = Uuid::new_v4();
        let mine = Uuid::new_v4();
        bus.publish(EntityKind::Partnership, unrelated, vec![other]);
        bus.publish(EntityKind::Referral, mine, vec![me, other]);

        let event = stream.next().await.unwrap();
        assert_eq!(event.id, mine);
        assert_eq!(event.entity, EntityKind::Referral);
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let me = Party::Clinic(Uuid::new_v4());
        let stream = changes_for(bus.subscribe(), me);
        futures_util::pin_mut!(stream);

        let mut last = Uuid::nil();
        for _ in 0..5 {
            last = Uuid::new_v4();
            bus.publish(EntityKind::Referral, last, vec![me]);
        }

        let mut seen = Vec::new();
        seen.push(stream.next().await.unwrap().id);
        seen.push(stream.next().await.unwrap().id);
        assert_eq!(seen.last(), Some(&last));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_is_dropped() {
        let bus = EventBus::new(4);
        let stream = changes_for(bus.subscribe(), Party::Clinic(Uuid::new_v4()));
        drop(bus);
        futures_util::pin_mut!(stream);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_on_shutdown_while_bus_is_alive() {
        let bus = EventBus::new(4);
        let me = Party::Clinic(Uuid::new_v4());
        let (closing, shutdown) = watch::channel(false);
        let stream = until_shutdown(changes_for(bus.subscribe(), me), shutdown);
        futures_util::pin_mut!(stream);

        let first = Uuid::new_v4();
        bus.publish(EntityKind::Referral, first, vec![me]);
        assert_eq!(stream.next().await.unwrap().id, first);

        closing.send_replace(true);
        let ended = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next()).await;
        assert!(matches!(ended, Ok(None)));
        drop(bus);
    }
}
