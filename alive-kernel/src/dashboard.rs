/**
 * DASHBOARD - Mutations du store + diffusion des événements
 *
 * RÔLE :
 * Point d'entrée unique des écritures (API, maintenance) : applique la
 * mutation dans le store, PUIS publie l'événement sur le broker.
 *
 * FONCTIONNEMENT :
 * - Le verrou du store n'est jamais tenu pendant un appel au broker
 * - La diffusion est best-effort : un broker arrêté est loggé, pas remonté
 * - Événement inconnu (id absent) => NotFound loggé, rien n'est publié
 */

use crate::broker::Broker;
use crate::models::{Event, EventType, Message, Status, StatusBox, STATUS_BAR_ANCHOR};
use crate::store::{BoxStore, StoreError};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot replace a box without an ID")]
    MissingId,
    #[error("failed to replace the box and the old box was restored: {0}")]
    ReplaceRestored(StoreError),
    #[error("failed to replace the box and the old box was lost: {0}")]
    ReplaceLost(StoreError),
}

/// Issue d'un remplacement : la box stockée, et si une ancienne a été remplacée
#[derive(Debug, Clone)]
pub struct Replaced {
    pub status_box: StatusBox,
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub struct Dashboard {
    store: BoxStore,
    broker: Broker,
}

impl Dashboard {
    pub fn new(store: BoxStore, broker: Broker) -> Self {
        Self { store, broker }
    }

    pub fn store(&self) -> &BoxStore {
        &self.store
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Crée une box et annonce sa position (`after`) aux viewers
    pub async fn add_box(&self, status_box: StatusBox) -> Result<StatusBox, DashboardError> {
        let placement = self.store.insert(status_box)?;
        info!(id = %placement.status_box.id, "creating a new box");
        debug!(detail = ?placement.status_box, "box detail");

        let after = placement.after.unwrap_or_else(|| STATUS_BAR_ANCHOR.to_string());
        self.broadcast(&Event::created(placement.status_box.clone(), after)).await;
        Ok(placement.status_box)
    }

    pub async fn delete_box(&self, id: &str, announce: bool) -> Option<StatusBox> {
        let removed = self.store.delete(id)?;
        info!(id = %removed.id, name = %removed.name, "deleting box");
        if announce {
            self.broadcast(&Event::deleted(id)).await;
        }
        Some(removed)
    }

    /// Fusionne un événement dans la box ciblée puis le rediffuse en `updateBox`.
    pub async fn apply_event(&self, mut event: Event) -> Result<(), DashboardError> {
        let now = OffsetDateTime::now_utc();
        let status = event.status.unwrap_or_else(|| {
            warn!(id = %event.id, "event status is missing");
            Status::Grey
        });
        let refreshes = event.event_type != EventType::NoUpdate;

        let merged = self.store.update(&event.id, |status_box| {
            status_box.last_message = event.message.clone();
            status_box.record_message(Message {
                message: event.message.clone(),
                status,
                time_stamp: now,
            });
            // un passage en noUpdate ne doit pas relancer le compteur d'inactivité
            if refreshes {
                status_box.last_update = Some(now);
            }
            status_box.status = status;
            merge_duration(&mut status_box.max_tbu, event.max_tbu);
            merge_duration(&mut status_box.expire_after, event.expire_after);
        });
        if let Err(e) = merged {
            error!("{e}");
            return Err(e.into());
        }

        event.status = Some(status);
        event.event_type = EventType::UpdateBox;
        self.broadcast(&event).await;
        Ok(())
    }

    /// Remplace la box portant le même id (ou la crée).
    /// Si la nouvelle version est refusée, l'ancienne est remise en place.
    pub async fn replace_box(&self, status_box: StatusBox) -> Result<Replaced, DashboardError> {
        if status_box.id.is_empty() {
            return Err(DashboardError::MissingId);
        }

        let previous = self.delete_box(&status_box.id, true).await;
        match self.add_box(status_box).await {
            Ok(stored) => Ok(Replaced {
                status_box: stored,
                replaced: previous.is_some(),
            }),
            Err(DashboardError::Store(e)) => match previous {
                Some(old) => match self.add_box(old).await {
                    Ok(_) => Err(DashboardError::ReplaceRestored(e)),
                    Err(_) => Err(DashboardError::ReplaceLost(e)),
                },
                None => Err(e.into()),
            },
            Err(e) => Err(e),
        }
    }

    /// Demande aux navigateurs de recharger la page
    pub async fn reload_viewers(&self) {
        self.broadcast(&Event::reload_page()).await;
    }

    async fn broadcast(&self, event: &Event) {
        let payload = match event.to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode event: {e}");
                return;
            }
        };
        if let Err(e) = self.broker.publish(payload).await {
            warn!(kind = ?event.event_type, "event not broadcast: {e}");
        }
    }
}

/// None = inchangé, zéro explicite = effacé, sinon remplacé
fn merge_duration(current: &mut Option<Duration>, requested: Option<Duration>) {
    match requested {
        None => {}
        Some(d) if d.is_zero() => *current = None,
        Some(d) => *current = Some(d),
    }
}
