/**
 * MAINTENANCE - Cycle de vie temporel des boxes + snapshots périodiques
 *
 * FONCTIONNEMENT (à chaque tick) :
 * 1. Une seule passe en lecture sur le store : collecte des boxes expirées
 *    (supprimées) et des boxes muettes depuis plus de maxTBU (événement noUpdate)
 * 2. Application des actions APRÈS libération du verrou de lecture
 * 3. Snapshot si le dernier remonte à plus de `save_every`
 *
 * Expirée ET muette => supprimée seulement.
 * Une box déjà en noUpdate ne reçoit pas de nouvel événement noUpdate.
 * À l'arrêt : jusqu'à `shutdown_save_attempts` tentatives de sauvegarde.
 */

use crate::dashboard::Dashboard;
use crate::models::{Event, Status};
use crate::persistence::SnapshotFile;
use crate::store::BoxStore;
use std::ops::ControlFlow;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
pub const SAVE_INTERVAL: Duration = Duration::from_secs(60);
pub const SHUTDOWN_SAVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub save_every: Duration,
    pub shutdown_save_attempts: u32,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: MAINTENANCE_INTERVAL,
            save_every: SAVE_INTERVAL,
            shutdown_save_attempts: SHUTDOWN_SAVE_ATTEMPTS,
        }
    }
}

/// Actions décidées pendant la passe en lecture
#[derive(Debug, Default)]
pub struct MaintenancePlan {
    pub expired: Vec<String>,
    pub stale: Vec<Event>,
}

impl MaintenancePlan {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.stale.is_empty()
    }
}

/// Passe en lecture seule : aucune écriture sur le store ici.
pub fn plan(store: &BoxStore, now: OffsetDateTime) -> MaintenancePlan {
    let mut plan = MaintenancePlan::default();
    store.for_each(|status_box| {
        let Some(last_update) = status_box.stamped_at() else {
            return ControlFlow::Continue(());
        };
        // horloge revenue en arrière => pas d'inactivité
        let Ok(idle) = Duration::try_from(now - last_update) else {
            return ControlFlow::Continue(());
        };

        if let Some(expire_after) = status_box.expire_after {
            if idle > expire_after {
                info!(id = %status_box.id, name = %status_box.name, "marking box as expired");
                plan.expired.push(status_box.id.clone());
                return ControlFlow::Continue(());
            }
        }

        if let Some(max_tbu) = status_box.max_tbu {
            if idle > max_tbu && status_box.status != Status::NoUpdate {
                info!(id = %status_box.id, name = %status_box.name, "marking box as no update");
                plan.stale.push(Event::no_update(&status_box.id, max_tbu));
            }
        }
        ControlFlow::Continue(())
    });
    plan
}

pub struct Scheduler {
    dashboard: Dashboard,
    snapshots: SnapshotFile,
    settings: MaintenanceSettings,
    // None tant qu'aucune sauvegarde n'a réussi : le premier tick sauvegarde
    last_save: Option<Instant>,
}

impl Scheduler {
    pub fn new(dashboard: Dashboard, snapshots: SnapshotFile, settings: MaintenanceSettings) -> Self {
        Self {
            dashboard,
            snapshots,
            settings,
            last_save: None,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(every = ?self.settings.interval, "starting maintenance routine");
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.run_once(OffsetDateTime::now_utc()).await,
            }
        }

        self.save_on_shutdown().await;
        info!("stopping maintenance routine");
    }

    /// Un tick complet à l'instant `now`
    pub async fn run_once(&mut self, now: OffsetDateTime) {
        let plan = plan(self.dashboard.store(), now);
        if !plan.is_empty() {
            debug!(expired = plan.expired.len(), stale = plan.stale.len(), "applying maintenance plan");
        }

        for id in &plan.expired {
            self.dashboard.delete_box(id, true).await;
        }
        for event in plan.stale {
            // box supprimée entre-temps : déjà loggé par le dashboard
            let _ = self.dashboard.apply_event(event).await;
        }

        if self.save_due() {
            self.save().await;
        }
    }

    fn save_due(&self) -> bool {
        match self.last_save {
            None => true,
            Some(at) => at.elapsed() > self.settings.save_every,
        }
    }

    async fn save(&mut self) -> bool {
        match self.snapshots.save(self.dashboard.store()).await {
            Ok(()) => {
                self.last_save = Some(Instant::now());
                debug!(file = %self.snapshots.path().display(), "snapshot saved");
                true
            }
            Err(e) => {
                error!(file = %self.snapshots.path().display(), "error saving boxes: {e}");
                false
            }
        }
    }

    /// Renvoie le nombre de tentatives effectuées
    async fn save_on_shutdown(&mut self) -> u32 {
        for attempt in 1..=self.settings.shutdown_save_attempts {
            info!(attempt, "saving boxes before shutdown");
            if self.save().await {
                return attempt;
            }
        }
        error!(
            attempts = self.settings.shutdown_save_attempts,
            "could not save boxes before shutdown"
        );
        self.settings.shutdown_save_attempts
    }
}
