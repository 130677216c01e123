/**
 * EVENT BROKER - Diffusion des événements vers les navigateurs connectés
 *
 * RÔLE :
 * Découple les producteurs (store, maintenance, API) de l'ensemble dynamique
 * des viewers SSE connectés.
 *
 * FONCTIONNEMENT :
 * - Une task coordinatrice unique possède la table des mailboxes
 * - On ne lui parle que par channels, aucun verrou sur la table :
 *   une file de commandes FIFO (inscription, publication, comptage),
 *   les désinscriptions, et le token d'arrêt
 * - Commandes traitées dans leur ordre d'arrivée : une inscription n'attend
 *   jamais derrière un flot continu de publications, et une mailbox ne reçoit
 *   rien de ce qui a été publié avant son inscription
 * - Publish = try_send vers chaque mailbox ; mailbox pleine => message perdu
 *   pour ce viewer seulement (at-most-once, jamais de blocage)
 * - Une mailbox droppée se désinscrit toute seule
 */

use crate::models::Event;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("event broker is shut down")]
    Closed,
}

struct Registration {
    id: Uuid,
    sender: mpsc::Sender<Arc<String>>,
    ack: oneshot::Sender<()>,
}

enum Command {
    Register(Registration),
    Publish(Arc<String>),
    Count(oneshot::Sender<usize>),
}

/// Handle clonable vers la task coordinatrice
#[derive(Debug, Clone)]
pub struct Broker {
    commands_tx: mpsc::Sender<Command>,
    deregister_tx: mpsc::UnboundedSender<Uuid>,
    mailbox_capacity: usize,
}

/// Boîte de réception bornée d'un viewer.
/// Fermée par le broker à la désinscription ou à l'arrêt.
#[derive(Debug)]
pub struct Mailbox {
    id: Uuid,
    receiver: mpsc::Receiver<Arc<String>>,
    deregister_tx: mpsc::UnboundedSender<Uuid>,
}

impl Mailbox {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prochain message ; None quand la mailbox est fermée
    pub async fn recv(&mut self) -> Option<Arc<String>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<String>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // broker déjà arrêté : rien à désinscrire
        let _ = self.deregister_tx.send(self.id);
    }
}

struct Coordinator {
    clients: HashMap<Uuid, mpsc::Sender<Arc<String>>>,
    commands_rx: mpsc::Receiver<Command>,
    deregister_rx: mpsc::UnboundedReceiver<Uuid>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Démarre la task coordinatrice ; elle s'arrête quand `shutdown` est annulé.
    pub fn start(mailbox_capacity: usize, shutdown: CancellationToken) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (deregister_tx, deregister_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            clients: HashMap::new(),
            commands_rx,
            deregister_rx,
            shutdown,
        };
        task::spawn(coordinator.run());

        Self {
            commands_tx,
            deregister_tx,
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    /// Alloue et enregistre une mailbox. Au retour, elle reçoit tout message publié ensuite.
    pub async fn subscribe(&self) -> Result<Mailbox, BrokerError> {
        let (sender, receiver) = mpsc::channel(self.mailbox_capacity);
        let (ack, acked) = oneshot::channel();
        let id = Uuid::new_v4();

        self.send(Command::Register(Registration { id, sender, ack })).await?;
        acked.await.map_err(|_| BrokerError::Closed)?;

        Ok(Mailbox {
            id,
            receiver,
            deregister_tx: self.deregister_tx.clone(),
        })
    }

    /// Désinscription explicite (équivalent à dropper la mailbox)
    pub fn unsubscribe(&self, mailbox: Mailbox) {
        drop(mailbox);
    }

    /// Remet un message au coordinateur, qui le diffuse sans jamais attendre un viewer.
    pub async fn publish(&self, message: impl Into<String>) -> Result<(), BrokerError> {
        self.send(Command::Publish(Arc::new(message.into()))).await
    }

    /// Nombre de viewers enregistrés. Répondu après les messages déjà en file.
    pub async fn client_count(&self) -> Result<usize, BrokerError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Count(reply)).await?;
        answer.await.map_err(|_| BrokerError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.commands_tx.send(command).await.map_err(|_| BrokerError::Closed)
    }
}

impl Coordinator {
    async fn run(mut self) {
        debug!("event broker started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(id) = self.deregister_rx.recv() => self.remove(id),
                Some(command) = self.commands_rx.recv() => match command {
                    Command::Register(registration) => self.add(registration),
                    Command::Publish(message) => self.fan_out(message),
                    Command::Count(reply) => {
                        let _ = reply.send(self.clients.len());
                    }
                },
                else => break,
            }
        }
        // dropper les senders ferme toutes les mailboxes
        self.clients.clear();
        info!("event broker stopped");
    }

    fn add(&mut self, registration: Registration) {
        self.clients.insert(registration.id, registration.sender);
        info!(current_client_count = self.clients.len(), "added new client");
        let _ = registration.ack.send(());
    }

    fn remove(&mut self, id: Uuid) {
        if self.clients.remove(&id).is_some() {
            info!(current_client_count = self.clients.len(), "removed client");
        }
    }

    fn fan_out(&mut self, message: Arc<String>) {
        let mut gone = Vec::new();
        for (id, sender) in &self.clients {
            match sender.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(client = %id, "dropped message for slow client"),
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            self.remove(id);
        }
    }
}

/// Publie un keepalive toutes les `every` jusqu'à l'arrêt.
pub fn spawn_keepalives(broker: Broker, every: Duration, shutdown: CancellationToken) -> task::JoinHandle<()> {
    task::spawn(async move {
        debug!("starting keepalive routine");
        let payload = match Event::keepalive().to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode keepalive: {e}");
                return;
            }
        };
        let mut ticker = tokio::time::interval(every);
        // le premier tick est immédiat : on attend une période complète
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if broker.publish(payload.clone()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("stopping keepalive routine");
    })
}
