/**
 * BOX STORE - Registre concurrent des boxes du tableau de bord
 *
 * RÔLE :
 * Source unique de vérité pour la collection de boxes, partagée entre
 * l'API HTTP, la maintenance et les snapshots.
 *
 * FONCTIONNEMENT :
 * - RwLock parking_lot : lectures concurrentes, écritures sérialisées
 * - Toute lecture publique renvoie une copie (aucune fuite de l'état interne)
 * - Après chaque mutation : tri taille décroissante puis nom croissant
 * - IDs : 10 caractères alphanumériques aléatoires, retirés tant qu'ils existent déjà
 *
 * ATTENTION :
 * Ne jamais appeler une opération d'écriture depuis le visiteur de `for_each`
 * (le verrou de lecture est tenu, l'écriture bloquerait pour toujours).
 * Collecter les actions pendant l'itération, les appliquer ensuite.
 */

use crate::models::StatusBox;
use parking_lot::RwLock;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::ops::ControlFlow;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::warn;

pub const ID_LENGTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("could not find box {0}")]
    NotFound(String),
    #[error("a box already exists with that ID: {0}")]
    DuplicateId(String),
}

/// Résultat d'une insertion : la box stockée et l'id de celle qui la précède
/// dans l'ordre d'affichage (None si elle est en tête).
#[derive(Debug, Clone)]
pub struct Placement {
    pub status_box: StatusBox,
    pub after: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BoxStore {
    boxes: Arc<RwLock<Vec<StatusBox>>>,
}

impl Default for BoxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxStore {
    pub fn new() -> Self {
        Self {
            boxes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Construit un store depuis un snapshot chargé au démarrage.
    /// Les doublons d'id sont écartés (premier gardé), les ids vides régénérés,
    /// les horodatages "zéro" ramenés à None.
    pub fn from_snapshot(loaded: Vec<StatusBox>) -> Self {
        let mut boxes: Vec<StatusBox> = Vec::with_capacity(loaded.len());
        for mut status_box in loaded {
            status_box.last_update = status_box.stamped_at();
            if status_box.id.is_empty() {
                status_box.id = unused_id(&boxes);
            } else if contains_id(&boxes, &status_box.id) {
                warn!(id = %status_box.id, name = %status_box.name, "dropping duplicate box from snapshot");
                continue;
            }
            boxes.push(status_box);
        }
        sort_boxes(&mut boxes);
        Self {
            boxes: Arc::new(RwLock::new(boxes)),
        }
    }

    /// Ajoute une box et renvoie son id final.
    pub fn add(&self, status_box: StatusBox) -> Result<String, StoreError> {
        self.insert(status_box).map(|placement| placement.status_box.id)
    }

    /// Comme `add`, mais renvoie aussi la position d'affichage calculée sous le même verrou.
    pub fn insert(&self, mut status_box: StatusBox) -> Result<Placement, StoreError> {
        let mut boxes = self.boxes.write();

        if status_box.id.is_empty() {
            status_box.id = unused_id(&boxes);
        } else if contains_id(&boxes, &status_box.id) {
            return Err(StoreError::DuplicateId(status_box.id));
        }

        status_box.last_update = Some(OffsetDateTime::now_utc());
        let id = status_box.id.clone();
        boxes.push(status_box);
        sort_boxes(&mut boxes);

        let index = boxes.iter().position(|b| b.id == id).unwrap_or(0);
        let after = index.checked_sub(1).map(|prev| boxes[prev].id.clone());
        Ok(Placement {
            status_box: boxes[index].clone(),
            after,
        })
    }

    pub fn get_all(&self) -> Vec<StatusBox> {
        self.boxes.read().clone()
    }

    pub fn get_by_id(&self, id: &str) -> Result<StatusBox, StoreError> {
        self.boxes
            .read()
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        contains_id(&self.boxes.read(), id)
    }

    /// Retire une box ; None si l'id est inconnu (aucune mutation).
    pub fn delete(&self, id: &str) -> Option<StatusBox> {
        let mut boxes = self.boxes.write();
        let index = boxes.iter().position(|b| b.id == id)?;
        Some(boxes.remove(index))
    }

    /// Applique `mutate` sous le verrou d'écriture puis re-trie
    /// (le nom ou la taille peuvent avoir changé).
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StatusBox),
    {
        let mut boxes = self.boxes.write();
        let status_box = boxes
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(status_box);
        // l'id est la clé : un mutateur ne doit pas le changer
        debug_assert_eq!(status_box.id, id);
        sort_boxes(&mut boxes);
        Ok(())
    }

    /// Itération sous verrou de lecture, dans l'ordre d'affichage.
    /// Le visiteur renvoie `ControlFlow::Break(())` pour arrêter.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&StatusBox) -> ControlFlow<()>,
    {
        let boxes = self.boxes.read();
        for status_box in boxes.iter() {
            if visit(status_box).is_break() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.read().is_empty()
    }
}

pub fn random_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

fn unused_id(boxes: &[StatusBox]) -> String {
    loop {
        let id = random_id();
        if !contains_id(boxes, &id) {
            return id;
        }
    }
}

fn contains_id(boxes: &[StatusBox], id: &str) -> bool {
    boxes.iter().any(|b| b.id == id)
}

/// Taille décroissante, puis nom croissant (ordre des octets)
fn sort_boxes(boxes: &mut [StatusBox]) {
    boxes.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
}
