/**
 * MODÈLES ALIVE - Boxes, messages et événements diffusés
 *
 * RÔLE :
 * Types partagés par le store, le broker, la maintenance et les snapshots.
 * Le format JSON est celui du fichier `boxes.json` et des payloads SSE.
 *
 * FONCTIONNEMENT :
 * - StatusBox = un indicateur affiché sur le tableau de bord
 * - Event = instruction transitoire (création, mise à jour, suppression...)
 * - Les durées optionnelles sont des `Option<Duration>` : "" ou absent = non défini
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

/// Nombre maximum de messages conservés par box (les plus anciens sont jetés)
pub const MAX_MESSAGES: usize = 30;

/// Ancre utilisée quand une box nouvellement créée est la première affichée
pub const STATUS_BAR_ANCHOR: &str = "status-bar";

/// Taille d'affichage, ordonnée de la plus petite à la plus grande.
/// L'ordre de déclaration sert au tri du store (taille décroissante).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxSize {
    #[default]
    Dot,
    Micro,
    Dmicro,
    Small,
    Dsmall,
    Medium,
    Dmedium,
    Large,
    Dlarge,
    Xlarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "grey", alias = "gray")]
    Grey,
    #[serde(rename = "red")]
    Red,
    #[serde(rename = "amber")]
    Amber,
    #[serde(rename = "green")]
    Green,
    #[serde(rename = "noUpdate")]
    NoUpdate,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Grey => "grey",
            Status::Red => "red",
            Status::Amber => "amber",
            Status::Green => "green",
            Status::NoUpdate => "noUpdate",
        };
        f.write_str(name)
    }
}

/// Entrée de l'historique d'une box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub status: Status,
    #[serde(rename = "timeStamp", with = "time::serde::rfc3339")]
    pub time_stamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: String,
}

/// Une box du tableau de bord.
///
/// `links` et `info` sont opaques pour le kernel : ils ne servent qu'à l'affichage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBox {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default)]
    pub size: BoxSize,
    #[serde(default)]
    pub status: Status,
    #[serde(default, with = "optional_duration")]
    pub expire_after: Option<Duration>,
    #[serde(default, rename = "maxTBU", with = "optional_duration")]
    pub max_tbu: Option<Duration>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl StatusBox {
    pub fn new(name: impl Into<String>, size: BoxSize) -> Self {
        Self {
            name: name.into(),
            size,
            ..Self::default()
        }
    }

    /// Ajoute un message en tête de l'historique, borné à MAX_MESSAGES
    pub fn record_message(&mut self, message: Message) {
        self.messages.insert(0, message);
        self.messages.truncate(MAX_MESSAGES);
    }

    /// Dernière mise à jour réelle. Les anciens snapshots écrivent
    /// `0001-01-01T00:00:00Z` pour une box jamais horodatée : traité comme absent.
    pub fn stamped_at(&self) -> Option<OffsetDateTime> {
        self.last_update.filter(|t| !is_zero_time(*t))
    }
}

/// Horodatage "zéro" (an 1) hérité des anciens fichiers de données
pub fn is_zero_time(t: OffsetDateTime) -> bool {
    t.year() <= 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    CreateBox,
    #[default]
    UpdateBox,
    DeleteBox,
    ReloadPage,
    Keepalive,
    NoUpdate,
}

/// Événement transitoire poussé vers les navigateurs via le broker.
/// Jamais persisté.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub after: String,
    #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
    pub status_box: Option<StatusBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, rename = "lastMessage", skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, with = "optional_duration")]
    pub expire_after: Option<Duration>,
    #[serde(default, rename = "maxTBU", with = "optional_duration")]
    pub max_tbu: Option<Duration>,
    #[serde(default, rename = "type")]
    pub event_type: EventType,
}

impl Event {
    pub fn created(status_box: StatusBox, after: impl Into<String>) -> Self {
        Self {
            after: after.into(),
            status_box: Some(status_box),
            event_type: EventType::CreateBox,
            ..Self::default()
        }
    }

    pub fn deleted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: EventType::DeleteBox,
            ..Self::default()
        }
    }

    pub fn keepalive() -> Self {
        Self {
            event_type: EventType::Keepalive,
            ..Self::default()
        }
    }

    pub fn reload_page() -> Self {
        Self {
            event_type: EventType::ReloadPage,
            ..Self::default()
        }
    }

    /// Passage en `noUpdate` d'une box restée muette plus de `max_tbu`
    pub fn no_update(id: impl Into<String>, max_tbu: Duration) -> Self {
        Self {
            id: id.into(),
            status: Some(Status::NoUpdate),
            message: format!("No new updates for {}.", humantime::format_duration(max_tbu)),
            event_type: EventType::NoUpdate,
            ..Self::default()
        }
    }

    /// Payload texte tel qu'il circule dans les mailboxes
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Lit une durée texte : "90s", "1m30s", "2h"... ou un entier de secondes ("30").
/// Une chaîne vide signifie "non défini".
pub fn parse_duration(text: &str) -> Result<Option<Duration>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    match humantime::parse_duration(text) {
        Ok(duration) => Ok(Some(duration)),
        Err(human_err) => text
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| format!("invalid duration {text:?}: {human_err}")),
    }
}

/// (Dé)sérialisation serde des durées optionnelles.
/// Entrée : "" / null / absent = None, texte = durée humaine, nombre = nanosecondes.
/// Sortie : texte humain, ou "" quand non défini.
pub mod optional_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Text(String),
        Nanos(u64),
        Float(f64),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&humantime::format_duration(*duration).to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<RawDuration>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawDuration::Text(text)) => super::parse_duration(&text).map_err(de::Error::custom),
            Some(RawDuration::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos))),
            Some(RawDuration::Float(nanos)) if nanos >= 0.0 => Ok(Some(Duration::from_nanos(nanos as u64))),
            Some(RawDuration::Float(nanos)) => Err(de::Error::custom(format!("negative duration: {nanos}"))),
        }
    }
}
