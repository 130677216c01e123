/**
 * ALIVE KERNEL - Tableau de bord de statuts en temps réel
 *
 * RÔLE : Boxes de statut alimentées par API, diffusées aux navigateurs en SSE,
 * avec expiration / détection d'inactivité et snapshots JSON sur disque.
 *
 * ARCHITECTURE : Store (RwLock) + Broker (task coordinatrice) + Maintenance (tick) + Snapshots.
 */

pub mod broker;
pub mod config;
pub mod dashboard;
pub mod http;
pub mod maintenance;
pub mod models;
pub mod persistence;
pub mod store;
pub mod viewer;
