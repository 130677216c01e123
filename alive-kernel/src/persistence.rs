/**
 * SNAPSHOTS - Persistance JSON du store avec historique .bak1 … .bak9
 *
 * FONCTIONNEMENT (save) :
 * 1. Sérialise la liste complète des boxes
 * 2. Écrit le JSON dans `<fichier>.tmp`
 * 3. Rotation : supprime .bak9, décale .bak{n} -> .bak{n+1} (n = 8..1), live -> .bak1
 * 4. Renomme le .tmp sur le fichier live
 *
 * Une erreur de rotation est loggée sans interrompre la sauvegarde.
 * `load` n'est utilisé qu'au démarrage ; son échec est fatal pour le process.
 */

use crate::models::StatusBox;
use crate::store::BoxStore;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info};

pub const BOX_FILE_NAME: &str = "boxes.json";
pub const MAX_BACKUPS: u8 = 9;

const EMPTY_DATA_FILE: &str = "[]";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/boxes.json`
    pub fn in_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::new(data_dir.as_ref().join(BOX_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self, generation: u8) -> PathBuf {
        self.sibling(&format!("bak{generation}"))
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Crée le dossier de données et un fichier vide (`[]`) s'ils n'existent pas
    pub async fn ensure_exists(&self) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        if !fs::try_exists(&self.path).await? {
            fs::write(&self.path, EMPTY_DATA_FILE).await?;
            info!(file = %self.path.display(), "created empty data file");
        }
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<StatusBox>, PersistenceError> {
        let content = fs::read(&self.path).await?;
        let boxes: Vec<StatusBox> = serde_json::from_slice(&content)?;
        info!(count = boxes.len(), file = %self.path.display(), "loaded boxes from data file");
        Ok(boxes)
    }

    /// Écrit l'état courant du store
    pub async fn save(&self, store: &BoxStore) -> Result<(), PersistenceError> {
        self.save_boxes(&store.get_all()).await
    }

    pub async fn save_boxes(&self, boxes: &[StatusBox]) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(boxes)?;
        let temp = self.temp_path();
        fs::write(&temp, &json).await?;

        self.rotate_backups().await;

        fs::rename(&temp, &self.path).await?;
        debug!(count = boxes.len(), file = %self.path.display(), "saved data file");
        Ok(())
    }

    async fn rotate_backups(&self) {
        let oldest = self.backup_path(MAX_BACKUPS);
        match fs::remove_file(&oldest).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(file = %oldest.display(), "failed to remove oldest backup: {e}"),
        }

        for generation in (1..MAX_BACKUPS).rev() {
            shift(&self.backup_path(generation), &self.backup_path(generation + 1)).await;
        }
        shift(&self.path, &self.backup_path(1)).await;
    }
}

async fn shift(from: &Path, to: &Path) {
    match fs::rename(from, to).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => error!(from = %from.display(), to = %to.display(), "failed to rotate backup: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoxSize;

    fn store_with(name: &str) -> BoxStore {
        let store = BoxStore::new();
        store.add(StatusBox::new(name, BoxSize::Medium)).unwrap();
        store
    }

    async fn read_names(path: &Path) -> Vec<String> {
        let content = fs::read(path).await.unwrap();
        let boxes: Vec<StatusBox> = serde_json::from_slice(&content).unwrap();
        boxes.into_iter().map(|b| b.name).collect()
    }

    #[tokio::test]
    async fn test_second_save_moves_first_to_bak1() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path());

        snapshots.save(&store_with("A")).await.unwrap();
        snapshots.save(&store_with("B")).await.unwrap();

        assert_eq!(read_names(snapshots.path()).await, vec!["B"]);
        assert_eq!(read_names(&snapshots.backup_path(1)).await, vec!["A"]);
        assert!(!snapshots.backup_path(2).exists());
        assert!(!snapshots.temp_path().exists());
    }

    #[tokio::test]
    async fn test_backup_chain_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path());

        for i in 0..12 {
            snapshots.save(&store_with(&format!("gen{i}"))).await.unwrap();
        }

        assert_eq!(read_names(snapshots.path()).await, vec!["gen11"]);
        assert_eq!(read_names(&snapshots.backup_path(1)).await, vec!["gen10"]);
        assert_eq!(read_names(&snapshots.backup_path(9)).await, vec!["gen2"]);
        assert!(!snapshots.backup_path(10).exists());
    }

    #[tokio::test]
    async fn test_rotation_failure_does_not_abort_save() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path());
        snapshots.save(&store_with("A")).await.unwrap();

        // .bak9 impossible à supprimer : un dossier non vide
        let oldest = snapshots.backup_path(MAX_BACKUPS);
        fs::create_dir(&oldest).await.unwrap();
        fs::write(oldest.join("keep"), "x").await.unwrap();

        snapshots.save(&store_with("B")).await.unwrap();
        assert_eq!(read_names(snapshots.path()).await, vec!["B"]);
        assert_eq!(read_names(&snapshots.backup_path(1)).await, vec!["A"]);
        assert!(oldest.join("keep").exists());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_sorted_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path());
        let store = BoxStore::new();
        store.add(StatusBox::new("b", BoxSize::Small)).unwrap();
        store.add(StatusBox::new("a", BoxSize::Small)).unwrap();
        store.add(StatusBox::new("z", BoxSize::Xlarge)).unwrap();

        snapshots.save(&store).await.unwrap();
        let reloaded = BoxStore::from_snapshot(snapshots.load().await.unwrap());
        assert_eq!(reloaded.get_all(), store.get_all());
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path().join("nested").join("data"));

        snapshots.ensure_exists().await.unwrap();
        assert!(snapshots.load().await.unwrap().is_empty());

        // un fichier existant n'est pas écrasé
        snapshots.save(&store_with("keep")).await.unwrap();
        snapshots.ensure_exists().await.unwrap();
        assert_eq!(read_names(snapshots.path()).await, vec!["keep"]);
    }

    #[tokio::test]
    async fn test_load_failures() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotFile::in_dir(dir.path());
        assert!(matches!(snapshots.load().await, Err(PersistenceError::Io(_))));

        fs::write(snapshots.path(), "{not json").await.unwrap();
        assert!(matches!(snapshots.load().await, Err(PersistenceError::Json(_))));
    }
}
