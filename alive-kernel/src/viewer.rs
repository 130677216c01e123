//! Service d'un viewer SSE : lit sa mailbox et écrit chaque message
//! sous la forme `data: <payload>\n\n`, avec flush immédiat.

use crate::broker::Mailbox;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("Streaming unsupported!")]
    StreamingUnsupported,
    #[error("viewer connection error: {0}")]
    Io(#[from] io::Error),
}

/// Trame SSE d'un message
pub fn frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Pousse les messages de `mailbox` vers `writer` jusqu'à fermeture de la mailbox,
/// annulation, ou erreur d'écriture (connexion perdue).
/// La mailbox est droppée en sortie : le viewer se désinscrit du broker.
pub async fn serve<W>(mut mailbox: Mailbox, writer: &mut W, cancel: CancellationToken) -> Result<(), ViewerError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = mailbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        writer.write_all(frame(&message).as_bytes()).await?;
        writer.flush().await.map_err(|e| match e.kind() {
            io::ErrorKind::Unsupported => ViewerError::StreamingUnsupported,
            _ => ViewerError::Io(e),
        })?;
    }
    debug!(client = %mailbox.id(), "viewer stream finished");
    Ok(())
}
