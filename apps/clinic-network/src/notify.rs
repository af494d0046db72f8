//! Despacho de notificações push, sem garantia de entrega.
//!
//! As notificações entram numa fila limitada e são entregues por uma tarefa
//! em segundo plano. Fila cheia ou falha de entrega geram apenas log; a
//! mutação que originou a notificação já foi confirmada.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Corpo enviado para `POST /api/send-notification`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Falha de transporte: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(error: reqwest::Error) -> Self {
        NotifyError::Transport(error.to_string())
    }
}

/// Destino final das notificações
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Envia notificações para o endpoint HTTP de push
pub struct HttpNotificationSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotificationSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/send-notification", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        // O corpo da resposta é ignorado
        self.client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Usado quando nenhum endpoint de push está configurado
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(user_id = %notification.user_id, title = %notification.title, "Notificação (sem endpoint)");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// Cria a fila e inicia a tarefa de entrega
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Notification>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                match sink.deliver(&notification).await {
                    Ok(()) => debug!(user_id = %notification.user_id, "Notificação entregue"),
                    Err(e) => warn!(user_id = %notification.user_id, error = %e, "Falha ao entregar notificação"),
                }
            }
            debug!("Fila de notificações encerrada");
        });

        (Self { sender }, worker)
    }

    /// Enfileira sem bloquear; nunca falha para quem chama
    pub fn notify(&self, user_id: Uuid, title: impl Into<String>, body: impl Into<String>) {
        let notification = Notification {
            user_id,
            title: title.into(),
            body: body.into(),
        };

        if let Err(e) = self.sender.try_send(notification) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "fila cheia",
                mpsc::error::TrySendError::Closed(_) => "fila encerrada",
            };
            warn!(%user_id, reason, "Notificação descartada");
        }
    }
}
