//! In-app channel: writes the recipient's inbox row.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::types::{ChannelType, OutboundMessage, Recipient};

use crate::sender::{ChannelSender, DeliveryReceipt, SendError};

/// Postgres `foreign_key_violation`.
const FOREIGN_KEY_VIOLATION: &str = "23503";

pub struct InAppSender {
    pool: PgPool,
}

impl InAppSender {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn classify(err: sqlx::Error) -> SendError {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                SendError::Permanent("recipient no longer exists".to_string())
            }
            _ => SendError::Transient(format!("inbox write failed: {}", err)),
        }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> ChannelType {
        ChannelType::InApp
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let id = Uuid::new_v4();

        // A retried attempt after a lost acknowledgement must not duplicate the inbox row.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, recipient_id, broadcast_id, title, body, kind, priority, related_object, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (broadcast_id, recipient_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(recipient.user_id)
        .bind(message.broadcast_id)
        .bind(&message.title)
        .bind(&message.body)
        .bind(message.kind.to_string())
        .bind(message.priority.to_string())
        .bind(sqlx::types::Json(&message.related_object))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::classify)?;

        match inserted {
            Some((id,)) => Ok(DeliveryReceipt::with_id(id.to_string())),
            None => {
                tracing::debug!(
                    broadcast_id = %message.broadcast_id,
                    recipient_id = %recipient.user_id,
                    "Inbox row already present"
                );
                Ok(DeliveryReceipt::default())
            }
        }
    }
}
