//! Assinatura compartilhada por grupo de pacientes.
//!
//! Cada grupo tem no máximo uma assinatura (`group_id` único); atribuir um
//! plano de novo sobrescreve a janela em vez de criar outra linha.

use chrono::{Duration, Utc};
use common_db::models::{Party, PatientServicePlan, SharedSubscription};
use tracing::{info, warn};
use uuid::Uuid;

use super::NetworkService;
use crate::error::{NetworkError, NetworkResult};
use crate::events::EntityKind;

impl NetworkService {
    /// Janela `[agora, agora + duração do plano]` para o grupo inteiro
    pub async fn assign_plan_to_group(
        &self,
        acting: Party,
        group_id: Uuid,
        plan_id: Uuid,
    ) -> NetworkResult<SharedSubscription> {
        let group = self.get_group(group_id).await?;
        let owner = Party::Clinic(group.clinic_id);
        if acting != owner {
            warn!(%group_id, %acting, "Atribuição de plano fora da clínica do grupo");
            return Err(NetworkError::Forbidden(
                "apenas a clínica do grupo pode atribuir planos".to_string(),
            ));
        }

        // Planos de outras clínicas não existem para este grupo
        let plan = sqlx::query_as::<_, PatientServicePlan>(
            "SELECT * FROM patient_service_plans WHERE id = ? AND clinic_id = ?",
        )
        .bind(plan_id)
        .bind(group.clinic_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(NetworkError::PlanNotFound(plan_id))?;

        let start = Utc::now();
        let end = Duration::try_days(plan.duration_days)
            .and_then(|span| start.checked_add_signed(span))
            .ok_or_else(|| {
                NetworkError::Validation(format!(
                    "duração do plano fora do intervalo: {} dias",
                    plan.duration_days
                ))
            })?;

        let mut tx = self.pool().begin().await?;
        let subscription = sqlx::query_as::<_, SharedSubscription>(
            "INSERT INTO shared_subscriptions \
               (id, group_id, plan_id, start_date, end_date, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?4, ?4) \
             ON CONFLICT(group_id) DO UPDATE SET \
               plan_id = excluded.plan_id, \
               start_date = excluded.start_date, \
               end_date = excluded.end_date, \
               updated_at = excluded.updated_at \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(group_id)
        .bind(plan.id)
        .bind(start)
        .bind(end)
        .fetch_one(&mut *tx)
        .await?;

        let members = sqlx::query(
            "UPDATE persons SET current_plan_id = ?, subscription_start = ?, subscription_end = ? \
             WHERE group_id = ?",
        )
        .bind(plan.id)
        .bind(start)
        .bind(end)
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            %group_id,
            plan_id = %plan.id,
            members = members.rows_affected(),
            "Plano atribuído ao grupo"
        );
        self.events()
            .publish(EntityKind::SharedSubscription, subscription.id, vec![owner]);
        Ok(subscription)
    }

    pub async fn get_group_subscription(
        &self,
        group_id: Uuid,
    ) -> NetworkResult<Option<SharedSubscription>> {
        self.get_group(group_id).await?;
        let subscription = sqlx::query_as::<_, SharedSubscription>(
            "SELECT * FROM shared_subscriptions WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(subscription)
    }
}
