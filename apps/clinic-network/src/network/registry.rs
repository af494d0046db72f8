//! Cadastro das partes, pacientes, planos e grupos usados pela rede

use chrono::Utc;
use common_db::models::{Ally, Clinic, PatientGroup, PatientServicePlan, Person};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::NetworkService;
use crate::error::{NetworkError, NetworkResult};

/// Duração máxima de um plano (cem anos)
pub const MAX_PLAN_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Deserialize)]
pub struct NewClinic {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub owner_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAlly {
    pub full_name: String,
    pub specialty: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPerson {
    pub clinic_id: Uuid,
    /// Conta do portal, se o paciente tiver uma
    pub user_id: Option<Uuid>,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

fn require_name(value: &str, field: &str) -> NetworkResult<()> {
    if value.trim().is_empty() {
        return Err(NetworkError::Validation(format!("{} é obrigatório", field)));
    }
    Ok(())
}

impl NetworkService {
    pub async fn register_clinic(&self, new: NewClinic) -> NetworkResult<Clinic> {
        require_name(&new.name, "name")?;
        let clinic = Clinic {
            id: Uuid::new_v4(),
            name: new.name,
            address: new.address,
            phone: new.phone,
            email: new.email,
            owner_id: new.owner_id,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO clinics (id, name, address, phone, email, owner_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(clinic.id)
        .bind(&clinic.name)
        .bind(&clinic.address)
        .bind(&clinic.phone)
        .bind(&clinic.email)
        .bind(clinic.owner_id)
        .bind(clinic.created_at)
        .execute(self.pool())
        .await?;

        info!(clinic_id = %clinic.id, "Clínica cadastrada");
        Ok(clinic)
    }

    pub async fn register_ally(&self, new: NewAlly) -> NetworkResult<Ally> {
        require_name(&new.full_name, "full_name")?;
        let ally = Ally {
            id: Uuid::new_v4(),
            full_name: new.full_name,
            specialty: new.specialty,
            phone: new.phone,
            email: new.email,
            user_id: new.user_id,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO allies (id, full_name, specialty, phone, email, user_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ally.id)
        .bind(&ally.full_name)
        .bind(&ally.specialty)
        .bind(&ally.phone)
        .bind(&ally.email)
        .bind(ally.user_id)
        .bind(ally.created_at)
        .execute(self.pool())
        .await?;

        info!(ally_id = %ally.id, "Aliado cadastrado");
        Ok(ally)
    }

    pub async fn register_person(&self, new: NewPerson) -> NetworkResult<Person> {
        require_name(&new.full_name, "full_name")?;
        self.get_clinic(new.clinic_id).await?;

        let person = Person {
            id: Uuid::new_v4(),
            clinic_id: new.clinic_id,
            user_id: new.user_id,
            full_name: new.full_name,
            phone: new.phone,
            email: new.email,
            group_id: None,
            current_plan_id: None,
            subscription_start: None,
            subscription_end: None,
            points: 0,
            rank: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO persons (id, clinic_id, user_id, full_name, phone, email, points, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(person.id)
        .bind(person.clinic_id)
        .bind(person.user_id)
        .bind(&person.full_name)
        .bind(&person.phone)
        .bind(&person.email)
        .bind(person.created_at)
        .execute(self.pool())
        .await?;

        Ok(person)
    }

    pub async fn get_clinic(&self, id: Uuid) -> NetworkResult<Clinic> {
        sqlx::query_as::<_, Clinic>("SELECT * FROM clinics WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Clínica", id))
    }

    pub async fn get_person(&self, id: Uuid) -> NetworkResult<Person> {
        sqlx::query_as::<_, Person>("SELECT * FROM persons WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Paciente", id))
    }

    pub async fn create_plan(
        &self,
        clinic_id: Uuid,
        name: &str,
        duration_days: i64,
        max_consultations: Option<i64>,
    ) -> NetworkResult<PatientServicePlan> {
        require_name(name, "name")?;
        if !(1..=MAX_PLAN_DAYS).contains(&duration_days) {
            return Err(NetworkError::Validation(format!(
                "duration_days deve estar entre 1 e {}",
                MAX_PLAN_DAYS
            )));
        }
        self.get_clinic(clinic_id).await?;

        let plan = PatientServicePlan {
            id: Uuid::new_v4(),
            clinic_id,
            name: name.to_string(),
            duration_days,
            max_consultations,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO patient_service_plans (id, clinic_id, name, duration_days, max_consultations, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(plan.id)
        .bind(plan.clinic_id)
        .bind(&plan.name)
        .bind(plan.duration_days)
        .bind(plan.max_consultations)
        .bind(plan.created_at)
        .execute(self.pool())
        .await?;

        Ok(plan)
    }

    pub async fn create_group(&self, clinic_id: Uuid, name: &str) -> NetworkResult<PatientGroup> {
        require_name(name, "name")?;
        self.get_clinic(clinic_id).await?;

        let group = PatientGroup {
            id: Uuid::new_v4(),
            clinic_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO patient_groups (id, clinic_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(group.id)
            .bind(group.clinic_id)
            .bind(&group.name)
            .bind(group.created_at)
            .execute(self.pool())
            .await?;

        Ok(group)
    }

    /// Coloca o paciente no grupo; ambos precisam ser da mesma clínica
    pub async fn add_person_to_group(&self, person_id: Uuid, group_id: Uuid) -> NetworkResult<()> {
        let person = self.get_person(person_id).await?;
        let group = self.get_group(group_id).await?;
        if person.clinic_id != group.clinic_id {
            return Err(NetworkError::Validation(
                "paciente e grupo pertencem a clínicas diferentes".to_string(),
            ));
        }

        sqlx::query("UPDATE persons SET group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(person_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_group(&self, id: Uuid) -> NetworkResult<PatientGroup> {
        sqlx::query_as::<_, PatientGroup>("SELECT * FROM patient_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| NetworkError::not_found("Grupo", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{clinic, harness};
    use common_db::models::Party;

    #[tokio::test]
    async fn load_party_resolves_name_and_owner() {
        let h = harness().await;
        let party = clinic(&h, "Clínica Norte").await;

        let profile = h.load_party(party).await.unwrap();
        assert_eq!(profile.name, "Clínica Norte");

        let missing = h.load_party(Party::Ally(party.id())).await;
        assert!(matches!(missing, Err(NetworkError::NotFound { .. })));
    }

    #[tokio::test]
    async fn person_requires_existing_clinic() {
        let h = harness().await;
        let result = h
            .register_person(NewPerson {
                clinic_id: Uuid::new_v4(),
                user_id: None,
                full_name: "Juan Pérez".into(),
                phone: None,
                email: None,
            })
            .await;
        assert!(matches!(result, Err(NetworkError::NotFound { .. })));
    }

    #[tokio::test]
    async fn group_membership_stays_within_clinic() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let b = clinic(&h, "B").await;
        let person = h
            .register_person(NewPerson {
                clinic_id: a.id(),
                user_id: None,
                full_name: "Juan Pérez".into(),
                phone: None,
                email: None,
            })
            .await
            .unwrap();
        let other_group = h.create_group(b.id(), "Família").await.unwrap();

        let result = h.add_person_to_group(person.id, other_group.id).await;
        assert!(matches!(result, Err(NetworkError::Validation(_))));
    }

    #[tokio::test]
    async fn plan_duration_must_be_within_bounds() {
        let h = harness().await;
        let a = clinic(&h, "A").await;
        let result = h.create_plan(a.id(), "Mensal", 0, None).await;
        assert!(matches!(result, Err(NetworkError::Validation(_))));
        let result = h.create_plan(a.id(), "Eterno", 1_000_000_000, None).await;
        assert!(matches!(result, Err(NetworkError::Validation(_))));

        let longest = h.create_plan(a.id(), "Secular", MAX_PLAN_DAYS, None).await.unwrap();
        assert_eq!(longest.duration_days, MAX_PLAN_DAYS);
    }
}
