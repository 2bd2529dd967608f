//! Read-only view of the platform's users and relationships.
//!
//! The pipeline never writes here; it only asks who belongs to a group and
//! where to reach them. Inactive users are invisible to every query.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Recipient, Role};

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn users_with_role(&self, role: Role) -> Result<Vec<Uuid>, AppError>;

    async fn students_in_subject(&self, subject_id: Uuid) -> Result<Vec<Uuid>, AppError>;

    async fn students_of_tutor(&self, tutor_id: Uuid) -> Result<Vec<Uuid>, AppError>;

    /// Students enrolled in any subject the teacher teaches.
    async fn students_of_teacher(&self, teacher_id: Uuid) -> Result<Vec<Uuid>, AppError>;

    /// The subset of `ids` that name active users.
    async fn existing_users(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError>;

    /// Channel addresses for each known user in `ids`.
    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Recipient>, AppError>;
}

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ids(&self, sql: &str, key: Uuid) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl RecipientDirectory for PgDirectory {
    async fn users_with_role(&self, role: Role) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM users WHERE role = $1 AND is_active ORDER BY created_at, id",
        )
        .bind(role.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn students_in_subject(&self, subject_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        self.ids(
            r#"
            SELECT u.id
            FROM enrollments e
            JOIN users u ON u.id = e.student_id
            WHERE e.subject_id = $1 AND u.is_active
            ORDER BY u.created_at, u.id
            "#,
            subject_id,
        )
        .await
    }

    async fn students_of_tutor(&self, tutor_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        self.ids(
            r#"
            SELECT u.id
            FROM tutor_students ts
            JOIN users u ON u.id = ts.student_id
            WHERE ts.tutor_id = $1 AND u.is_active
            ORDER BY u.created_at, u.id
            "#,
            tutor_id,
        )
        .await
    }

    async fn students_of_teacher(&self, teacher_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        self.ids(
            r#"
            SELECT u.id
            FROM users u
            WHERE u.is_active
              AND EXISTS (
                  SELECT 1
                  FROM enrollments e
                  JOIN teacher_subjects t ON t.subject_id = e.subject_id
                  WHERE t.teacher_id = $1 AND e.student_id = u.id
              )
            ORDER BY u.created_at, u.id
            "#,
            teacher_id,
        )
        .await
    }

    async fn existing_users(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE id = ANY($1) AND is_active")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Recipient>, AppError> {
        let rows: Vec<Recipient> = sqlx::query_as(
            "SELECT id, email, phone, push_token, chat_id FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.user_id, r)).collect())
    }
}

/// In-memory directory, built up front.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    users: Vec<(Recipient, Role, bool)>,
    enrollments: Vec<(Uuid, Uuid)>,
    tutoring: Vec<(Uuid, Uuid)>,
    teaching: Vec<(Uuid, Uuid)>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, recipient: Recipient, role: Role) -> Self {
        self.users.push((recipient, role, true));
        self
    }

    pub fn inactive_user(mut self, recipient: Recipient, role: Role) -> Self {
        self.users.push((recipient, role, false));
        self
    }

    pub fn enroll(mut self, student: Uuid, subject: Uuid) -> Self {
        self.enrollments.push((student, subject));
        self
    }

    pub fn tutor(mut self, tutor: Uuid, student: Uuid) -> Self {
        self.tutoring.push((tutor, student));
        self
    }

    pub fn teach(mut self, teacher: Uuid, subject: Uuid) -> Self {
        self.teaching.push((teacher, subject));
        self
    }

    fn is_active(&self, id: Uuid) -> bool {
        self.users
            .iter()
            .any(|(r, _, active)| r.user_id == id && *active)
    }

    fn active_in_order(&self, wanted: &HashSet<Uuid>) -> Vec<Uuid> {
        self.users
            .iter()
            .filter(|(r, _, active)| *active && wanted.contains(&r.user_id))
            .map(|(r, _, _)| r.user_id)
            .collect()
    }
}

#[async_trait]
impl RecipientDirectory for MemoryDirectory {
    async fn users_with_role(&self, role: Role) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .users
            .iter()
            .filter(|(_, r, active)| *r == role && *active)
            .map(|(r, _, _)| r.user_id)
            .collect())
    }

    async fn students_in_subject(&self, subject_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let wanted = self
            .enrollments
            .iter()
            .filter(|(_, s)| *s == subject_id)
            .map(|(student, _)| *student)
            .collect();
        Ok(self.active_in_order(&wanted))
    }

    async fn students_of_tutor(&self, tutor_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let wanted = self
            .tutoring
            .iter()
            .filter(|(t, _)| *t == tutor_id)
            .map(|(_, student)| *student)
            .collect();
        Ok(self.active_in_order(&wanted))
    }

    async fn students_of_teacher(&self, teacher_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let subjects: HashSet<Uuid> = self
            .teaching
            .iter()
            .filter(|(t, _)| *t == teacher_id)
            .map(|(_, s)| *s)
            .collect();
        let wanted = self
            .enrollments
            .iter()
            .filter(|(_, s)| subjects.contains(s))
            .map(|(student, _)| *student)
            .collect();
        Ok(self.active_in_order(&wanted))
    }

    async fn existing_users(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError> {
        Ok(ids.iter().copied().filter(|id| self.is_active(*id)).collect())
    }

    async fn contacts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Recipient>, AppError> {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        Ok(self
            .users
            .iter()
            .filter(|(r, _, _)| wanted.contains(&r.user_id))
            .map(|(r, _, _)| (r.user_id, r.clone()))
            .collect())
    }
}
