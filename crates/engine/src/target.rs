//! Target resolution: a [`TargetSpec`] becomes a concrete recipient list.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::TargetSpec;

use crate::directory::RecipientDirectory;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("custom recipient list has {count} entries, limit is {limit}")]
    TooManyRecipients { count: usize, limit: usize },

    #[error("custom recipient list is empty")]
    EmptyCustomList,

    #[error("directory lookup failed: {0}")]
    Directory(#[from] AppError),
}

impl From<TargetError> for AppError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Directory(inner) => inner,
            other => AppError::Validation(other.to_string()),
        }
    }
}

/// Outcome of resolving a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Deduplicated, in first-seen order.
    pub recipients: Vec<Uuid>,
    /// Explicitly listed IDs that name no active user.
    pub unknown: Vec<Uuid>,
}

pub struct TargetResolver {
    directory: Arc<dyn RecipientDirectory>,
    max_custom: usize,
}

impl TargetResolver {
    pub fn new(directory: Arc<dyn RecipientDirectory>, max_custom: usize) -> Self {
        Self {
            directory,
            max_custom,
        }
    }

    pub fn validate(&self, spec: &TargetSpec) -> Result<(), TargetError> {
        validate(spec, self.max_custom)
    }

    pub async fn resolve(&self, spec: &TargetSpec) -> Result<Resolution, TargetError> {
        self.validate(spec)?;

        let resolution = match spec {
            TargetSpec::AllOfRole(role) => {
                Resolution::from_group(self.directory.users_with_role(*role).await?)
            }
            TargetSpec::BySubject(subject_id) => {
                Resolution::from_group(self.directory.students_in_subject(*subject_id).await?)
            }
            TargetSpec::ByTutor(tutor_id) => {
                Resolution::from_group(self.directory.students_of_tutor(*tutor_id).await?)
            }
            TargetSpec::ByTeacher(teacher_id) => {
                Resolution::from_group(self.directory.students_of_teacher(*teacher_id).await?)
            }
            TargetSpec::Custom(ids) => {
                let ids = dedup(ids.iter().copied());
                let existing = self.directory.existing_users(&ids).await?;
                let (recipients, unknown): (Vec<Uuid>, Vec<Uuid>) =
                    ids.into_iter().partition(|id| existing.contains(id));
                Resolution {
                    recipients,
                    unknown,
                }
            }
        };

        if resolution.recipients.is_empty() {
            tracing::warn!(target_type = spec.kind(), "Target resolved to zero recipients");
        }
        if !resolution.unknown.is_empty() {
            tracing::warn!(
                target_type = spec.kind(),
                unknown = resolution.unknown.len(),
                "Target lists unknown recipients"
            );
        }

        Ok(resolution)
    }
}

/// Checks that need no directory access. Run at creation time and again
/// before resolution.
pub fn validate(spec: &TargetSpec, max_custom: usize) -> Result<(), TargetError> {
    if let TargetSpec::Custom(ids) = spec {
        if ids.is_empty() {
            return Err(TargetError::EmptyCustomList);
        }
        if ids.len() > max_custom {
            return Err(TargetError::TooManyRecipients {
                count: ids.len(),
                limit: max_custom,
            });
        }
    }
    Ok(())
}

impl Resolution {
    fn from_group(ids: Vec<Uuid>) -> Self {
        Self {
            recipients: dedup(ids),
            unknown: Vec::new(),
        }
    }
}

fn dedup(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
