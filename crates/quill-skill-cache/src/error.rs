use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Enumerates failures raised by cache configuration and persistence.
pub enum SkillCacheError {
    #[error("skill id must be non-empty")]
    InvalidSkillId,
    #[error("skill '{0}' has no bucket policy")]
    UnknownSkill(String),
    #[error("invalid bucket policy: {0}")]
    InvalidPolicy(String),
    #[error("failed to persist cache for skill '{skill_id}': {message}")]
    Persist { skill_id: String, message: String },
}
