use crate::error::McodaError;
use crate::models::{NewAgent, NewTask};

/// Static validators for workspace entity keys and free-text fields, mirroring
/// the teacher's `TaskValidator` conventions.
pub struct Validator;

impl Validator {
    /// Keys look like "P", "P-E1", "P-E1-US1", "P-E1-US1-T01": uppercase-led
    /// segments joined by hyphens, no blank segments.
    pub fn validate_key(key: &str) -> Result<(), McodaError> {
        if key.is_empty() || key.len() > 64 {
            return Err(McodaError::validation(
                "key",
                "must be 1-64 characters",
            ));
        }
        let first = key.chars().next().unwrap();
        if !first.is_ascii_alphanumeric() {
            return Err(McodaError::validation(
                "key",
                "must start with a letter or digit",
            ));
        }
        if key.ends_with('-') || key.contains("--") {
            return Err(McodaError::validation(
                "key",
                "must not end with or contain a double hyphen",
            ));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(McodaError::validation(
                "key",
                "must contain only alphanumerics and hyphens",
            ));
        }
        Ok(())
    }

    pub fn validate_name(name: &str) -> Result<(), McodaError> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.len() > 200 {
            return Err(McodaError::validation(
                "name",
                "must be 1-200 characters after trimming",
            ));
        }
        Ok(())
    }

    pub fn validate_description(description: &str) -> Result<(), McodaError> {
        let trimmed = description.trim();
        if trimmed.len() > 2000 {
            return Err(McodaError::validation(
                "description",
                "must be at most 2000 characters after trimming",
            ));
        }
        Ok(())
    }

    pub fn validate_priority(priority: f64) -> Result<(), McodaError> {
        if !(0.0..=10.0).contains(&priority) {
            return Err(McodaError::validation(
                "priority",
                "must be between 0.0 and 10.0",
            ));
        }
        Ok(())
    }

    pub fn validate_agent_slug(slug: &str) -> Result<(), McodaError> {
        if slug.is_empty() || slug.len() > 50 {
            return Err(McodaError::validation(
                "slug",
                "must be 1-50 characters",
            ));
        }
        let first = slug.chars().next().unwrap();
        let last = slug.chars().last().unwrap();
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(McodaError::validation(
                "slug",
                "must start and end with an alphanumeric character",
            ));
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(McodaError::validation(
                "slug",
                "must contain only alphanumerics, hyphens, and underscores",
            ));
        }
        Ok(())
    }

    pub fn validate_new_task(task: &NewTask) -> Result<(), McodaError> {
        Self::validate_key(&task.key)?;
        Self::validate_name(&task.name)?;
        Self::validate_description(&task.description)?;
        Self::validate_priority(task.priority)?;
        Ok(())
    }

    pub fn validate_new_agent(agent: &NewAgent) -> Result<(), McodaError> {
        Self::validate_agent_slug(&agent.slug)?;
        if agent.adapter.trim().is_empty() {
            return Err(McodaError::validation("adapter", "must not be empty"));
        }
        if agent.cost_per_million < 0.0 {
            return Err(McodaError::validation(
                "cost_per_million",
                "must not be negative",
            ));
        }
        if agent.max_complexity < 1 || agent.max_complexity > 10 {
            return Err(McodaError::validation(
                "max_complexity",
                "must be between 1 and 10",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_keys() {
        assert!(Validator::validate_key("P-E1-US1-T01").is_ok());
        assert!(Validator::validate_key("P").is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(Validator::validate_key("").is_err());
        assert!(Validator::validate_key("P--E1").is_err());
        assert!(Validator::validate_key("P-E1-").is_err());
        assert!(Validator::validate_key("-P-E1").is_err());
    }

    #[test]
    fn rejects_out_of_range_priority() {
        assert!(Validator::validate_priority(-1.0).is_err());
        assert!(Validator::validate_priority(10.1).is_err());
        assert!(Validator::validate_priority(5.0).is_ok());
    }

    #[test]
    fn agent_slug_rules() {
        assert!(Validator::validate_agent_slug("claude-opus").is_ok());
        assert!(Validator::validate_agent_slug("-bad").is_err());
        assert!(Validator::validate_agent_slug("bad-").is_err());
    }
}
