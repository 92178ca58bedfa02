use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a value is strictly positive
    pub fn validate_positive(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// Validate that a URL parses and uses one of the allowed schemes
    pub fn validate_url(value: &str, schemes: &[&str], field_name: &str) -> ConfigResult<()> {
        let parsed = url::Url::parse(value)
            .map_err(|e| ConfigError::Validation(format!("{field_name} is not a valid URL: {e}")))?;
        if !schemes.contains(&parsed.scheme()) {
            return Err(ConfigError::Validation(format!(
                "{field_name} must use one of the schemes {schemes:?}, got {}",
                parsed.scheme()
            )));
        }
        Ok(())
    }

    /// Validate a ratio in the closed interval [0, 1]
    pub fn validate_ratio(value: f64, field_name: &str) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be between 0.0 and 1.0"
            )));
        }
        Ok(())
    }
}
