use crate::constants::limits::{MAX_PORT, MIN_PORT};
use crate::errors::StepError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static env name pattern"));

#[derive(Clone, Default)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    /// Rejects missing and all-whitespace input with `"<field> is null or empty"`.
    pub fn ensure_present(&self, value: Option<&str>, field: &str) -> Result<String, StepError> {
        match value {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(StepError::missing(field)),
        }
    }

    pub fn ensure_string(&self, value: Option<&Value>, field: &str) -> Result<String, StepError> {
        let text = value.and_then(|v| v.as_str());
        self.ensure_present(text, field)
            .map(|text| text.trim().to_string())
    }

    pub fn ensure_optional_string(
        &self,
        value: Option<&Value>,
        field: &str,
    ) -> Result<Option<String>, StepError> {
        match value {
            None => Ok(None),
            Some(val) if val.is_null() => Ok(None),
            Some(val) => {
                let text = val.as_str().ok_or_else(|| {
                    StepError::validation(format!("{} must be a string", field))
                })?;
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
        }
    }

    pub fn ensure_port(&self, value: Option<&Value>, fallback: u16) -> Result<u16, StepError> {
        let Some(value) = value else {
            return Ok(fallback);
        };
        if value.is_null() {
            return Ok(fallback);
        }
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .ok_or_else(Self::port_error)?;
        if numeric < MIN_PORT as i64 || numeric > MAX_PORT as i64 {
            return Err(Self::port_error());
        }
        Ok(numeric as u16)
    }

    fn port_error() -> StepError {
        StepError::validation(format!(
            "port must be an integer between {} and {}",
            MIN_PORT, MAX_PORT
        ))
    }

    pub fn ensure_env(
        &self,
        value: Option<&Value>,
    ) -> Result<BTreeMap<String, String>, StepError> {
        let mut out = BTreeMap::new();
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return Ok(out);
        };
        let obj = value
            .as_object()
            .ok_or_else(|| StepError::validation("env must be an object"))?;
        for (key, val) in obj {
            self.ensure_env_name(key)?;
            let rendered = val
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| val.to_string());
            out.insert(key.clone(), rendered);
        }
        Ok(out)
    }

    pub fn ensure_env_name(&self, name: &str) -> Result<(), StepError> {
        if ENV_NAME.is_match(name) {
            Ok(())
        } else {
            Err(StepError::validation(format!(
                "env variable name is invalid: {}",
                name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_present_rejects_blank() {
        let validation = Validation::new();
        for raw in [None, Some(""), Some("   "), Some("\n\t")] {
            let err = validation.ensure_present(raw, "script").unwrap_err();
            assert_eq!(err.message, "script is null or empty");
        }
        assert_eq!(
            validation.ensure_present(Some(" ls -la "), "command").unwrap(),
            " ls -la "
        );
    }

    #[test]
    fn ensure_port_bounds() {
        let validation = Validation::new();
        assert_eq!(validation.ensure_port(None, 22).unwrap(), 22);
        assert_eq!(validation.ensure_port(Some(&json!("2222")), 22).unwrap(), 2222);
        assert!(validation.ensure_port(Some(&json!(0)), 22).is_err());
        assert!(validation.ensure_port(Some(&json!(70000)), 22).is_err());
    }

    #[test]
    fn ensure_env_checks_names() {
        let validation = Validation::new();
        let env = validation
            .ensure_env(Some(&json!({"DEPLOY_ENV": "prod", "RETRIES": 3})))
            .unwrap();
        assert_eq!(env.get("RETRIES").map(String::as_str), Some("3"));
        assert!(validation.ensure_env(Some(&json!({"BAD-NAME": "x"}))).is_err());
    }
}
