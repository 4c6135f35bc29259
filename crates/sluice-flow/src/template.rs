//! Resource-unit template resolution.
//!
//! A resource unit may be written as a template such as
//! `deploy-<+pipeline.variables.env>`; each `<+path>` expression is replaced
//! by the value of `path` in the step's [`ExecutionContext`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const OPEN: &str = "<+";
const CLOSE: char = '>';

/// Variables visible to a step attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Variable values keyed by dotted path.
    pub variables: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    #[must_use]
    pub fn with_variable(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(path.into(), value.into());
        self
    }

    /// Resolves every `<+path>` expression in `template`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if an expression is unterminated or
    /// empty, names an unknown variable, or the result is blank.
    pub fn resolve(&self, template: &str) -> Result<String> {
        let mut resolved = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            resolved.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let Some(end) = after.find(CLOSE) else {
                return Err(Error::InvalidInput(format!(
                    "unterminated expression in resource unit '{template}'"
                )));
            };

            let path = after[..end].trim();
            if path.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "empty expression in resource unit '{template}'"
                )));
            }
            let value = self.variables.get(path).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "resource unit '{template}' references unknown variable '{path}'"
                ))
            })?;
            resolved.push_str(value);
            rest = &after[end + CLOSE.len_utf8()..];
        }
        resolved.push_str(rest);

        if resolved.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "resource unit '{template}' resolved to an empty value"
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new()
            .with_variable("env.name", "prod")
            .with_variable("region", "eu-west-1")
    }

    #[test]
    fn literal_passes_through() {
        assert_eq!(ctx().resolve("shared-db").unwrap(), "shared-db");
    }

    #[test]
    fn substitutes_every_expression() {
        let resolved = ctx().resolve("deploy-<+env.name>-<+ region >").unwrap();
        assert_eq!(resolved, "deploy-prod-eu-west-1");
    }

    #[test]
    fn unknown_variable_is_invalid_input() {
        let err = ctx().resolve("<+missing>").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("missing")));
    }

    #[test]
    fn unterminated_expression_is_invalid_input() {
        assert!(matches!(
            ctx().resolve("deploy-<+env.name"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn blank_result_is_invalid_input() {
        let context = ExecutionContext::new().with_variable("blank", "  ");
        assert!(context.resolve("<+blank>").is_err());
        assert!(context.resolve("").is_err());
        assert!(context.resolve("<+>").is_err());
    }
}
