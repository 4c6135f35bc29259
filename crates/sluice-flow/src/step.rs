//! Step-facing request and response types.

use serde::{Deserialize, Serialize};

use sluice_core::ConsumerId;

use crate::constraint::Strategy;
use crate::consumer::{AcquireMode, HoldingScope};
use crate::error::{Error, Result};

/// How a step names the constraint it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDefinition {
    /// Constraint name, unique within the owner.
    pub name: String,
    /// Capacity used if the constraint does not exist yet.
    pub capacity: u32,
    /// Strategy name; only `FIFO` is supported.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    Strategy::Fifo.as_str().to_string()
}

impl ConstraintDefinition {
    /// Parses the strategy name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown strategy.
    pub fn strategy(&self) -> Result<Strategy> {
        self.strategy.parse()
    }
}

/// A step's request to hold permits of a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Owner scope of the constraint (typically the account).
    pub owner_id: String,
    /// The constraint to acquire.
    pub constraint: ConstraintDefinition,
    /// Resource unit, possibly a `<+path>` template.
    pub resource_unit: String,
    /// Permits to hold.
    pub permits: u32,
    /// Acquire mode.
    pub acquire_mode: AcquireMode,
    /// Scope whose end releases the permits.
    pub holding_scope: HoldingScope,
    /// Identifier of the step claiming the permits.
    pub claimant_id: String,
}

impl StepSpec {
    /// Validates the parts of the step that do not need the store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for non-positive permits, blank
    /// identifiers or an unknown strategy.
    pub fn validate(&self) -> Result<()> {
        if self.permits == 0 {
            return Err(Error::configuration("permits must be positive, got 0"));
        }
        if self.claimant_id.trim().is_empty() {
            return Err(Error::configuration("claimant id must not be empty"));
        }
        if self.holding_scope.scope_id.trim().is_empty() {
            return Err(Error::configuration("holding scope id must not be empty"));
        }
        self.constraint.strategy()?;
        Ok(())
    }
}

/// What the engine should do with a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResponse {
    /// The step holds its permits and succeeded.
    Done {
        /// The consumer holding the permits, if any.
        #[serde(rename = "consumerId", skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
    },
    /// The step is suspended until a resume signal for `callback_id`.
    Waiting {
        /// Callback id; equal to the consumer id.
        #[serde(rename = "callbackId")]
        callback_id: ConsumerId,
    },
    /// The step failed and will never acquire its permits.
    Failed {
        /// The consumer, if one was created.
        #[serde(rename = "consumerId", skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
        /// Failure description.
        reason: String,
    },
}

impl StepResponse {
    /// Creates a `Done` response for a consumer.
    #[must_use]
    pub const fn done(consumer_id: ConsumerId) -> Self {
        Self::Done {
            consumer_id: Some(consumer_id),
        }
    }

    /// Returns true for `Done`.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Returns true for `Waiting`.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Returns true for `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns the callback id of a `Waiting` response.
    #[must_use]
    pub const fn callback_id(&self) -> Option<ConsumerId> {
        match self {
            Self::Waiting { callback_id } => Some(*callback_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ScopeType;

    fn spec() -> StepSpec {
        StepSpec {
            owner_id: "acct".into(),
            constraint: ConstraintDefinition {
                name: "deploy".into(),
                capacity: 1,
                strategy: "FIFO".into(),
            },
            resource_unit: "<+env>".into(),
            permits: 1,
            acquire_mode: AcquireMode::Ensure,
            holding_scope: HoldingScope::stage("stage-1"),
            claimant_id: "step-1".into(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        spec().validate().unwrap();
    }

    #[test]
    fn zero_permits_is_configuration_error() {
        let mut spec = spec();
        spec.permits = 0;
        assert!(matches!(spec.validate(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn unknown_strategy_is_configuration_error() {
        let mut spec = spec();
        spec.constraint.strategy = "PRIORITY".into();
        assert!(matches!(spec.validate(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let json = r#"{
            "ownerId": "acct",
            "constraint": {"name": "deploy", "capacity": 2},
            "resourceUnit": "prod",
            "permits": 1,
            "acquireMode": "ACCUMULATE",
            "holdingScope": {"scopeType": "RUN", "scopeId": "run-7"},
            "claimantId": "step-9"
        }"#;
        let spec: StepSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.acquire_mode, AcquireMode::Accumulate);
        assert_eq!(spec.holding_scope.scope_type, ScopeType::Run);
        assert_eq!(spec.constraint.strategy().unwrap(), Strategy::Fifo);
    }

    #[test]
    fn response_is_tagged_by_status() {
        let id = ConsumerId::generate();
        let json = serde_json::to_value(StepResponse::Waiting { callback_id: id }).unwrap();
        assert_eq!(json["status"], "WAITING");
        assert_eq!(json["callbackId"], id.to_string());
        assert_eq!(StepResponse::Waiting { callback_id: id }.callback_id(), Some(id));
    }
}
