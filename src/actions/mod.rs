//! Device action configuration.
//!
//! Actions are what a dispatcher sends when a window starts or stops. They are
//! plain data resolved against a few window variables; the scheduling core never
//! sees them.

pub mod expression;

pub use expression::{evaluate_expression, evaluate_template, format_number, ExpressionError, Variables};

use serde::{Deserialize, Serialize};

use crate::domain::ActionWindow;

/// A configured value: literal, or a template with `{expr}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawActionValue", into = "RawActionValue")]
pub enum ActionValue {
    Fixed(String),
    Computed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawActionValue {
    Number(f64),
    Text(String),
}

impl From<RawActionValue> for ActionValue {
    fn from(raw: RawActionValue) -> Self {
        match raw {
            RawActionValue::Number(n) => ActionValue::Fixed(format_number(n)),
            RawActionValue::Text(s) if s.contains('{') => ActionValue::Computed(s),
            RawActionValue::Text(s) => ActionValue::Fixed(s),
        }
    }
}

impl From<ActionValue> for RawActionValue {
    fn from(value: ActionValue) -> Self {
        match value {
            ActionValue::Fixed(s) | ActionValue::Computed(s) => RawActionValue::Text(s),
        }
    }
}

impl ActionValue {
    pub fn resolve(&self, vars: &Variables) -> Result<String, ExpressionError> {
        match self {
            ActionValue::Fixed(s) => Ok(s.clone()),
            ActionValue::Computed(template) => evaluate_template(template, vars),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceAction {
    Mqtt {
        topic: String,
        payload: ActionValue,
    },
    Service {
        service: String,
        entity_id: String,
        #[serde(default)]
        value: Option<ActionValue>,
    },
}

/// An action with every value resolved, ready to send
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedAction {
    Mqtt {
        topic: String,
        payload: String,
    },
    Service {
        service: String,
        entity_id: String,
        value: Option<String>,
    },
}

impl DeviceAction {
    pub fn resolve(&self, vars: &Variables) -> Result<ResolvedAction, ExpressionError> {
        Ok(match self {
            DeviceAction::Mqtt { topic, payload } => ResolvedAction::Mqtt {
                topic: topic.clone(),
                payload: payload.resolve(vars)?,
            },
            DeviceAction::Service {
                service,
                entity_id,
                value,
            } => ResolvedAction::Service {
                service: service.clone(),
                entity_id: entity_id.clone(),
                value: value.as_ref().map(|v| v.resolve(vars)).transpose()?,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    Stop,
}

/// Actions sent at the start and at the end of a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSet {
    #[serde(default)]
    pub start: Vec<DeviceAction>,
    #[serde(default)]
    pub stop: Vec<DeviceAction>,
}

impl ActionSet {
    pub fn resolve(&self, edge: Edge, vars: &Variables) -> Result<Vec<ResolvedAction>, ExpressionError> {
        let actions = match edge {
            Edge::Start => &self.start,
            Edge::Stop => &self.stop,
        };
        actions.iter().map(|a| a.resolve(vars)).collect()
    }
}

/// Variables a window exposes to action templates
pub fn window_variables(window: &ActionWindow) -> Variables {
    let minutes = (window.end - window.start).num_minutes() as f64;
    let mut vars = Variables::new();
    vars.insert("duration_minutes".into(), minutes);
    vars.insert("slot_count".into(), window.slots.len() as f64);
    if let Some(energy) = window.energy_kwh {
        vars.insert("energy_kwh".into(), energy);
        if minutes > 0.0 {
            let kw = energy / (minutes / 60.0);
            vars.insert("power_kw".into(), kw);
            vars.insert("power_watts".into(), kw * 1000.0);
        }
    }
    vars
}
