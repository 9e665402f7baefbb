use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Free-form feature-usage payload merged into the private `_wandb.t`
/// config key (§3). Opaque to everything except the Sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub title: String,
    pub text: String,
    pub level: AlertLevel,
    #[serde(with = "duration_secs", default)]
    pub wait: Option<Duration>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_some(&value.map(|d| d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Request to attach an already-logged artifact to a named portfolio
/// (§3, §4.10 sendLinkArtifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkArtifactRecord {
    pub artifact_id: String,
    pub portfolio_name: String,
}

/// Terminal record marking a run's completion (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
}
