//! Current date and time.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use speda_conversation::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CurrentDateTimeArgs {
    /// IANA timezone, e.g. "Europe/Istanbul". Defaults to the user's timezone.
    #[serde(default)]
    timezone: Option<String>,
}

/// `get_current_datetime`: reports the current local date and time.
#[derive(Debug, Default)]
pub struct CurrentDateTime;

impl Tool for CurrentDateTime {
    type Args = CurrentDateTimeArgs;
    const NAME: &'static str = "get_current_datetime";

    fn description(&self) -> &str {
        "Get the current date and time. Use this when you need to know the current time for scheduling or reference."
    }

    async fn execute(
        &self,
        args: CurrentDateTimeArgs,
        context: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let zone = match args.timezone.or_else(|| context.timezone.clone()) {
            Some(name) => name.parse::<Tz>().map_err(|e| ToolError::InvalidInput {
                name: Self::NAME.to_string(),
                reason: format!("unknown timezone '{name}': {e}"),
            })?,
            None => Tz::UTC,
        };
        Ok(describe(Utc::now(), zone, context.location.as_ref()))
    }
}

fn describe(now: DateTime<Utc>, zone: Tz, location: Option<&JsonValue>) -> JsonValue {
    let local = now.with_timezone(&zone);
    let mut result = json!({
        "datetime": local.to_rfc3339(),
        "date": local.format("%Y-%m-%d").to_string(),
        "time": local.format("%H:%M:%S").to_string(),
        "day_of_week": local.format("%A").to_string(),
        "timezone": zone.name(),
    });
    if let Some(location) = location {
        result["location"] = location.clone();
    }
    result
}
