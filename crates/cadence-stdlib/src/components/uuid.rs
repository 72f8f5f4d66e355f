use cadence_core::{ComponentType, FlowValue, ValueKind};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

/// UUID Generator component
///
/// Generates v4 UUID values in various formats.
#[derive(Debug, Default)]
pub struct UuidGenerator {
    format: Option<String>,
    value: String,
}

/// The `Uuid` component type
pub fn uuid_component() -> ComponentType<UuidGenerator> {
    ComponentType::<UuidGenerator>::new("Uuid")
        .default_constructor()
        .property("format", ValueKind::Data, |generator, value| {
            generator.format = value.as_data().and_then(JsonValue::as_str).map(str::to_string);
            Ok(())
        })
        .operation("generate", |generator, api| async move {
            let mut generator = generator.lock().await;
            generator.value = format_uuid(Uuid::new_v4(), generator.format.as_deref());
            debug!(flow = %api.flow_name(), step = %api.step_name(), "Generated UUID");
            Ok(())
        })
        .accessor("value", ValueKind::Data, |generator| {
            FlowValue::data(JsonValue::String(generator.value.clone()))
        })
}

/// Format UUID based on preference
pub fn format_uuid(uuid: Uuid, format: Option<&str>) -> String {
    match format.unwrap_or("standard") {
        "simple" => uuid.as_simple().to_string(),
        "urn" => uuid.as_urn().to_string(),
        "braced" => format!("{{{}}}", uuid.as_hyphenated()),
        _ => uuid.as_hyphenated().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        let uuid = Uuid::nil();
        assert_eq!(format_uuid(uuid, None), "00000000-0000-0000-0000-000000000000");
        assert_eq!(format_uuid(uuid, Some("simple")), "00000000000000000000000000000000");
        assert_eq!(format_uuid(uuid, Some("urn")), "urn:uuid:00000000-0000-0000-0000-000000000000");
        assert_eq!(format_uuid(uuid, Some("braced")), "{00000000-0000-0000-0000-000000000000}");
    }
}
