use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Represents a packet of data flowing through the system
///
/// This is a wrapper around a JSON value with some helper methods
/// for working with data in different formats.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null data packet
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Check if the data packet is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to convert the data packet to a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Try to convert the data packet to an integer
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// Try to convert the data packet to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }
}

/// Newtype for flow names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowId(pub String);

/// Newtype for step names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StepId(pub String);

/// Opaque per-invocation identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvocationId(pub String);

impl InvocationId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InvocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ambient caller context captured alongside an invocation
pub type AmbientContext = HashMap<String, serde_json::Value>;

/// A live component instance shared between steps.
///
/// The value sits behind an async mutex so that setters, operations and
/// accessors of successive steps can all reach the same object.
#[derive(Clone)]
pub struct Instance {
    type_name: Arc<str>,
    cell: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    /// Wrap a freshly constructed value of the named component type
    pub fn new<T: Send + 'static>(type_name: impl Into<Arc<str>>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Component type name this instance was registered under
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Typed access to the underlying value
    pub fn downcast<T: Send + 'static>(&self) -> Option<Arc<Mutex<T>>> {
        Arc::clone(&self.cell).downcast::<Mutex<T>>().ok()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.cell) as *const u8,
            Arc::as_ptr(&other.cell) as *const u8,
        )
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance<{}>@{:p}", self.type_name, Arc::as_ptr(&self.cell) as *const u8)
    }
}

/// A value produced or consumed by a step: plain data or a component instance
#[derive(Clone, Debug)]
pub enum FlowValue {
    /// JSON data
    Data(DataPacket),
    /// A component instance
    Instance(Instance),
}

impl FlowValue {
    /// The default result of a flow that produces nothing
    pub fn null() -> Self {
        FlowValue::Data(DataPacket::null())
    }

    /// Build a data value from JSON
    pub fn data(value: serde_json::Value) -> Self {
        FlowValue::Data(DataPacket::new(value))
    }

    /// Borrow the JSON payload when this is data
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            FlowValue::Data(packet) => Some(packet.as_value()),
            FlowValue::Instance(_) => None,
        }
    }

    /// Borrow the instance when this is one
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            FlowValue::Instance(instance) => Some(instance),
            FlowValue::Data(_) => None,
        }
    }

    /// Whether this is JSON null
    pub fn is_null(&self) -> bool {
        matches!(self, FlowValue::Data(packet) if packet.is_null())
    }

    /// Short, log friendly rendering
    pub fn summary(&self) -> String {
        match self {
            FlowValue::Data(packet) => {
                let mut text = packet.as_value().to_string();
                if text.len() > 120 {
                    let mut cut = 117;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str("...");
                }
                text
            }
            FlowValue::Instance(instance) => format!("<{}>", instance.type_name()),
        }
    }

    /// The kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            FlowValue::Data(_) => ValueKind::Data,
            FlowValue::Instance(instance) => ValueKind::Instance(instance.type_name().to_string()),
        }
    }
}

impl PartialEq for FlowValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlowValue::Data(a), FlowValue::Data(b)) => a == b,
            (FlowValue::Instance(a), FlowValue::Instance(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for FlowValue {
    fn from(value: serde_json::Value) -> Self {
        FlowValue::data(value)
    }
}

impl From<DataPacket> for FlowValue {
    fn from(packet: DataPacket) -> Self {
        FlowValue::Data(packet)
    }
}

impl From<Instance> for FlowValue {
    fn from(instance: Instance) -> Self {
        FlowValue::Instance(instance)
    }
}

/// Declared kind of a property, accessor result or flow input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Anything
    #[default]
    Any,
    /// JSON data only
    Data,
    /// An instance of the named component type
    Instance(String),
}

impl ValueKind {
    /// Whether a value of kind `offered` may be bound where `self` is expected
    pub fn accepts(&self, offered: &ValueKind) -> bool {
        match (self, offered) {
            (ValueKind::Any, _) => true,
            // Unknown until runtime; checked again when the value arrives
            (_, ValueKind::Any) => true,
            (ValueKind::Data, ValueKind::Data) => true,
            (ValueKind::Instance(expected), ValueKind::Instance(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Any => f.write_str("any"),
            ValueKind::Data => f.write_str("data"),
            ValueKind::Instance(name) => write!(f, "instance<{}>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_packet_creation() {
        let packet = DataPacket::new(json!({"name": "test"}));
        assert_eq!(packet.as_value()["name"], "test");
        assert!(DataPacket::null().is_null());
    }

    #[tokio::test]
    async fn test_instance_downcast_and_identity() {
        let instance = Instance::new("Counter", 41_u32);
        let cell = instance.downcast::<u32>().expect("u32 instance");
        *cell.lock().await += 1;

        let again = instance.downcast::<u32>().expect("u32 instance");
        assert_eq!(*again.lock().await, 42);
        assert!(instance.downcast::<String>().is_none());

        let copy = instance.clone();
        assert!(copy.ptr_eq(&instance));
        assert!(!Instance::new("Counter", 41_u32).ptr_eq(&instance));
    }

    #[test]
    fn test_flow_value_equality() {
        let instance = Instance::new("Thing", ());
        assert_eq!(FlowValue::from(json!(1)), FlowValue::from(json!(1)));
        assert_eq!(FlowValue::from(instance.clone()), FlowValue::from(instance.clone()));
        assert_ne!(FlowValue::from(instance), FlowValue::from(json!(null)));
        assert!(FlowValue::null().is_null());
    }

    #[test]
    fn test_summary_truncates_long_data() {
        let value = FlowValue::data(json!("x".repeat(500)));
        assert!(value.summary().len() <= 120);
        assert_eq!(FlowValue::from(Instance::new("Thing", ())).summary(), "<Thing>");
    }

    #[test]
    fn test_value_kind_compatibility() {
        let counter = ValueKind::Instance("Counter".into());
        assert!(ValueKind::Any.accepts(&ValueKind::Data));
        assert!(ValueKind::Data.accepts(&ValueKind::Any));
        assert!(counter.accepts(&ValueKind::Instance("Counter".into())));
        assert!(!counter.accepts(&ValueKind::Instance("Other".into())));
        assert!(!ValueKind::Data.accepts(&counter));
        assert!(!counter.accepts(&ValueKind::Data));
    }

    #[test]
    fn test_value_kind_serde() {
        let parse = |yaml: &str| -> ValueKind {
            serde_yaml::with::singleton_map::deserialize(serde_yaml::Deserializer::from_str(yaml))
                .unwrap()
        };
        let kind = parse("data");
        assert_eq!(kind, ValueKind::Data);
        let kind = parse("instance: Counter");
        assert_eq!(kind, ValueKind::Instance("Counter".into()));
    }
}
