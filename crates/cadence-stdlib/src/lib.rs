//!
//! Standard library of components for the Cadence flow engine
//!
//! | Type | Operations | Accessors |
//! |---|---|---|
//! | `Value` | `emit` | `value` |
//! | `Template` | `render` | `text` |
//! | `Select` | `search` (JMESPath) | `result` |
//! | `Delay` | `wait` | |
//! | `SubFlow` | `invoke`, `dispatch` | `result`, `invocation` |
//! | `Uuid` | `generate` | `value` |

use cadence_core::ComponentRegistry;

pub mod components;

use crate::components::{
    delay_component, select_component, sub_flow_component, template_component, uuid_component,
    value_component,
};

/// Register every standard component type into `registry`
pub fn register_all(registry: &mut ComponentRegistry) -> &mut ComponentRegistry {
    registry
        .register(value_component())
        .register(template_component())
        .register(select_component())
        .register(delay_component())
        .register(sub_flow_component())
        .register(uuid_component())
}

/// A registry holding only the standard component types
pub fn components() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    register_all(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_types_registered() {
        let registry = components();
        let mut names = registry.type_names();
        names.sort();
        assert_eq!(names, vec!["Delay", "Select", "SubFlow", "Template", "Uuid", "Value"]);
    }
}
