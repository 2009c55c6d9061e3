use crate::context::{external_name, internal_key, FieldValue, WorkItemContext};
use std::collections::BTreeMap;

/// Sandboxed read/write view of a work item's fields for script rules.
///
/// Reads never fail: unknown fields read as the empty string. Writes are
/// buffered under the external (dotted) field name and are also visible to
/// later reads within the same run.
#[derive(Debug, Clone, Default)]
pub struct FieldAccessor {
    fields: BTreeMap<String, FieldValue>,
    changes: BTreeMap<String, String>,
}

impl FieldAccessor {
    pub fn new(ctx: &WorkItemContext) -> Self {
        Self {
            fields: ctx.fields.clone(),
            changes: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> String {
        self.fields
            .get(&internal_key(name))
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.fields
            .insert(internal_key(name), FieldValue::String(value.clone()));
        self.changes.insert(external_name(name), value);
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Buffered writes keyed by external field name.
    pub fn changes(&self) -> &BTreeMap<String, String> {
        &self.changes
    }

    /// Fold the buffered writes into `ctx`.
    pub fn commit(self, ctx: &mut WorkItemContext) {
        for (name, value) in self.changes {
            ctx.set(&name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_reads_empty() {
        let acc = FieldAccessor::new(&WorkItemContext::new(1));
        assert_eq!(acc.get("Nope.Field"), "");
    }

    #[test]
    fn reads_accept_dotted_or_internal_names() {
        let ctx = WorkItemContext::new(1).with_field("System.State", "Active");
        let acc = FieldAccessor::new(&ctx);
        assert_eq!(acc.get("System.State"), "Active");
        assert_eq!(acc.get("System_State"), "Active");
    }

    #[test]
    fn set_buffers_under_external_name_and_is_readable() {
        let ctx = WorkItemContext::new(1);
        let mut acc = FieldAccessor::new(&ctx);
        acc.set("Custom_Size", "large");
        acc.set("Title", "x");
        assert!(acc.has_changes());
        assert_eq!(acc.changes()["Custom.Size"], "large");
        assert_eq!(acc.changes()["Title"], "x");
        assert_eq!(acc.get("Custom.Size"), "large");
    }

    #[test]
    fn commit_applies_to_context() {
        let mut ctx = WorkItemContext::new(1);
        let mut acc = FieldAccessor::new(&ctx);
        acc.set("Custom.Size", "small");
        acc.commit(&mut ctx);
        assert_eq!(ctx.field_str("Custom_Size"), "small");
    }
}
