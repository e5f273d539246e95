//! `ServiceEnvelope`: the record every heartbeat and publish helper carries
//! (spec §3). `message_id` is fresh per publish; `service_id` is stable for
//! the lifetime of the process (spec invariant 4).

use uuid::Uuid;

use crate::codec::{FieldValue, Record};

/// 128-bit opaque identifier, matching the original's `uuid4().hex` ids.
pub type ConnectorId = Uuid;

pub fn new_message_id() -> ConnectorId {
    Uuid::new_v4()
}

/// A service envelope: stable `service_id`, fresh `message_id`, and an
/// application-defined payload.
#[derive(Debug, Clone)]
pub struct ServiceEnvelope {
    pub message_id: ConnectorId,
    pub service_id: ConnectorId,
    pub fields: Record,
}

impl ServiceEnvelope {
    pub fn new(service_id: ConnectorId, fields: Record) -> Self {
        Self {
            message_id: new_message_id(),
            service_id,
            fields,
        }
    }

    /// Turns the envelope into a wire record with `message_id`/`service_id`
    /// injected as top-level fields, the way `emit_mq_message` injects
    /// `message_id` into the caller's `request_data` dict.
    pub fn into_record(self) -> Record {
        let mut record = self.fields;
        record.insert(
            "message_id".to_string(),
            FieldValue::Text(self.message_id.to_string()),
        );
        record.insert(
            "service_id".to_string(),
            FieldValue::Text(self.service_id.to_string()),
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique_per_call() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn into_record_carries_both_ids() {
        let service_id = Uuid::new_v4();
        let envelope = ServiceEnvelope::new(service_id, Record::new());
        let message_id = envelope.message_id;
        let record = envelope.into_record();
        assert_eq!(
            record.get("service_id").unwrap().as_text(),
            Some(service_id.to_string().as_str())
        );
        assert_eq!(
            record.get("message_id").unwrap().as_text(),
            Some(message_id.to_string().as_str())
        );
    }
}
