//! Payload validation for pushed entries.

use fieldsync_protocol::PushEntry;

/// Decides whether a pushed entry may be written.
///
/// A rejection is answered with `rejected-validation` and the returned
/// reason; the device keeps the entry unsynced until its owner fixes it.
pub trait PayloadValidator: Send + Sync {
    /// Returns the rejection reason, if any.
    fn validate(&self, entry: &PushEntry) -> Result<(), String>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&PushEntry) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, entry: &PushEntry) -> Result<(), String> {
        self(entry)
    }
}

/// Structural checks every deployment wants.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl PayloadValidator for DefaultValidator {
    fn validate(&self, entry: &PushEntry) -> Result<(), String> {
        let payload = &entry.payload;
        if payload.id != entry.record_id {
            return Err(format!(
                "payload id {} does not match record {}",
                payload.id, entry.record_id
            ));
        }
        if payload.entity_type.trim().is_empty() {
            return Err("entity type is empty".to_string());
        }
        if entry.operation.is_delete() != payload.deleted {
            return Err("delete flag does not match operation".to_string());
        }
        if !payload.deleted && payload.payload.is_empty() {
            return Err("payload is empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldsync_protocol::{EntryId, Operation, RecordId, SyncRecord};

    fn entry(operation: Operation, payload: &[u8]) -> PushEntry {
        let record = SyncRecord::new(
            RecordId::from_u128(4),
            "meter-reading",
            1,
            Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
            payload.to_vec(),
        );
        PushEntry {
            entry_id: EntryId::from_u128(1),
            record_id: record.id,
            base_version: 0,
            operation,
            payload: record,
        }
    }

    #[test]
    fn accepts_well_formed_entry() {
        assert!(DefaultValidator.validate(&entry(Operation::Create, b"42")).is_ok());
    }

    #[test]
    fn rejects_empty_payload() {
        let err = DefaultValidator.validate(&entry(Operation::Update, b"")).unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn accepts_tombstone_without_payload() {
        let mut e = entry(Operation::Delete, b"");
        e.payload = e.payload.tombstone(2, e.payload.updated_at);
        assert!(DefaultValidator.validate(&e).is_ok());
    }

    #[test]
    fn rejects_mismatched_record_id() {
        let mut e = entry(Operation::Update, b"1");
        e.record_id = RecordId::from_u128(5);
        assert!(DefaultValidator.validate(&e).is_err());
    }

    #[test]
    fn closures_are_validators() {
        let no_negatives = |e: &PushEntry| {
            if e.payload.payload.first() == Some(&b'-') {
                Err("reading must not be negative".to_string())
            } else {
                Ok(())
            }
        };
        assert!(no_negatives.validate(&entry(Operation::Create, b"-1")).is_err());
        assert!(no_negatives.validate(&entry(Operation::Create, b"1")).is_ok());
    }
}
