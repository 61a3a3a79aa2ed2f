use shared::{domain::UserId, protocol::ParticipantRef};

/// Resolves any participant reference to its canonical id.
///
/// Objects are searched for `_id` first and `id` second, recursively.
/// Anything without a usable id yields [`UserId::unknown`]; this never fails.
pub fn resolve_identity(reference: &ParticipantRef) -> UserId {
    resolve_raw(reference)
        .map(UserId)
        .unwrap_or_else(UserId::unknown)
}

/// Raw form used for message and conversation ids, which have no sentinel.
pub(crate) fn resolve_raw(reference: &ParticipantRef) -> Option<String> {
    match reference {
        ParticipantRef::Id(value) => {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        ParticipantRef::Number(value) => Some(value.to_string()),
        ParticipantRef::Object(object) => object
            .object_id
            .as_deref()
            .and_then(resolve_raw)
            .or_else(|| object.id.as_deref().and_then(resolve_raw)),
        ParticipantRef::Other(serde_json::Value::Number(value)) => Some(value.to_string()),
        ParticipantRef::Other(_) => None,
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
