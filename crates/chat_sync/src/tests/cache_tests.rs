use super::*;
use crate::tests_support::raw;

fn c(id: &str) -> ConversationId {
    ConversationId::from(id)
}

#[test]
fn conversations_are_isolated() {
    let mut cache = ConversationCache::new();
    cache.seed(&c("c1"), vec![raw("m-1", "c1", "u-1", "a")]);
    cache.append(&c("c2"), raw("m-1", "c2", "u-1", "a"));

    assert_eq!(cache.snapshot(&c("c1")).len(), 1);
    assert_eq!(cache.snapshot(&c("c2")).len(), 1);
    cache.remove(&c("c1"), &MessageId::from("m-1"));
    assert!(cache.snapshot(&c("c1")).is_empty());
    assert_eq!(cache.snapshot(&c("c2")).len(), 1);
}

#[test]
fn get_put_invalidate() {
    let mut cache = ConversationCache::new();
    assert!(cache.get(&c("c1")).is_none());

    let mut log = MessageLog::new(c("c1"));
    log.append(raw("m-1", "c1", "u-1", "a"));
    cache.put(c("c1"), log);
    assert_eq!(cache.get(&c("c1")).map(MessageLog::len), Some(1));

    let evicted = cache.invalidate(&c("c1")).expect("evicted");
    assert_eq!(evicted.len(), 1);
    assert!(!cache.contains(&c("c1")));
}

#[test]
fn late_confirmation_against_evicted_conversation_is_discarded() {
    let mut cache = ConversationCache::new();
    cache.append(&c("c1"), raw("temp-1", "c1", "me", "x"));
    cache.invalidate(&c("c1"));

    let outcome = cache.replace(&c("c1"), &MessageId::from("temp-1"), raw("m-1", "c1", "me", "x"));
    assert_eq!(outcome, None);
    assert!(cache.remove(&c("c1"), &MessageId::from("temp-1")).is_none());
    assert!(!cache.contains(&c("c1")));
}

#[test]
fn clear_keeps_the_conversation_known() {
    let mut cache = ConversationCache::new();
    cache.seed(&c("c1"), vec![raw("m-1", "c1", "u-1", "a")]);
    cache.clear(&c("c1"));
    assert!(cache.contains(&c("c1")));
    assert!(cache.snapshot(&c("c1")).is_empty());

    cache.clear_all();
    assert!(!cache.contains(&c("c1")));
}

#[test]
fn mark_read_on_unknown_conversation_is_a_no_op() {
    let mut cache = ConversationCache::new();
    assert_eq!(cache.mark_read(&c("missing"), &UserId::from("u-1")), 0);
    assert!(!cache.contains(&c("missing")));
}
