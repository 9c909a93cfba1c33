use shared::protocol::MessageContent;

use super::*;
use crate::test_support::{at, chat, conversation, me, page, server_message, them};

fn order(index: &ConversationIndex) -> Vec<String> {
    index
        .conversations()
        .into_iter()
        .map(|c| c.id.to_string())
        .collect()
}

#[test]
fn loaded_list_is_sorted_newest_first_without_duplicates() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![
        conversation("a", at(10), 0),
        conversation("b", at(30), 1),
        conversation("a", at(99), 5),
        conversation("c", at(20), 2),
    ]);

    assert_eq!(order(&index), vec!["b", "c", "a"]);
    assert_eq!(index.get(&chat("a")).map(|c| c.unread_count), Some(0));
}

#[test]
fn incoming_message_moves_conversation_to_front_and_counts_unread() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0), conversation("b", at(30), 0)]);

    let incoming = server_message("m1", "a", &them(), "ping", at(40));
    assert!(index.record_message(&incoming, &me()));

    assert_eq!(order(&index), vec!["a", "b"]);
    let a = index.get(&chat("a")).expect("conversation a");
    assert_eq!(a.unread_count, 1);
    assert_eq!(a.last_message.as_ref().map(|m| m.id.as_str()), Some("m1"));
    assert_eq!(a.updated_at, at(40));
}

#[test]
fn own_message_updates_preview_without_unread() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0)]);

    index.record_message(&server_message("m1", "a", &me(), "pong", at(40)), &me());

    assert_eq!(index.get(&chat("a")).map(|c| c.unread_count), Some(0));
}

#[test]
fn repeated_last_message_is_counted_once() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0)]);
    let incoming = server_message("m1", "a", &them(), "ping", at(40));

    index.record_message(&incoming, &me());
    index.record_message(&incoming, &me());

    assert_eq!(index.get(&chat("a")).map(|c| c.unread_count), Some(1));
}

#[test]
fn redelivered_message_is_not_counted_again() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0)]);
    let first = server_message("m1", "a", &them(), "one", at(20));

    assert!(index.record_message(&first, &me()));
    assert!(index.record_message(&server_message("m2", "a", &them(), "two", at(30)), &me()));
    assert!(!index.record_message(&first, &me()));

    let a = index.get(&chat("a")).expect("conversation a");
    assert_eq!(a.unread_count, 2);
    assert_eq!(a.last_message.as_ref().map(|m| m.id.as_str()), Some("m2"));
}

#[test]
fn late_older_message_keeps_the_newest_preview() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0)]);

    index.record_message(&server_message("m2", "a", &them(), "two", at(30)), &me());
    index.record_message(&server_message("m1", "a", &them(), "one", at(20)), &me());

    let a = index.get(&chat("a")).expect("conversation a");
    assert_eq!(a.last_message.as_ref().map(|m| m.id.as_str()), Some("m2"));
    assert_eq!(a.updated_at, at(30));
    assert_eq!(a.unread_count, 2);
}

#[test]
fn preview_from_the_loaded_list_is_not_counted_again() {
    let mut index = ConversationIndex::new();
    let mut listed = conversation("a", at(40), 1);
    let last = server_message("m1", "a", &them(), "ping", at(40));
    listed.last_message = Some(last.clone());
    index.replace_all(vec![listed]);

    assert!(!index.record_message(&last, &me()));
    assert_eq!(index.get(&chat("a")).map(|c| c.unread_count), Some(1));
}

#[test]
fn message_for_unknown_conversation_is_ignored() {
    let mut index = ConversationIndex::new();

    assert!(!index.record_message(&server_message("m1", "zz", &them(), "hi", at(1)), &me()));
    assert!(index.is_empty());
}

#[test]
fn insert_is_idempotent() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 0)]);

    assert!(index.insert(conversation("n", at(50), 0)));
    assert!(!index.insert(conversation("n", at(60), 3)));

    assert_eq!(order(&index), vec!["n", "a"]);
    assert_eq!(index.len(), 2);
}

#[test]
fn unread_prefers_loaded_history_over_server_count() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 7), conversation("b", at(20), 3)]);
    let mut reconciler = MessageReconciler::new();
    reconciler.load_history(
        &chat("a"),
        page(
            vec![
                server_message("2", "a", &them(), "x", at(2)),
                server_message("1", "a", &me(), "y", at(1)),
            ],
            false,
        ),
    );

    assert_eq!(index.unread_count(&chat("a"), &reconciler, &me()), 1);
    assert_eq!(index.unread_count(&chat("b"), &reconciler, &me()), 3);
    assert_eq!(index.total_unread_count(&reconciler, &me()), 4);
}

#[test]
fn total_unread_is_the_sum_of_per_conversation_counts() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![
        conversation("a", at(10), 2),
        conversation("b", at(20), 0),
        conversation("c", at(30), 5),
    ]);
    let mut reconciler = MessageReconciler::new();
    reconciler.load_history(&chat("c"), page(Vec::new(), false));
    reconciler.begin_send(&chat("a"), MessageContent::text("draft"), &me());

    let sum: u32 = index
        .conversations()
        .iter()
        .map(|c| index.unread_count(&c.id, &reconciler, &me()))
        .sum();

    assert_eq!(index.total_unread_count(&reconciler, &me()), sum);
    assert_eq!(sum, 2);
}

#[test]
fn clearing_unread_resets_the_server_count() {
    let mut index = ConversationIndex::new();
    index.replace_all(vec![conversation("a", at(10), 4)]);

    assert!(index.clear_unread(&chat("a")));
    assert!(!index.clear_unread(&chat("missing")));

    assert_eq!(
        index.unread_count(&chat("a"), &MessageReconciler::new(), &me()),
        0
    );
}
