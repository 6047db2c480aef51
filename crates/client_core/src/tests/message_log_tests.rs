use super::*;
use crate::test_support::{server_message, ts};
use chrono::FixedOffset;

fn me() -> User {
    User::new("self", "Ana")
}

fn ids(log: &MessageLog) -> Vec<&str> {
    log.messages()
        .iter()
        .map(|message| message.id.as_str())
        .collect()
}

fn open_log(conversation: &str) -> MessageLog {
    let mut log = MessageLog::new();
    log.load(ConversationId::new(conversation), Vec::new());
    log
}

#[test]
fn repeated_deliveries_never_duplicate_server_ids() {
    let mut log = open_log("c1");
    let me = me();
    let sequence = ["m1", "m2", "m1", "m3", "m2", "m2", "m4", "m1"];
    for (offset, id) in sequence.iter().enumerate() {
        log.reconcile_incoming(
            server_message(id, "c1", "u9", "hey", ts(offset as i64)),
            &me.id,
        );
    }

    let mut seen = HashSet::new();
    assert!(log.messages().iter().all(|message| seen.insert(message.id.clone())));
    assert_eq!(ids(&log), vec!["m1", "m2", "m3", "m4"]);
}

#[test]
fn confirmation_replaces_optimistic_entry_in_place() {
    let mut log = MessageLog::new();
    log.load(
        ConversationId::new("c1"),
        vec![server_message("m1", "c1", "u9", "hi", ts(0))],
    );
    let me = me();

    let optimistic = log
        .append_optimistic(&me, "  hello  ", ts(10))
        .expect("optimistic");
    assert!(optimistic.is_pending());
    assert_eq!(optimistic.content, "hello");
    assert_eq!(log.messages().len(), 2);

    let outcome = log.reconcile_incoming(
        server_message("m2", "c1", "self", "hello", ts(11)),
        &me.id,
    );
    assert_eq!(
        outcome,
        ReconcileOutcome::ReplacedOptimistic {
            temp_id: optimistic.id.clone(),
            index: 1
        }
    );
    assert_eq!(ids(&log), vec!["m1", "m2"]);
    assert_eq!(log.messages()[1].status, DeliveryStatus::Sent);
}

#[test]
fn optimistic_entry_keeps_position_when_confirmed_after_other_messages() {
    let mut log = open_log("c1");
    let me = me();
    let optimistic = log.append_optimistic(&me, "first", ts(0)).expect("optimistic");
    log.reconcile_incoming(server_message("m9", "c1", "u9", "reply", ts(2)), &me.id);

    let outcome = log.confirm_optimistic(
        &optimistic.id,
        server_message("m1", "c1", "self", "first", ts(1)),
        &me.id,
    );
    assert!(matches!(outcome, ReconcileOutcome::ReplacedOptimistic { index: 0, .. }));
    assert_eq!(ids(&log), vec!["m1", "m9"]);
}

#[test]
fn realtime_echo_before_rest_confirmation_leaves_one_entry() {
    let mut log = open_log("c1");
    let me = me();
    let optimistic = log.append_optimistic(&me, "hello", ts(0)).expect("optimistic");

    log.reconcile_incoming(server_message("m2", "c1", "self", "hello", ts(1)), &me.id);
    let outcome = log.confirm_optimistic(
        &optimistic.id,
        server_message("m2", "c1", "self", "hello", ts(1)),
        &me.id,
    );

    assert_eq!(outcome, ReconcileOutcome::Duplicate);
    assert_eq!(ids(&log), vec!["m2"]);
}

#[test]
fn different_content_or_stale_timestamp_does_not_match_optimistic_entry() {
    let mut log = open_log("c1");
    let me = me();
    let optimistic = log.append_optimistic(&me, "hello", ts(0)).expect("optimistic");

    log.reconcile_incoming(server_message("m5", "c1", "self", "other", ts(1)), &me.id);
    log.reconcile_incoming(
        server_message("m6", "c1", "self", "hello", ts(OPTIMISTIC_MATCH_WINDOW_SECS + 60)),
        &me.id,
    );

    assert_eq!(log.messages().len(), 3);
    assert_eq!(log.messages()[0].id, optimistic.id);
    assert!(log.messages()[0].is_pending());
}

#[test]
fn messages_from_others_are_inserted_by_timestamp() {
    let mut log = open_log("c1");
    let me = me();
    log.reconcile_incoming(server_message("m3", "c1", "u9", "c", ts(30)), &me.id);
    log.reconcile_incoming(server_message("m1", "c1", "u9", "a", ts(10)), &me.id);
    let outcome = log.reconcile_incoming(server_message("m2", "c1", "u8", "b", ts(30)), &me.id);

    assert_eq!(outcome, ReconcileOutcome::Inserted { index: 2 });
    assert_eq!(ids(&log), vec!["m1", "m3", "m2"]);
}

#[test]
fn other_conversations_are_ignored() {
    let mut log = open_log("c1");
    let outcome = log.reconcile_incoming(
        server_message("m1", "c2", "u9", "hey", ts(0)),
        &UserId::new("self"),
    );
    assert_eq!(outcome, ReconcileOutcome::WrongConversation);
    assert!(log.messages().is_empty());
}

#[test]
fn history_merge_keeps_entries_that_arrived_while_loading() {
    let mut log = MessageLog::new();
    let me = me();
    log.reset(ConversationId::new("c1"));
    assert_eq!(log.state(), LoadState::Loading);

    log.reconcile_incoming(server_message("m2", "c1", "u9", "live", ts(20)), &me.id);
    let optimistic = log.append_optimistic(&me, "mine", ts(30)).expect("optimistic");

    log.load(
        ConversationId::new("c1"),
        vec![
            server_message("m2", "c1", "u9", "live", ts(20)),
            server_message("m1", "c1", "u9", "old", ts(5)),
            server_message("m1", "c1", "u9", "old", ts(5)),
        ],
    );

    assert_eq!(log.state(), LoadState::Loaded);
    assert_eq!(ids(&log), vec!["m1", "m2", optimistic.id.as_str()]);
}

#[test]
fn failed_send_stays_visible_and_can_be_retried() {
    let mut log = open_log("c1");
    let me = me();
    let optimistic = log.append_optimistic(&me, "hello", ts(0)).expect("optimistic");

    assert!(log.mark_failed(&optimistic.id));
    assert_eq!(log.messages()[0].status, DeliveryStatus::Failed);
    assert!(!log.messages()[0].is_pending());

    let retried = log.retry(&optimistic.id).expect("retry");
    assert!(retried.is_pending());
    assert!(log.retry(&optimistic.id).is_none());
}

#[test]
fn empty_content_and_missing_conversation_are_rejected() {
    let mut log = MessageLog::new();
    let err = log.append_optimistic(&me(), "hi", ts(0)).expect_err("no conversation");
    assert!(matches!(err, ClientError::Validation(_)));

    let mut log = open_log("c1");
    let err = log.append_optimistic(&me(), "   ", ts(0)).expect_err("empty");
    assert!(matches!(err, ClientError::Validation(_)));
    assert!(log.messages().is_empty());
}

#[test]
fn unread_from_others_skips_own_read_and_pending_entries() {
    let mut log = open_log("c1");
    let me = me();
    let mut read = server_message("m1", "c1", "u9", "a", ts(1));
    read.record_read(me.id.clone(), Some(ts(2)));
    log.reconcile_incoming(read, &me.id);
    log.reconcile_incoming(server_message("m2", "c1", "u9", "b", ts(3)), &me.id);
    log.reconcile_incoming(server_message("m3", "c1", "self", "c", ts(4)), &me.id);
    log.append_optimistic(&me, "d", ts(5)).expect("optimistic");

    assert_eq!(log.unread_from_others(&me.id), vec![MessageId::new("m2")]);
    assert!(log.mark_read(&MessageId::new("m2"), &me.id, None));
    assert!(!log.mark_read(&MessageId::new("m2"), &me.id, None));
    assert!(log.unread_from_others(&me.id).is_empty());
}

#[test]
fn groups_by_calendar_day_in_given_timezone() {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 22, 30, 0).unwrap();
    let messages = vec![
        server_message("m1", "c1", "u9", "a", base),
        server_message("m2", "c1", "u9", "b", base + chrono::Duration::hours(1)),
        server_message("m3", "c1", "u9", "c", base + chrono::Duration::hours(2)),
    ];

    let utc_groups = group_by_day(&messages, &Utc);
    assert_eq!(utc_groups.len(), 2);
    assert_eq!(utc_groups[0].messages.len(), 2);

    let madrid = FixedOffset::east_opt(3600).expect("offset");
    let local_groups = group_by_day(&messages, &madrid);
    assert_eq!(local_groups.len(), 2);
    assert_eq!(local_groups[0].day, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    assert_eq!(local_groups[0].messages.len(), 1);
    assert_eq!(local_groups[1].messages.len(), 2);
}
