//! Delivery guarantees of the ledger over the in-memory store
//!
//! Run with: cargo test -p cannon-ledger --test ledger_properties

use std::sync::Arc;
use std::time::Duration;

use cannon_ledger::{
    Block, Channel, Cursor, CursorChange, Fields, InMemoryStreamStore, Ledger, LedgerConfig,
    MessageId,
};

fn item(n: usize) -> Fields {
    let mut fields = Fields::new();
    fields.insert("n".to_string(), n.to_string());
    fields
}

async fn open(store: &Arc<InMemoryStreamStore>, consumer: &str) -> Ledger {
    let config = LedgerConfig::new("prop-bot").with_consumer(consumer);
    Ledger::open(store.clone(), config).await.unwrap()
}

// ============================================
// Ordering
// ============================================

#[test_log::test(tokio::test)]
async fn test_reads_follow_append_order() {
    let store = Arc::new(InMemoryStreamStore::new());
    let ledger = open(&store, "a").await;

    let mut written = Vec::new();
    for n in 0..3 {
        written.push(ledger.write(Channel::Data, item(n)).await.unwrap());
    }

    let messages = ledger
        .read(Channel::Data, Some(10), Block::Never)
        .await
        .unwrap();
    let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, written);

    let values: Vec<&str> = messages.iter().filter_map(|m| m.get("n")).collect();
    assert_eq!(values, vec!["0", "1", "2"]);
}

#[tokio::test]
async fn test_latest_cursor_ignores_earlier_writes() {
    let store = Arc::new(InMemoryStreamStore::new());
    let config = LedgerConfig::new("prop-bot");
    let early = Ledger::new(store.clone(), config.clone()).unwrap();

    // Written before any group exists
    early.write(Channel::Data, item(0)).await.unwrap();

    let ledger = Ledger::open(store.clone(), config).await.unwrap();
    ledger.write(Channel::Data, item(1)).await.unwrap();

    let messages = ledger
        .read(Channel::Data, None, Block::Never)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].get("n"), Some("1"));
}

// ============================================
// At-least-once
// ============================================

#[tokio::test]
async fn test_acked_message_leaves_pending() {
    let store = Arc::new(InMemoryStreamStore::new());
    let ledger = open(&store, "a").await;

    ledger.write(Channel::Data, item(0)).await.unwrap();
    ledger.write(Channel::Data, item(1)).await.unwrap();
    let messages = ledger
        .read(Channel::Data, None, Block::Never)
        .await
        .unwrap();

    ledger
        .ack(Channel::Data, &[messages[0].id])
        .await
        .unwrap();

    let pending = ledger.list_pending().await.unwrap();
    let ids: Vec<MessageId> = pending[&Channel::Data].iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![messages[1].id]);

    // Unacked stays claimable by another consumer
    let other = ledger.with_consumer("b");
    let claimed = other
        .claim(Channel::Data, &[messages[1].id], Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(other
        .claim(Channel::Data, &[messages[0].id], Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_message_is_delivered_to_one_consumer() {
    let store = Arc::new(InMemoryStreamStore::new());
    let a = open(&store, "a").await;
    let b = a.with_consumer("b");

    a.write(Channel::Data, item(0)).await.unwrap();

    let first = a.read(Channel::Data, None, Block::Never).await.unwrap();
    let second = b.read(Channel::Data, None, Block::Never).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

// ============================================
// Cursor init
// ============================================

#[tokio::test]
async fn test_cursor_init_is_idempotent() {
    let store = Arc::new(InMemoryStreamStore::new());
    let ledger = Ledger::new(store.clone(), LedgerConfig::new("prop-bot")).unwrap();

    assert_eq!(
        ledger.init_cursor(false, Cursor::Latest).await.unwrap(),
        CursorChange::Changed
    );
    assert_eq!(
        ledger.init_cursor(false, Cursor::Latest).await.unwrap(),
        CursorChange::Unchanged
    );

    let info = ledger.info().await.unwrap();
    for channel in info.channels {
        assert_eq!(channel.groups.len(), 1, "one group on {}", channel.stream);
    }
}

#[tokio::test]
async fn test_group_on_any_stream_counts_as_present() {
    let store = Arc::new(InMemoryStreamStore::new());
    let data_only = Ledger::new(
        store.clone(),
        LedgerConfig::new("prop-bot").with_channels([Channel::Data]),
    )
    .unwrap();
    data_only.init_cursor(false, Cursor::Latest).await.unwrap();

    let full = Ledger::new(store.clone(), LedgerConfig::new("prop-bot")).unwrap();
    assert_eq!(
        full.init_cursor(false, Cursor::Latest).await.unwrap(),
        CursorChange::Unchanged
    );
}

#[tokio::test]
async fn test_reopen_with_more_channels_creates_missing_groups() {
    let store = Arc::new(InMemoryStreamStore::new());
    let first = open(&store, "first").await;
    first.write(Channel::Data, item(1)).await.unwrap();

    // Reopen with every channel; the data cursor must not move
    let wide = Ledger::open(
        store.clone(),
        LedgerConfig::new("prop-bot")
            .with_consumer("wide")
            .with_channels(Channel::ALL),
    )
    .await
    .unwrap();

    let inbox = wide.read(Channel::Inbox, None, Block::Never).await.unwrap();
    assert!(inbox.is_empty());
    wide.write(Channel::Inbox, item(2)).await.unwrap();
    let inbox = wide.read(Channel::Inbox, None, Block::Never).await.unwrap();
    assert_eq!(inbox.len(), 1);

    let data = wide.read(Channel::Data, None, Block::Never).await.unwrap();
    assert_eq!(data.len(), 1, "existing cursor kept the unread entry");
    assert_eq!(data[0].get("n"), Some("1"));

    let info = wide.info().await.unwrap();
    for channel in info.channels {
        assert_eq!(channel.groups.len(), 1, "one group on {}", channel.stream);
    }
    assert_eq!(
        wide.init_cursor(false, Cursor::Latest).await.unwrap(),
        CursorChange::Unchanged
    );
}

// ============================================
// Backlog reclaim
// ============================================

#[test_log::test(tokio::test)]
async fn test_backlog_moves_from_dead_consumer() {
    let store = Arc::new(InMemoryStreamStore::new());
    let a = open(&store, "a").await;
    let b = a.with_consumer("b");

    let id = a.write(Channel::Data, item(7)).await.unwrap();
    let read = a.read(Channel::Data, None, Block::Never).await.unwrap();
    assert_eq!(read[0].id, id);

    // A dies without acking
    drop(a);

    let reclaimed = b
        .claim_pending(Channel::Data, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].get("n"), Some("7"));

    let pending = b.list_pending().await.unwrap();
    assert_eq!(pending[&Channel::Data][0].consumer, "b");

    // Now part of B's own backlog
    let backlog = b.read_backlog(Channel::Data, None).await.unwrap();
    assert_eq!(backlog.len(), 1);

    assert_eq!(b.ack(Channel::Data, &[id]).await.unwrap(), Some(1));
    assert!(b.list_pending().await.unwrap()[&Channel::Data].is_empty());
}

#[tokio::test]
async fn test_blocking_read_waits_for_writer() {
    let store = Arc::new(InMemoryStreamStore::new());
    let reader = open(&store, "reader").await;
    let writer = reader.clone();

    let handle = tokio::spawn(async move {
        reader
            .read(Channel::Data, Some(1), Block::from_millis(0))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.write(Channel::Data, item(1)).await.unwrap();

    let messages = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("blocking read should return once data arrives")
        .unwrap()
        .unwrap();
    assert_eq!(messages.len(), 1);
}
