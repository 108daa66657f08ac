use dirtxn::core::metrics::Metrics;
use dirtxn::core::wal::MemoryWal;
use dirtxn::{
    DataChangeContainer, Dn, Entry, IndexEntry, MemoryPartition, Modification, Partition,
    PartitionRegistry, SearchScope, TransactionManager, TxnContext, TxnLogManager, TxnManagerOptions,
};
use std::borrow::Cow;
use std::sync::Arc;

fn suffix() -> Dn {
    Dn::parse("dc=example").unwrap()
}

fn person(cn: &str, mail: &str) -> Entry {
    Entry::new(Dn::parse(&format!("cn={},dc=example", cn)).unwrap())
        .with_attribute("cn", &[cn])
        .with_attribute("mail", &[mail])
}

fn setup() -> (Arc<TransactionManager>, TxnLogManager, Arc<MemoryPartition>) {
    let partition = Arc::new(MemoryPartition::new(suffix()));
    let registry = Arc::new(PartitionRegistry::new());
    registry.register(partition.clone()).unwrap();

    let mut options = TxnManagerOptions::default();
    options.flush_threshold = usize::MAX;
    let manager = Arc::new(TransactionManager::new(
        Arc::new(MemoryWal::new()),
        registry,
        options,
        Arc::new(Metrics::new()),
    ));
    let log = TxnLogManager::new(manager.clone());
    (manager, log, partition)
}

fn write(manager: &TransactionManager, log: &TxnLogManager, container: DataChangeContainer) {
    let mut ctx = TxnContext::new();
    manager.begin(&mut ctx, false).unwrap();
    let dn = Dn::parse("ou=people,dc=example").unwrap();
    log.add_write(&ctx, dn, SearchScope::Subtree).unwrap();
    log.log(&ctx, container, false).unwrap();
    manager.commit(&mut ctx).unwrap();
}

fn mail_seen(log: &TxnLogManager, ctx: &TxnContext, id: u64) -> Option<String> {
    let table = log.wrap_table(ctx, &suffix()).unwrap();
    table
        .get(id)
        .unwrap()
        .and_then(|entry| entry.get("mail").map(|values| values[0].clone()))
}

#[test]
fn test_reader_never_sees_later_commits() {
    let (manager, log, _partition) = setup();
    write(&manager, &log, DataChangeContainer::new(suffix(), 1).add_entry(person("alice", "a@one")));

    let mut reader = TxnContext::new();
    manager.begin(&mut reader, true).unwrap();
    assert_eq!(mail_seen(&log, &reader, 1).as_deref(), Some("a@one"));

    write(
        &manager,
        &log,
        DataChangeContainer::new(suffix(), 1).modify(
            Modification::replace("mail", &["a@two"]),
            Modification::replace("mail", &["a@one"]),
        ),
    );
    write(&manager, &log, DataChangeContainer::new(suffix(), 2).add_entry(person("bob", "b@one")));

    // repeated reads within the same snapshot are stable, even across a flush
    assert_eq!(mail_seen(&log, &reader, 1).as_deref(), Some("a@one"));
    assert_eq!(mail_seen(&log, &reader, 2), None);
    manager.apply_pending().unwrap();
    assert_eq!(mail_seen(&log, &reader, 1).as_deref(), Some("a@one"));
    assert_eq!(mail_seen(&log, &reader, 2), None);
    manager.commit(&mut reader).unwrap();

    let mut fresh = TxnContext::new();
    manager.begin(&mut fresh, true).unwrap();
    assert_eq!(mail_seen(&log, &fresh, 1).as_deref(), Some("a@two"));
    assert_eq!(mail_seen(&log, &fresh, 2).as_deref(), Some("b@one"));
    manager.commit(&mut fresh).unwrap();
}

#[test]
fn test_flush_stops_at_pinned_transaction() {
    let (manager, log, partition) = setup();
    write(&manager, &log, DataChangeContainer::new(suffix(), 1).add_entry(person("alice", "a@one")));
    let first_commit = manager.latest_committed_lsn();

    let mut reader = TxnContext::new();
    manager.begin(&mut reader, true).unwrap();

    write(&manager, &log, DataChangeContainer::new(suffix(), 2).add_entry(person("bob", "b@one")));
    let second_commit = manager.latest_committed_lsn();

    manager.apply_pending().unwrap();
    assert_eq!(manager.latest_flushed_lsn(), first_commit);
    assert!(partition.get(1).unwrap().is_some());
    assert!(partition.get(2).unwrap().is_none());
    assert_eq!(manager.committed_queue_lsns(), vec![first_commit, second_commit]);

    // the reader's view is unchanged by the partial flush
    assert_eq!(mail_seen(&log, &reader, 1).as_deref(), Some("a@one"));
    assert_eq!(mail_seen(&log, &reader, 2), None);

    manager.commit(&mut reader).unwrap();
    manager.apply_pending().unwrap();
    assert_eq!(manager.latest_flushed_lsn(), second_commit);
    assert!(partition.get(2).unwrap().is_some());
    assert_eq!(manager.committed_queue_lsns(), vec![second_commit]);
}

#[test]
fn test_merge_copies_only_when_changed() {
    let (manager, log, partition) = setup();
    partition.put(1, person("alice", "a@one")).unwrap();
    partition.put(2, person("bob", "b@one")).unwrap();

    write(
        &manager,
        &log,
        DataChangeContainer::new(suffix(), 2).modify(
            Modification::replace("mail", &["b@two"]),
            Modification::replace("mail", &["b@one"]),
        ),
    );

    let mut ctx = TxnContext::new();
    manager.begin(&mut ctx, true).unwrap();

    let alice = partition.get(1).unwrap().unwrap();
    match log.merge_updates(&ctx, &suffix(), 1, Some(&alice)).unwrap() {
        Some(Cow::Borrowed(entry)) => assert!(std::ptr::eq(entry, &alice)),
        other => panic!("expected the stored entry back, got {:?}", other),
    }

    let bob = partition.get(2).unwrap().unwrap();
    match log.merge_updates(&ctx, &suffix(), 2, Some(&bob)).unwrap() {
        Some(Cow::Owned(entry)) => {
            assert_eq!(entry.get("mail").unwrap(), &["b@two".to_string()]);
            assert_eq!(bob.get("mail").unwrap(), &["b@one".to_string()]);
        }
        other => panic!("expected a merged copy, got {:?}", other),
    }
    manager.commit(&mut ctx).unwrap();
}

#[test]
fn test_writer_sees_own_uncommitted_changes_only() {
    let (manager, log, _partition) = setup();

    let mut writer = TxnContext::new();
    manager.begin(&mut writer, false).unwrap();
    log.add_write(&writer, suffix(), SearchScope::Subtree).unwrap();
    log.log(
        &writer,
        DataChangeContainer::new(suffix(), 5)
            .add_entry(person("carol", "c@one"))
            .add_index("mail", IndexEntry::new("c@one", 5)),
        false,
    )
    .unwrap();
    assert_eq!(mail_seen(&log, &writer, 5).as_deref(), Some("c@one"));

    let mut other = TxnContext::new();
    manager.begin(&mut other, true).unwrap();
    assert_eq!(mail_seen(&log, &other, 5), None);
    manager.commit(&mut other).unwrap();

    manager.abort(&mut writer).unwrap();
    manager.begin(&mut other, true).unwrap();
    assert_eq!(mail_seen(&log, &other, 5), None);
    manager.commit(&mut other).unwrap();
}
