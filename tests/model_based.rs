use dirtxn::core::index::collect_forward;
use dirtxn::core::metrics::Metrics;
use dirtxn::core::wal::MemoryWal;
use dirtxn::{
    DataChangeContainer, Dn, Entry, IndexEntry, IndexOrder, MemoryPartition, Modification,
    Partition, PartitionRegistry, SearchScope, TransactionManager, TxnContext, TxnLogManager,
    TxnManagerOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What the directory should contain: entry id to its single `mail` value.
#[derive(Debug, Clone, Default, PartialEq)]
struct TruthModel {
    entries: BTreeMap<u64, String>,
}

impl TruthModel {
    fn index(&self) -> BTreeSet<(String, u64)> {
        self.entries.iter().map(|(id, mail)| (mail.clone(), *id)).collect()
    }
}

fn suffix() -> Dn {
    Dn::parse("dc=example").unwrap()
}

fn entry(id: u64, mail: &str) -> Entry {
    Entry::new(Dn::parse(&format!("uid=u{},dc=example", id)).unwrap())
        .with_attribute("uid", &[format!("u{}", id).as_str()])
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

/// Reads the whole directory through a transaction's view.
fn observe(log: &TxnLogManager, ctx: &TxnContext, max_id: u64) -> (TruthModel, BTreeSet<(String, u64)>) {
    let table = log.wrap_table(ctx, &suffix()).unwrap();
    let mut seen = TruthModel::default();
    for id in 1..=max_id {
        if let Some(entry) = table.get(id).unwrap() {
            seen.entries.insert(id, entry.get("mail").unwrap()[0].clone());
        }
    }

    let mut cursor = log.wrap(ctx, &suffix(), "mail", true, None, None).unwrap();
    let index = collect_forward(&mut cursor)
        .unwrap()
        .into_iter()
        .map(|e| (e.value, e.id))
        .collect();
    (seen, index)
}

#[test]
fn test_model_based_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x5eed_d17e);
    let (manager, log, partition) = setup();
    let max_id = 24;

    let mut model = TruthModel::default();
    let mut reader: Option<(TxnContext, TruthModel)> = None;

    for step in 0..400 {
        let id = rng.gen_range(1..=max_id);
        let mail = format!("m{}@example", rng.gen_range(0..50));
        let target = Dn::parse(&format!("uid=u{},dc=example", id)).unwrap();

        let mut ctx = TxnContext::new();
        manager.begin(&mut ctx, false).unwrap();
        log.add_write(&ctx, target, SearchScope::Object).unwrap();

        let mut next = model.clone();
        let container = match model.entries.get(&id) {
            None => {
                next.entries.insert(id, mail.clone());
                DataChangeContainer::new(suffix(), id)
                    .add_entry(entry(id, &mail))
                    .add_index("mail", IndexEntry::new(mail, id))
            }
            Some(old) if rng.gen_bool(0.3) => {
                next.entries.remove(&id);
                DataChangeContainer::new(suffix(), id)
                    .delete_entry(entry(id, old))
                    .delete_index("mail", IndexEntry::new(old.clone(), id))
            }
            Some(old) => {
                next.entries.insert(id, mail.clone());
                let mut container = DataChangeContainer::new(suffix(), id).modify(
                    Modification::replace("mail", &[mail.as_str()]),
                    Modification::replace("mail", &[old.as_str()]),
                );
                if *old != mail {
                    container = container
                        .delete_index("mail", IndexEntry::new(old.clone(), id))
                        .add_index("mail", IndexEntry::new(mail, id));
                }
                container
            }
        };
        log.log(&ctx, container, false).unwrap();

        if rng.gen_bool(0.15) {
            manager.abort(&mut ctx).unwrap();
        } else {
            manager.commit(&mut ctx).unwrap();
            model = next;
        }

        if rng.gen_bool(0.2) {
            manager.apply_pending().unwrap();
        }

        match reader.take() {
            None if rng.gen_bool(0.1) => {
                let mut ctx = TxnContext::new();
                manager.begin(&mut ctx, true).unwrap();
                reader = Some((ctx, model.clone()));
            }
            Some((mut ctx, expected)) => {
                let (seen, index) = observe(&log, &ctx, max_id);
                assert_eq!(seen, expected, "reader snapshot drifted at step {}", step);
                assert_eq!(index, expected.index(), "reader index drifted at step {}", step);
                if rng.gen_bool(0.2) {
                    manager.commit(&mut ctx).unwrap();
                } else {
                    reader = Some((ctx, expected));
                }
            }
            None => {}
        }

        if step % 10 == 0 {
            let mut ctx = TxnContext::new();
            manager.begin(&mut ctx, true).unwrap();
            let (seen, index) = observe(&log, &ctx, max_id);
            assert_eq!(seen, model, "view diverged at step {}", step);
            assert_eq!(index, model.index(), "index diverged at step {}", step);
            manager.commit(&mut ctx).unwrap();
        }
    }

    if let Some((mut ctx, _)) = reader.take() {
        manager.commit(&mut ctx).unwrap();
    }
    manager.apply_pending().unwrap();
    assert_eq!(manager.latest_flushed_lsn(), manager.latest_committed_lsn());

    // after a full flush the partition alone holds the model
    for id in 1..=max_id {
        let stored = partition.get(id).unwrap();
        let expected = model.entries.get(&id);
        assert_eq!(
            stored.as_ref().map(|e| e.get("mail").unwrap()[0].clone()),
            expected.cloned(),
            "entry {} differs after flush",
            id
        );
    }
    let mut stored = partition.index_cursor("mail", IndexOrder::Forward, None).unwrap();
    let index: BTreeSet<(String, u64)> = collect_forward(stored.as_mut())
        .unwrap()
        .into_iter()
        .map(|e| (e.value, e.id))
        .collect();
    assert_eq!(index, model.index());
}
