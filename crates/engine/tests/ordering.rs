#![forbid(unsafe_code)]

mod support;

use hrx_core::{Change, Status};
use hrx_engine::{EngineConfig, InfoRetention, UPDATED};
use proptest::prelude::*;
use support::*;

fn status_for(idx: usize) -> Status {
    let all = [Status::Deployed, Status::Failed, Status::PendingInstall, Status::PendingRollback, Status::PendingUpgrade, Status::Superseded];
    all[idx % all.len()].clone()
}

/// Upserts of revisions 1..=n with some duplicates, in arbitrary order.
fn deliveries() -> impl Strategy<Value = (Vec<(u64, usize)>, bool)> {
    (1u64..8, any::<bool>())
        .prop_flat_map(|(n, history)| {
            let revs: Vec<u64> = (1..=n).collect();
            (Just(revs), proptest::collection::vec(1..=n, 0..4), proptest::collection::vec(0usize..6, n as usize), Just(history))
        })
        .prop_flat_map(|(revs, dups, statuses, history)| {
            let mut all: Vec<(u64, usize)> = revs.iter().map(|r| (*r, statuses[(*r - 1) as usize])).collect();
            all.extend(dups.iter().map(|r| (*r, statuses[(*r - 1) as usize])));
            (Just(all).prop_shuffle(), Just(history))
        })
}

proptest! {
    #[test]
    fn latest_revision_wins_in_any_order((order, history) in deliveries()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let retention = if history { InfoRetention::History } else { InfoRetention::LatestOnly };
        let h = harness(EngineConfig { info_retention: retention, ..EngineConfig::default() });

        let max = order.iter().map(|(r, _)| *r).max().unwrap();
        let max_status = status_for(order.iter().find(|(r, _)| *r == max).unwrap().1);

        rt.block_on(async {
            for (rev, st) in &order {
                let key = h.source.put(&record("a", "x", *rev, status_for(*st)));
                h.engine.handle(&Change::upsert(key)).await.unwrap();
            }
        });

        let reg = h.registry.as_ref();
        prop_assert_eq!(revision(reg, "a", "x"), Some(max as f64));
        for s in Status::TRACKED.iter() {
            let want = if *s == max_status { 1.0 } else { 0.0 };
            prop_assert_eq!(status(reg, "a", "x", s.as_str()), Some(want));
        }
        let updated = series(reg, UPDATED, "a", "x");
        prop_assert_eq!(updated.len(), 1);
        prop_assert_eq!(updated[0].value, record("a", "x", max, Status::Deployed).last_deployed as f64);

        let infos = info_revisions(reg, "a", "x");
        prop_assert!(infos.contains(&max.to_string()));
        if !history {
            prop_assert_eq!(infos.len(), 1);
        }
        // nothing ever failed
        prop_assert_eq!(errors(reg, "x"), 0.0);
    }
}
