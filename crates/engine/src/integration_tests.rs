//! Integration tests for the full posting pipeline.
//!
//! Tests: Intent → Poster → EntryStore → BalanceAggregator → Audit
//!
//! Verifies:
//! - Idempotent replay never double-applies a posting
//! - Balances always agree with a full recompute from history
//! - Multi-leg atomicity (a rejected posting persists nothing)
//! - Reversals restore the pre-entry balance
//! - Concurrent postings against one party never lose updates

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use proptest::prelude::*;

    use khata_core::{Amount, IdempotencyKey, PartyId};
    use khata_ledger::{EntryKind, MovementIntent, PostingIntent};
    use khata_parties::PartyKind;

    use crate::entry_store::{EntryFilter, Pagination};
    use crate::service::InMemoryLedgerService;

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    fn sale(party: PartyId, minor: i64, k: &str) -> PostingIntent {
        PostingIntent::single(
            party,
            Amount::from_minor(minor),
            EntryKind::Sale,
            key(k),
            Utc::now(),
        )
    }

    fn payment(party: PartyId, minor: i64, k: &str) -> PostingIntent {
        PostingIntent::single(
            party,
            Amount::from_minor(minor),
            EntryKind::Payment,
            key(k),
            Utc::now(),
        )
    }

    /// The end-to-end scenario: post, replay, pay, reverse — verifying
    /// `ok: true, drift: 0` after every step.
    #[test]
    fn posting_replay_payment_reversal_scenario() {
        let service = InMemoryLedgerService::in_memory();
        let client = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;

        assert_eq!(service.get_balance(client).unwrap(), Amount::ZERO);

        // Post +500 (sale, key "k1") → balance 500.
        let posted = service.post_transaction(sale(client, 500, "k1")).unwrap();
        assert_eq!(service.get_balance(client).unwrap(), Amount::from_minor(500));
        assert!(service.verify_balance(client).unwrap().ok);

        // Replay the same intent → balance still 500, one entry.
        let replay = service.post_transaction(sale(client, 500, "k1")).unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.entry_id(), posted.entry_id());
        assert_eq!(service.get_balance(client).unwrap(), Amount::from_minor(500));
        assert_eq!(
            service
                .get_history(client, EntryFilter::default(), Pagination::default())
                .unwrap()
                .total,
            1
        );
        assert!(service.verify_balance(client).unwrap().ok);

        // Post −200 (payment, key "k2") → balance 300.
        service.post_transaction(payment(client, -200, "k2")).unwrap();
        assert_eq!(service.get_balance(client).unwrap(), Amount::from_minor(300));
        assert!(service.verify_balance(client).unwrap().ok);

        // Reverse the sale entry → balance −200.
        let reversal = service
            .reverse_transaction(posted.entry_id(), "sale voided")
            .unwrap();
        assert_eq!(reversal.entries[0].reverses, Some(posted.entry_id()));
        assert_eq!(
            service.get_balance(client).unwrap(),
            Amount::from_minor(-200)
        );

        let report = service.verify_balance(client).unwrap();
        assert!(report.ok);
        assert_eq!(report.drift, Amount::ZERO);

        // Full history retained: sale, payment, reversal.
        let history = service
            .get_history(client, EntryFilter::default(), Pagination::default())
            .unwrap();
        assert_eq!(history.total, 3);
    }

    /// 100 concurrent +1 postings with distinct keys must land exactly once
    /// each: final balance 100, 100 stored entries.
    #[test]
    fn concurrent_postings_to_one_party_never_lose_updates() {
        let service = Arc::new(InMemoryLedgerService::in_memory());
        let party = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    service
                        .post_transaction(sale(party, 1, &format!("k{i}")))
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(service.get_balance(party).unwrap(), Amount::from_minor(100));
        let history = service
            .get_history(party, EntryFilter::default(), Pagination::new(Some(1000), None))
            .unwrap();
        assert_eq!(history.total, 100);
        assert!(service.verify_balance(party).unwrap().ok);
    }

    /// Concurrent duplicate submissions of the same intent commit once.
    #[test]
    fn concurrent_duplicate_submissions_commit_once() {
        let service = Arc::new(InMemoryLedgerService::in_memory());
        let party = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    service.post_transaction(sale(party, 500, "same-key")).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let fresh = results.iter().filter(|r| !r.replayed).count();
        assert_eq!(fresh, 1);

        assert_eq!(service.get_balance(party).unwrap(), Amount::from_minor(500));
        assert_eq!(
            service
                .get_history(party, EntryFilter::default(), Pagination::default())
                .unwrap()
                .total,
            1
        );
    }

    /// Disjoint parties proceed in parallel and stay independent.
    #[test]
    fn cross_party_interleavings_do_not_affect_sums() {
        let service = Arc::new(InMemoryLedgerService::in_memory());
        let parties: Vec<PartyId> = (0..4)
            .map(|i| {
                service
                    .register_party(PartyKind::Client, format!("Client {i}"))
                    .unwrap()
                    .id
            })
            .collect();

        let handles: Vec<_> = parties
            .iter()
            .enumerate()
            .flat_map(|(pi, &party)| {
                (0..25).map(move |i| (party, format!("p{pi}-k{i}")))
            })
            .map(|(party, k)| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    service.post_transaction(sale(party, 10, &k)).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for &party in &parties {
            assert_eq!(service.get_balance(party).unwrap(), Amount::from_minor(250));
            assert!(service.verify_balance(party).unwrap().ok);
        }
    }

    /// Forced second-leg failure: the first leg's party shows no new entry.
    #[test]
    fn failed_multi_leg_posting_persists_nothing() {
        let service = InMemoryLedgerService::in_memory();
        let client = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;
        let company = service
            .register_party(PartyKind::Company, "AyanSteel")
            .unwrap()
            .id;

        // Second leg references an unregistered party, so the intent is
        // rejected before anything is written.
        let ghost = PartyId::new();
        let intent = PostingIntent::symmetric(
            client,
            ghost,
            Amount::from_minor(500),
            EntryKind::Sale,
            key("k1"),
            Utc::now(),
        );
        assert!(service.post_transaction(intent).is_err());
        assert!(service
            .get_history(client, EntryFilter::default(), Pagination::default())
            .unwrap()
            .entries
            .is_empty());

        // A posting whose movement cannot be accepted aborts the ledger legs too.
        let payment_with_movement = PostingIntent::symmetric(
            client,
            company,
            Amount::from_minor(500),
            EntryKind::Payment, // movement on a payment is invalid
            key("k2"),
            Utc::now(),
        )
        .with_movement(MovementIntent {
            quantity_delta: -1,
            unit_value: Amount::from_minor(500),
        });
        assert!(service.post_transaction(payment_with_movement).is_err());
        assert!(service
            .get_history(client, EntryFilter::default(), Pagination::default())
            .unwrap()
            .entries
            .is_empty());
        assert!(service
            .get_history(company, EntryFilter::default(), Pagination::default())
            .unwrap()
            .entries
            .is_empty());
    }

    /// Sale with linked stock: the movement commits with the posting and is
    /// queryable afterwards.
    #[test]
    fn stock_movement_commits_with_sale() {
        let service = InMemoryLedgerService::in_memory();
        let client = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;

        let intent = sale(client, 50_000, "k1").with_movement(MovementIntent {
            quantity_delta: -10,
            unit_value: Amount::from_minor(5_000),
        });
        let result = service.post_transaction(intent).unwrap();

        let movement = service
            .stock_movement_for(result.entry_id())
            .unwrap()
            .unwrap();
        assert_eq!(movement.quantity_delta, -10);
        assert_eq!(movement.value().unwrap(), Amount::from_minor(-50_000));
    }

    /// Supplier flow through the facade: payment, replay, verify.
    #[test]
    fn supplier_payment_flow() {
        let service = InMemoryLedgerService::in_memory();
        let supplier = service
            .register_party(PartyKind::Supplier, "Steel Mills")
            .unwrap()
            .id;

        service
            .supplier_credit_note(supplier, Amount::from_minor(80_000), key("cn1"), None)
            .unwrap();
        service
            .pay_supplier(supplier, Amount::from_minor(30_000), key("p1"), None)
            .unwrap();
        // Duplicate HTTP retry of the same payment.
        let retry = service
            .pay_supplier(supplier, Amount::from_minor(30_000), key("p1"), None)
            .unwrap();
        assert!(retry.replayed);

        assert_eq!(
            service.get_balance(supplier).unwrap(),
            Amount::from_minor(50_000)
        );
        assert!(service.verify_balance(supplier).unwrap().ok);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_sweep_verifies_every_party() {
        let service = Arc::new(InMemoryLedgerService::in_memory());
        for i in 0..10 {
            let party = service
                .register_party(PartyKind::Client, format!("Client {i}"))
                .unwrap()
                .id;
            service
                .post_transaction(sale(party, 100 * (i as i64 + 1), &format!("k{i}")))
                .unwrap();
        }

        let handle = service.verify_all();
        let progress = handle.wait_for_completion().await.unwrap();

        assert_eq!(progress.total_parties, 10);
        assert_eq!(progress.verified_parties, 10);
        assert_eq!(progress.drifted_parties, 0);
        assert!(handle.drifts().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_runs_while_postings_continue() {
        let service = Arc::new(InMemoryLedgerService::in_memory());
        let party = service
            .register_party(PartyKind::Client, "Rahim Traders")
            .unwrap()
            .id;
        service.post_transaction(sale(party, 100, "seed")).unwrap();

        let handle = service.verify_all();

        // Postings proceed while the sweep is in flight.
        for i in 0..20 {
            service
                .post_transaction(sale(party, 10, &format!("live{i}")))
                .unwrap();
        }

        handle.wait_for_completion().await.unwrap();
        assert_eq!(service.get_balance(party).unwrap(), Amount::from_minor(300));
        assert!(service.verify_balance(party).unwrap().ok);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: for any sequence of postings, the incrementally
        /// maintained balance equals the recomputed sum of all non-reversed
        /// entry amounts.
        #[test]
        fn incremental_balance_always_equals_recompute(
            amounts in prop::collection::vec((-1_000_000i64..1_000_000i64).prop_filter("non-zero", |m| *m != 0), 1..24)
        ) {
            let service = InMemoryLedgerService::in_memory();
            let party = service
                .register_party(PartyKind::Client, "Rahim Traders")
                .unwrap()
                .id;

            let mut expected = 0i64;
            for (i, minor) in amounts.iter().enumerate() {
                service
                    .post_transaction(sale(party, *minor, &format!("k{i}")))
                    .unwrap();
                expected += minor;
            }

            prop_assert_eq!(
                service.get_balance(party).unwrap(),
                Amount::from_minor(expected)
            );
            let report = service.verify_balance(party).unwrap();
            prop_assert!(report.ok);
            prop_assert_eq!(report.drift, Amount::ZERO);
        }

        /// Property: reversing an arbitrary entry restores the balance to
        /// its value just before that entry was posted, and a second reverse
        /// attempt never double-compensates.
        #[test]
        fn reversal_restores_pre_entry_balance(
            amounts in prop::collection::vec((-100_000i64..100_000i64).prop_filter("non-zero", |m| *m != 0), 2..12),
            pick in 0usize..11
        ) {
            let service = InMemoryLedgerService::in_memory();
            let party = service
                .register_party(PartyKind::Client, "Rahim Traders")
                .unwrap()
                .id;

            let mut ids = Vec::new();
            let mut total = 0i64;
            for (i, minor) in amounts.iter().enumerate() {
                let result = service
                    .post_transaction(sale(party, *minor, &format!("k{i}")))
                    .unwrap();
                ids.push(result.entry_id());
                total += minor;
            }

            let pick = pick % amounts.len();
            service
                .reverse_transaction(ids[pick], "audit correction")
                .unwrap();
            let retried = service
                .reverse_transaction(ids[pick], "audit correction")
                .unwrap();
            prop_assert!(retried.replayed);

            let expected = total - amounts[pick];
            prop_assert_eq!(
                service.get_balance(party).unwrap(),
                Amount::from_minor(expected)
            );
            prop_assert!(service.verify_balance(party).unwrap().ok);
        }
    }
}
