//! Stress tests for deferral and replay.
//!
//! Long randomized runs of invocations where handlers defer at random, some
//! invocations fail, and several observers share one source. Every run is seeded so
//! a failure reproduces.

#[cfg(test)]
mod stress_tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use anyhow::Result;

    use crate::bus::HandlerContext;
    use crate::event::{EventInstance, Outcome};
    use crate::framework::Framework;
    use crate::handle::Handle;
    use crate::object::Object;
    use crate::snapshot::Snapshot;
    use crate::testing::TestUnit;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    /// A delivery as seen by a handler: who got it, which event, what it decided.
    #[derive(Debug, Clone, PartialEq)]
    struct Delivery {
        observer: String,
        n: i64,
        deferred: bool,
    }

    #[derive(Clone)]
    struct Shared {
        rng: Rc<RefCell<fastrand::Rng>>,
        defer_percent: u8,
        deliveries: Rc<RefCell<Vec<Delivery>>>,
    }

    impl Shared {
        fn new(seed: u64, defer_percent: u8) -> Self {
            Self {
                rng: Rc::new(RefCell::new(fastrand::Rng::with_seed(seed))),
                defer_percent,
                deliveries: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn decide(&self, observer: &Handle, event: &EventInstance) -> Outcome {
            let deferred = self.rng.borrow_mut().u8(0..100) < self.defer_percent;
            self.deliveries.borrow_mut().push(Delivery {
                observer: observer.to_string(),
                n: event.data().get("n").ok().flatten().unwrap_or(-1),
                deferred,
            });
            if deferred {
                Outcome::Deferred
            } else {
                Outcome::Handled
            }
        }

        fn take(&self) -> Vec<Delivery> {
            std::mem::take(&mut *self.deliveries.borrow_mut())
        }
    }

    struct Worker {
        handle: Handle,
        handled: u64,
        shared: Shared,
    }

    impl Object for Worker {
        fn handle(&self) -> &Handle {
            &self.handle
        }

        fn events(&self) -> &'static [&'static str] {
            &["work", "crash"]
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with("handled", self.handled)
        }
    }

    fn on_work(w: &mut Worker, event: &EventInstance, _: &mut HandlerContext<'_>) -> Result<Outcome> {
        let outcome = w.shared.decide(&w.handle, event);
        if outcome == Outcome::Handled {
            w.handled += 1;
        }
        Ok(outcome)
    }

    fn on_crash(w: &mut Worker, _: &EventInstance, _: &mut HandlerContext<'_>) -> Result<Outcome> {
        w.handled += 1_000;
        anyhow::bail!("crash requested")
    }

    fn root() -> Handle {
        Handle::root("Unit").unwrap()
    }

    fn worker_handle(i: usize) -> Handle {
        root().child("Worker", Some(&i.to_string())).unwrap()
    }

    /// Root source plus `workers` observers of its `work` event.
    fn build(fw: &mut Framework, shared: &Shared, workers: usize) -> Result<Handle> {
        let source = root();
        let first = {
            let shared = shared.clone();
            fw.construct(source.clone(), move |handle, snapshot| {
                Ok(Worker {
                    handle,
                    handled: snapshot.get("handled")?.unwrap_or(0),
                    shared,
                })
            })?
        };
        fw.observe(&source, "work", &first, "on_work", on_work)?;
        fw.observe(&source, "crash", &first, "on_crash", on_crash)?;

        for i in 0..workers {
            let shared = shared.clone();
            let worker = fw.construct(worker_handle(i), move |handle, snapshot| {
                Ok(Worker {
                    handle,
                    handled: snapshot.get("handled")?.unwrap_or(0),
                    shared,
                })
            })?;
            fw.observe(&source, "work", &worker, "on_work", on_work)?;
        }
        Ok(source)
    }

    /// Expected pending notices: sequence → (observer, n).
    type Model = BTreeMap<u64, (String, i64)>;

    fn stored(unit: &TestUnit) -> Model {
        unit.stored_notices()
            .into_iter()
            .map(|notice| {
                let n = notice.data.get("n").unwrap().unwrap();
                (notice.sequence, (notice.observer.to_string(), n))
            })
            .collect()
    }

    fn observers(workers: usize) -> Vec<String> {
        std::iter::once(root().to_string())
            .chain((0..workers).map(|i| worker_handle(i).to_string()))
            .collect()
    }

    /// Drive `rounds` invocations and check every one against the model.
    fn run_random(seed: u64, rounds: i64, workers: usize, defer_percent: u8, crash_percent: u8) {
        let unit = TestUnit::new();
        let shared = Shared::new(seed, defer_percent);
        let mut plan = fastrand::Rng::with_seed(seed ^ 0x5eed);
        let mut model = Model::new();
        let mut next_sequence = 1u64;
        let mut handled_total = 0usize;

        for n in 0..rounds {
            let crash = plan.u8(0..100) < crash_percent;
            let kind = if crash { "crash" } else { "work" };
            let result = unit.invoke(kind, Snapshot::new().with("n", n), |fw| build(fw, &shared, workers));
            let deliveries = shared.take();

            // Replay always walks the pending notices oldest first.
            let replayed = &deliveries[..model.len().min(deliveries.len())];
            let expected: Vec<(String, i64)> = model.values().cloned().collect();
            let seen: Vec<(String, i64)> = replayed.iter().map(|d| (d.observer.clone(), d.n)).collect();
            assert_eq!(seen, expected, "seed {seed} round {n}: replay order");

            if crash {
                assert!(result.is_err(), "seed {seed} round {n}: crash must abort");
                assert_eq!(stored(&unit), model, "seed {seed} round {n}: abort changed notices");
                continue;
            }
            result.unwrap();

            let mut next = Model::new();
            for (delivery, (sequence, entry)) in replayed.iter().zip(model.iter()) {
                if delivery.deferred {
                    next.insert(*sequence, entry.clone());
                } else {
                    handled_total += 1;
                }
            }

            // Then the trigger reaches every observer in registration order.
            let fresh = &deliveries[replayed.len()..];
            let fresh_observers: Vec<String> = fresh.iter().map(|d| d.observer.clone()).collect();
            assert_eq!(fresh_observers, observers(workers), "seed {seed} round {n}: trigger order");
            for delivery in fresh {
                assert_eq!(delivery.n, n);
                if delivery.deferred {
                    next.insert(next_sequence, (delivery.observer.clone(), n));
                    next_sequence += 1;
                } else {
                    handled_total += 1;
                }
            }

            model = next;
            assert_eq!(stored(&unit), model, "seed {seed} round {n}: stored notices");
        }

        let sequences: Vec<u64> = unit.stored_notices().iter().map(|n| n.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert!(!unit.is_locked());

        let handled: u64 = std::iter::once(root())
            .chain((0..workers).map(worker_handle))
            .filter_map(|h| unit.stored_snapshot(&h))
            .map(|s| s.get::<u64>("handled").unwrap().unwrap_or(0))
            .sum();
        assert_eq!(handled as usize, handled_total, "seed {seed}: handled count");
    }

    // ==========================================================================
    // Randomized Runs
    // ==========================================================================

    #[test]
    fn test_random_deferrals_single_observer() {
        for seed in 0..20 {
            run_random(seed, 40, 0, 50, 0);
        }
    }

    #[test]
    fn test_random_deferrals_many_observers() {
        for seed in 100..110 {
            run_random(seed, 30, 4, 40, 0);
        }
    }

    #[test]
    fn test_random_deferrals_with_crashes() {
        for seed in 200..215 {
            run_random(seed, 50, 2, 60, 20);
        }
    }

    #[test]
    fn test_mostly_deferred_backlog_drains_in_order() {
        let unit = TestUnit::new();
        let shared = Shared::new(7, 100);

        for n in 0..25 {
            unit.invoke("work", Snapshot::new().with("n", n), |fw| build(fw, &shared, 0))
                .unwrap();
        }
        assert_eq!(unit.stored_notices().len(), 25);
        shared.take();

        // Stop deferring: the whole backlog drains before the trigger.
        let drain = Shared::new(7, 0);
        let report = unit
            .invoke("work", Snapshot::new().with("n", 25), |fw| build(fw, &drain, 0))
            .unwrap();
        let order: Vec<i64> = drain.take().iter().map(|d| d.n).collect();
        assert_eq!(order, (0..=25).collect::<Vec<_>>());
        assert_eq!(report.notices_removed, 25);
        assert!(unit.stored_notices().is_empty());
    }

    #[test]
    fn test_sequences_never_reused_after_drain() {
        let unit = TestUnit::new();
        let always = Shared::new(1, 100);
        let never = Shared::new(1, 0);

        for n in 0..3 {
            unit.invoke("work", Snapshot::new().with("n", n), |fw| build(fw, &always, 0))
                .unwrap();
        }
        unit.invoke("work", Snapshot::new().with("n", 3), |fw| build(fw, &never, 0))
            .unwrap();
        assert!(unit.stored_notices().is_empty());

        unit.invoke("work", Snapshot::new().with("n", 4), |fw| build(fw, &always, 0))
            .unwrap();
        let sequences: Vec<u64> = unit.stored_notices().iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, vec![4]);
    }
}
