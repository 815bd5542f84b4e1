//! Property tests for the kernel's guarantees

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use taskcell::budget::{Admission, GovernorConfig, ResourceGovernor};
use taskcell::bus::{BusConfig, Envelope, MessageBus, Payload, SendOutcome};
use taskcell::collab::{
    Collaborators, NullAuditSink, Scenario, ScriptedCollaborators, ScriptedStep, ScriptedTask, StaticPressure,
};
use taskcell::config::Config;
use taskcell::convergence::{ConvergenceDetector, Signature};
use taskcell::domain::{Budget, CellId, CorrelationId, Mode, PeerGroupId, Subtask, TaskDescriptor};
use taskcell::events::EventBus;
use taskcell::kernel::Kernel;
use taskcell::protocol::{Contender, resolve};

fn id(s: &str) -> CellId {
    CellId::from_string(s)
}

#[derive(Debug, Clone)]
enum LedgerOp {
    Spawn { parent: usize, fraction: f64 },
    Charge { unit: usize, cost: f64 },
    Meter { unit: usize, cost: f64 },
    Settle { unit: usize },
}

fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (any::<usize>(), 0.0f64..=1.0).prop_map(|(parent, fraction)| LedgerOp::Spawn { parent, fraction }),
        (any::<usize>(), 0.0f64..30.0).prop_map(|(unit, cost)| LedgerOp::Charge { unit, cost }),
        (any::<usize>(), 0.0f64..3.0).prop_map(|(unit, cost)| LedgerOp::Meter { unit, cost }),
        any::<usize>().prop_map(|unit| LedgerOp::Settle { unit }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn budget_is_conserved_across_any_operation_sequence(ops in prop::collection::vec(ledger_op(), 1..60)) {
        let governor = ResourceGovernor::new(GovernorConfig::default(), Arc::new(StaticPressure::new(0.0)));
        let total = Budget::from_units(100.0);
        let root = id("root");
        prop_assert_eq!(governor.open_root(&root, total, 0), Admission::Admitted);

        let mut units = vec![root.clone()];
        let mut parents: HashMap<CellId, CellId> = HashMap::new();
        let mut expected_spent = Budget::ZERO;

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                LedgerOp::Spawn { parent, fraction } => {
                    let parent = units[parent % units.len()].clone();
                    if let Ok(sizing) = governor.allocate_child_budget(&parent, fraction) {
                        let child = id(&format!("cell-{}", n));
                        if governor.admit(&child, Some(&parent), sizing.amount, 0) == Admission::Admitted {
                            parents.insert(child.clone(), parent);
                            units.push(child);
                        }
                    }
                }
                LedgerOp::Charge { unit, cost } => {
                    let unit = &units[unit % units.len()];
                    let cost = Budget::from_units(cost);
                    if let Some(ledger) = governor.snapshot(unit) {
                        let available = ledger.available();
                        match governor.charge(unit, cost) {
                            Ok(_) => expected_spent = expected_spent.saturating_add(cost),
                            Err(_) => expected_spent = expected_spent.saturating_add(available),
                        }
                    }
                }
                LedgerOp::Meter { unit, cost } => {
                    let unit = &units[unit % units.len()];
                    let cost = Budget::from_units(cost);
                    if governor.snapshot(unit).is_some()
                        && governor.meter_communication(unit, cost, taskcell::bus::Direction::Lateral).is_ok()
                    {
                        expected_spent = expected_spent.saturating_add(cost);
                    }
                }
                LedgerOp::Settle { unit } => {
                    let unit = units[unit % units.len()].clone();
                    if unit != root {
                        let _ = governor.reclaim_surplus(&unit);
                    }
                }
            }
            units.retain(|u| governor.snapshot(u).is_some());
            prop_assert!(governor.check_all_invariants());
        }

        for unit in units.iter().filter(|u| parents.get(*u) == Some(&root)) {
            governor.reclaim_surplus(unit).unwrap();
        }
        let ledger = governor.snapshot(&root).unwrap();
        prop_assert_eq!(ledger.children_allocated(), Budget::ZERO);
        prop_assert_eq!(ledger.spent(), expected_spent);

        let surplus = governor.reclaim_surplus(&root).unwrap();
        prop_assert_eq!(ledger.spent().saturating_add(surplus), total);
        prop_assert_eq!(governor.live_units(), 0);
    }
}

#[derive(Debug, Clone)]
struct ChildPlan {
    behaviour: usize,
    score: f64,
    cost: u32,
    after_previous: bool,
}

fn child_plan() -> impl Strategy<Value = ChildPlan> {
    (0usize..6, 0.0f64..=1.0, 1u32..5, any::<bool>()).prop_map(|(behaviour, score, cost, after_previous)| ChildPlan {
        behaviour,
        score,
        cost,
        after_previous,
    })
}

fn step(cost: u32) -> ScriptedStep {
    ScriptedStep {
        cost: Budget::from_units(cost as f64),
        ..ScriptedStep::default()
    }
}

fn solo(steps: Vec<ScriptedStep>, score: f64) -> ScriptedTask {
    ScriptedTask {
        mode: Mode::Solo,
        steps,
        scores: vec![score],
        ..ScriptedTask::default()
    }
}

fn random_scenario(children: &[ChildPlan]) -> Scenario {
    let mut tasks = HashMap::new();
    let mut subtasks = Vec::new();
    for (n, plan) in children.iter().enumerate() {
        let task_id = format!("part-{}", n);
        let mut subtask = Subtask::new(&task_id, format!("Part {}", n));
        if plan.after_previous && n > 0 {
            subtask.depends_on = vec![format!("part-{}", n - 1)];
        }
        subtasks.push(subtask);

        let task = match plan.behaviour {
            0 => solo(
                vec![ScriptedStep {
                    output: Some(format!("part {} done", n)),
                    ..step(plan.cost)
                }],
                plan.score,
            ),
            1 => solo(
                vec![ScriptedStep {
                    fail: Some("source unavailable".to_string()),
                    partial: Some(format!("part {} sketch", n)),
                    ..step(plan.cost)
                }],
                plan.score,
            ),
            2 => solo(
                vec![ScriptedStep {
                    clarify: Some("Which year?".to_string()),
                    ..step(plan.cost)
                }],
                plan.score,
            ),
            3 => solo(
                vec![ScriptedStep {
                    blocked: Some("waiting on access".to_string()),
                    ..step(plan.cost)
                }],
                plan.score,
            ),
            4 => {
                let left = format!("part-{}-left", n);
                let right = format!("part-{}-right", n);
                tasks.insert(left.clone(), solo(vec![step(plan.cost)], 0.9));
                tasks.insert(right.clone(), solo(vec![step(plan.cost)], 0.9));
                ScriptedTask {
                    mode: Mode::Delegate,
                    subtasks: vec![Subtask::new(&left, "Left half"), Subtask::new(&right, "Right half")],
                    scores: vec![plan.score],
                    ..ScriptedTask::default()
                }
            }
            _ => solo(
                vec![
                    ScriptedStep {
                        fail: Some("flaky".to_string()),
                        ..step(plan.cost)
                    },
                    step(plan.cost),
                ],
                plan.score,
            ),
        };
        tasks.insert(task_id, task);
    }
    tasks.insert(
        "root".to_string(),
        ScriptedTask {
            mode: Mode::Delegate,
            subtasks,
            ..ScriptedTask::default()
        },
    );

    Scenario {
        root: TaskDescriptor::new("root", "Random root"),
        budget: Some(Budget::from_units(60.0)),
        pressure: 0.0,
        tasks,
        similarities: Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_submission_terminates_and_cleans_up(children in prop::collection::vec(child_plan(), 1..5)) {
        let scenario = random_scenario(&children);
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let (finished, live_units, arena_empty, registered, invariants) = runtime.block_on(async {
            let mut config = Config::default();
            config.bus.message_cost = Budget::ZERO;
            let task = scenario.root.clone();
            let kernel = Kernel::new(
                config,
                Collaborators::scripted(Arc::new(ScriptedCollaborators::new(scenario))),
                Arc::new(StaticPressure::new(0.0)),
                Arc::new(NullAuditSink),
            );
            let finished = tokio::time::timeout(Duration::from_secs(20), kernel.submit(task, Budget::from_units(60.0)))
                .await
                .is_ok();
            (
                finished,
                kernel.governor().live_units(),
                kernel.arena().is_empty(),
                kernel.bus().metrics().registered,
                kernel.governor().check_all_invariants(),
            )
        });

        prop_assert!(finished, "submission did not terminate");
        prop_assert_eq!(live_units, 0);
        prop_assert!(arena_empty);
        prop_assert_eq!(registered, 0);
        prop_assert!(invariants);
    }
}

#[derive(Debug, Clone)]
enum BusOp {
    Drop { cell: usize },
    Send { from: usize, to: Vec<usize> },
}

fn bus_op() -> impl Strategy<Value = BusOp> {
    prop_oneof![
        1 => any::<usize>().prop_map(|cell| BusOp::Drop { cell }),
        4 => (any::<usize>(), prop::collection::vec(any::<usize>(), 1..4))
            .prop_map(|(from, to)| BusOp::Send { from, to }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_lateral_send_is_delivered_or_reported(
        peers in 2usize..7,
        ops in prop::collection::vec(bus_op(), 1..40),
    ) {
        let governor = Arc::new(ResourceGovernor::new(GovernorConfig::default(), Arc::new(StaticPressure::new(0.0))));
        let config = BusConfig {
            message_cost: Budget::ZERO,
            rate_limit_per_sec: 10_000,
            ..BusConfig::default()
        };
        let bus = Arc::new(MessageBus::new(config, governor.clone(), Arc::new(EventBus::new(256))));

        let group = PeerGroupId::new();
        let ids: Vec<CellId> = (0..peers).map(|n| id(&format!("peer-{}", n))).collect();
        let mut registrations: Vec<Option<_>> = Vec::new();
        for cell in &ids {
            prop_assert_eq!(governor.open_root(cell, Budget::from_units(10.0), 0), Admission::Admitted);
            registrations.push(Some(bus.register(cell, Some(group), CancellationToken::new()).unwrap()));
        }

        for op in ops {
            match op {
                BusOp::Drop { cell } => {
                    let cell = cell % peers;
                    if let Some(registration) = registrations[cell].take() {
                        drop(registration);
                        prop_assert!(!bus.is_registered(&ids[cell]));
                    }
                }
                BusOp::Send { from, to } => {
                    let from = from % peers;
                    if registrations[from].is_none() {
                        continue;
                    }
                    let mut targets: Vec<usize> = to.into_iter().map(|t| t % peers).filter(|t| *t != from).collect();
                    targets.sort_unstable();
                    targets.dedup();
                    if targets.is_empty() {
                        continue;
                    }

                    let envelope = Envelope::lateral(
                        ids[from].clone(),
                        targets.iter().map(|t| ids[*t].clone()).collect(),
                        Payload::Insight { text: "shared".to_string() },
                        CorrelationId::new(),
                    );
                    let sent = envelope.id();
                    let live: Vec<CellId> = targets.iter().filter(|t| registrations[**t].is_some()).map(|t| ids[*t].clone()).collect();
                    let dead: Vec<CellId> = targets.iter().filter(|t| registrations[**t].is_none()).map(|t| ids[*t].clone()).collect();

                    match bus.send(envelope) {
                        SendOutcome::Delivered { recipients } | SendOutcome::Queued { recipients, .. } => {
                            prop_assert!(dead.is_empty());
                            prop_assert_eq!(&recipients, &live);
                        }
                        SendOutcome::Undeliverable { delivered, undeliverable } => {
                            prop_assert_eq!(&delivered, &live);
                            prop_assert_eq!(&undeliverable, &dead);
                            let notices = bus.drain(&ids[from]);
                            prop_assert_eq!(notices.len(), 1);
                            let reported = matches!(
                                notices[0].payload(),
                                Payload::DeliveryFailure { envelope, undeliverable, .. } if *envelope == sent && undeliverable == &dead
                            );
                            prop_assert!(reported);
                        }
                        SendOutcome::Rejected { reason } => {
                            prop_assert!(false, "lateral send between peers rejected: {}", reason);
                        }
                    }

                    for recipient in &live {
                        let mail = bus.drain(recipient);
                        prop_assert_eq!(mail.len(), 1);
                        prop_assert_eq!(mail[0].id(), sent);
                    }
                }
            }
        }
    }
}

fn contender() -> impl Strategy<Value = (f64, u32, u64)> {
    (prop::sample::select(vec![0.4, 0.7, 0.9]), 0u32..3, 0u64..3)
}

proptest! {
    #[test]
    fn conflict_resolution_ignores_argument_order(
        (a_score, a_depth, a_spawn) in contender(),
        (b_score, b_depth, b_spawn) in contender(),
        a_first in any::<bool>(),
    ) {
        let (a_id, b_id) = if a_first { ("cell-a", "cell-b") } else { ("cell-b", "cell-a") };
        let a = Contender {
            cell: id(a_id),
            subtask: "estimate-a".to_string(),
            output: "412".to_string(),
            score: a_score,
            depth: a_depth,
            spawn_seq: a_spawn,
        };
        let b = Contender {
            cell: id(b_id),
            subtask: "estimate-b".to_string(),
            output: "389".to_string(),
            score: b_score,
            depth: b_depth,
            spawn_seq: b_spawn,
        };

        let forward = resolve(&a, &b);
        let backward = resolve(&b, &a);
        prop_assert_eq!(&forward.winner.cell, &backward.winner.cell);
        prop_assert_eq!(forward.rule, backward.rule);
        prop_assert!(forward.winner.score >= forward.loser.score);
    }

    #[test]
    fn convergence_veto_never_lifts(
        calls in prop::collection::vec((0usize..3, 1u32..6), 1..50),
    ) {
        let subtasks = ["alpha", "beta", "gamma"];
        let mut detector = ConvergenceDetector::new();
        let mut vetoed = Vec::new();

        for (which, max_attempts) in calls {
            let signature = Signature::new(subtasks[which], "failed");
            let allowed = detector.should_retry(signature, max_attempts);
            if vetoed.contains(&signature) {
                prop_assert!(!allowed);
            }
            if allowed {
                detector.record_attempt(signature);
            } else {
                prop_assert!(detector.is_vetoed(signature));
                vetoed.push(signature);
            }
            for signature in &vetoed {
                prop_assert!(detector.is_vetoed(*signature));
            }
        }
    }
}
