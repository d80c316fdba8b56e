//! End-to-end solves on the host driver.
//!
//! These tests drive the full lifecycle (registry, schedulers, executor) and
//! check segmentation results, memory-pressure behaviour, and failure cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;

use hmflow_core::{
    CancelToken, ConfigurationError, DeviceError, DeviceId, DeviceRegistry, DeviceSpec, Driver,
    Extent, Hierarchy, HierarchyBuilder, HierarchySolver, HostDriver, NodeId, RegistryError,
    SchedulerError, SolveError, SolveParams, SolverState, Volume, decompose,
};

fn registry_on(driver: &Arc<HostDriver>) -> Arc<DeviceRegistry> {
    let driver: Arc<dyn Driver> = Arc::clone(driver) as Arc<dyn Driver>;
    Arc::new(DeviceRegistry::new(driver))
}

fn params(iterations: usize) -> SolveParams {
    SolveParams {
        iterations,
        ..SolveParams::default()
    }
}

/// Cost volume that is `inside` on the left half and `outside` on the right.
fn halves(extent: Extent, inside: f32, outside: f32) -> Volume {
    Volume::from_fn(extent, |x, _, _| {
        if x < extent.x / 2 { inside } else { outside }
    })
}

fn flat_tree() -> (Hierarchy, NodeId, NodeId) {
    let mut b = HierarchyBuilder::new();
    let root = b.root();
    let a = b.add_named_child(root, "a");
    let c = b.add_named_child(root, "c");
    (b.build().unwrap(), a, c)
}

/// root → { obj → { a, c }, bg, fg }
fn nested_tree() -> (Hierarchy, [NodeId; 5]) {
    let mut b = HierarchyBuilder::new();
    let root = b.root();
    let obj = b.add_named_child(root, "obj");
    let a = b.add_named_child(obj, "a");
    let c = b.add_named_child(obj, "c");
    let bg = b.add_named_child(root, "bg");
    let fg = b.add_named_child(root, "fg");
    (b.build().unwrap(), [obj, a, c, bg, fg])
}

fn nested_solver(registry: Arc<DeviceRegistry>, params: SolveParams) -> HierarchySolver {
    let (h, [obj, a, c, bg, fg]) = nested_tree();
    let e = Extent::new(6, 4, 1);
    let mut solver = HierarchySolver::new(registry, h, params);
    solver.set_data_term(a, halves(e, 0.1, 0.9)).unwrap();
    solver.set_data_term(c, Volume::filled(e, 0.5)).unwrap();
    solver.set_data_term(bg, halves(e, 0.9, 0.1)).unwrap();
    solver.set_data_term(fg, Volume::filled(e, 0.7)).unwrap();
    for node in [obj, a, c, bg, fg] {
        solver.set_alpha(node, 0.1).unwrap();
    }
    solver
}

fn assert_close(left: &Volume, right: &Volume) {
    for (l, r) in left.as_slice().iter().zip(right.as_slice()) {
        assert!((l - r).abs() < 1e-6, "{l} != {r}");
    }
}

#[test]
fn symmetric_leaves_split_evenly() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let (h, a, c) = flat_tree();
    let e = Extent::new(8, 8, 1);
    let mut solver = HierarchySolver::new(registry_on(&driver), h, params(50));
    let term = Volume::from_fn(e, |x, y, _| (x + y) as f32 / 14.0);
    solver.set_data_term(a, term.clone()).unwrap();
    solver.set_data_term(c, term).unwrap();

    let solution = solver.solve().unwrap();
    for leaf in [a, c] {
        for &v in solution.segmentation.get(leaf).unwrap().as_slice() {
            assert!((v - 0.5).abs() < 1e-5, "got {v}");
        }
    }
    assert_eq!(solver.state(), SolverState::Done);
}

#[test]
fn cheaper_label_wins_each_half() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let (h, a, c) = flat_tree();
    let e = Extent::new(6, 6, 1);
    let mut solver = HierarchySolver::new(registry_on(&driver), h, params(100));
    solver.set_data_term(a, halves(e, 0.1, 0.9)).unwrap();
    solver.set_data_term(c, halves(e, 0.9, 0.1)).unwrap();

    let seg = solver.solve().unwrap().segmentation;
    let (pa, pc) = (seg.get(a).unwrap(), seg.get(c).unwrap());
    for y in 0..e.y {
        assert!(pa.get(0, y, 0) > 0.9);
        assert!(pc.get(e.x - 1, y, 0) > 0.9);
    }
    for (&u, &v) in pa.as_slice().iter().zip(pc.as_slice()) {
        assert!((0.0..=1.0).contains(&u));
        assert!((u + v - 1.0).abs() < 1e-5);
    }
}

#[test]
fn nested_hierarchy_segments_inner_labels() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let mut solver = nested_solver(registry_on(&driver), params(150));
    let [_, a, c, bg, fg] = ids(&solver);
    let seg = solver.solve().unwrap().segmentation;

    assert_eq!(seg.len(), 4);
    // a and c are normalized against each other; bg and fg against each other
    assert!(seg.get(a).unwrap().get(0, 0, 0) > 0.9);
    assert!(seg.get(c).unwrap().get(0, 0, 0) < 0.1);
    assert!(seg.get(bg).unwrap().get(5, 0, 0) > 0.9);
    assert!(seg.get(fg).unwrap().get(5, 0, 0) < 0.1);
}

fn ids(solver: &HierarchySolver) -> [NodeId; 5] {
    let h = solver.hierarchy();
    ["obj", "a", "c", "bg", "fg"].map(|name| h.find(name).unwrap())
}

#[test]
fn multi_device_matches_single_device() {
    let single = Arc::new(HostDriver::uniform(1, 1 << 20));
    let expected = nested_solver(registry_on(&single), params(20))
        .solve()
        .unwrap();

    let dual = Arc::new(HostDriver::uniform(2, 1 << 20));
    let mut p = params(20);
    p.devices = vec![DeviceId(0), DeviceId(1)];
    let mut solver = nested_solver(registry_on(&dual), p);
    let actual = solver.solve().unwrap();

    for (leaf, volume) in expected.segmentation.iter() {
        assert_close(volume, actual.segmentation.get(leaf).unwrap());
    }
    assert_eq!(actual.report.devices.len(), 2);
    // both devices did work and both were reset on release
    for device in [DeviceId(0), DeviceId(1)] {
        let counters = dual.counters(device).unwrap();
        assert!(counters.launches > 0);
        assert_eq!(counters.resets, 1);
        assert_eq!(dual.live_streams(device), 0);
    }
}

#[test]
fn five_slots_complete_with_evictions() {
    let e = Extent::new(4, 4, 1);
    let slot_bytes = e.field_bytes();
    let roomy = Arc::new(HostDriver::uniform(1, 1 << 20));
    let tight = Arc::new(HostDriver::new(vec![
        DeviceSpec::new("tight", 5 * slot_bytes).with_max_slots_per_allocation(2),
    ]));

    let run = |driver: &Arc<HostDriver>| {
        let (h, a, c) = flat_tree();
        let mut p = params(10);
        p.device_memory_fraction = 1.0;
        let mut solver = HierarchySolver::new(registry_on(driver), h, p);
        solver.set_data_term(a, halves(e, 0.2, 0.6)).unwrap();
        solver.set_data_term(c, halves(e, 0.6, 0.2)).unwrap();
        solver.solve().unwrap()
    };

    let expected = run(&roomy);
    let constrained = run(&tight);
    let report = &constrained.report.devices[0];
    assert_eq!(report.num_buffers, 5);
    assert!(report.homed_buffers > report.num_buffers);
    assert!(report.stats.evictions > 0);
    assert!(report.stats.discards > 0);
    assert!(report.stats.peak_mapped <= 5);
    for (leaf, volume) in expected.segmentation.iter() {
        assert_close(volume, constrained.segmentation.get(leaf).unwrap());
    }
}

#[test]
fn four_slots_exhaust_and_release_device() {
    let e = Extent::new(4, 4, 1);
    let driver = Arc::new(HostDriver::new(vec![DeviceSpec::new(
        "tiny",
        4 * e.field_bytes(),
    )]));
    let registry = registry_on(&driver);
    let (h, a, c) = flat_tree();
    let mut p = params(5);
    p.device_memory_fraction = 1.0;
    let mut solver = HierarchySolver::new(Arc::clone(&registry), h, p);
    solver.set_data_term(a, Volume::filled(e, 0.3)).unwrap();
    solver.set_data_term(c, Volume::filled(e, 0.7)).unwrap();

    let err = solver.solve().unwrap_err();
    assert!(err.is_resource_exhausted(), "{err}");
    assert_eq!(solver.state(), SolverState::Failed);
    assert_eq!(registry.stakeholders(DeviceId(0)), 0);
    assert_eq!(registry.stream_count(), 0);
    assert_eq!(driver.counters(DeviceId(0)).unwrap().resets, 1);
}

#[test]
fn cancellation_between_iterations() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let registry = registry_on(&driver);
    let (h, a, c) = flat_tree();
    let e = Extent::new(4, 4, 1);
    let mut solver = HierarchySolver::new(Arc::clone(&registry), h, params(50));
    solver.set_data_term(a, Volume::filled(e, 0.3)).unwrap();
    solver.set_data_term(c, Volume::filled(e, 0.7)).unwrap();
    let token = CancelToken::new();
    solver.set_cancel_token(token.clone());

    solver.validate().unwrap();
    solver.initialize().unwrap();
    let err = solver
        .run_with_progress(|done, _| {
            if done == 2 {
                token.cancel();
            }
        })
        .unwrap_err();
    assert!(matches!(err, SolveError::Cancelled { completed: 2 }));
    assert_eq!(solver.state(), SolverState::Failed);
    assert_eq!(registry.stakeholders(DeviceId(0)), 0);
    assert_eq!(driver.live_streams(DeviceId(0)), 0);
}

#[test]
fn injected_transfer_failure_aborts_run() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let registry = registry_on(&driver);
    let (h, a, c) = flat_tree();
    let e = Extent::new(4, 4, 1);
    let mut solver = HierarchySolver::new(Arc::clone(&registry), h, params(3));
    solver.set_data_term(a, Volume::filled(e, 0.3)).unwrap();
    solver.set_data_term(c, Volume::filled(e, 0.7)).unwrap();
    solver.validate().unwrap();
    solver.initialize().unwrap();

    driver.fail_transfer_after(3);
    let err = solver.run().unwrap_err();
    assert!(
        matches!(
            err,
            SolveError::Scheduler(SchedulerError::Device(DeviceError::Injected {
                operation: "upload"
            }))
        ),
        "{err}"
    );
    assert_eq!(solver.state(), SolverState::Failed);
    assert_eq!(registry.stakeholders(DeviceId(0)), 0);
    assert_eq!(driver.counters(DeviceId(0)).unwrap().resets, 1);
}

#[test]
fn failed_reset_on_close_still_releases_other_devices() {
    let driver = Arc::new(HostDriver::uniform(2, 1 << 20));
    let registry = registry_on(&driver);
    let (h, a, c) = flat_tree();
    let e = Extent::new(4, 4, 1);
    let mut p = params(2);
    p.devices = vec![DeviceId(0), DeviceId(1)];
    let mut solver = HierarchySolver::new(Arc::clone(&registry), h, p);
    solver.set_data_term(a, Volume::filled(e, 0.3)).unwrap();
    solver.set_data_term(c, Volume::filled(e, 0.7)).unwrap();

    driver.fail_reset_of(DeviceId(0));
    let err = solver.solve().unwrap_err();
    assert!(
        matches!(
            err,
            SolveError::Registry(RegistryError::Device(DeviceError::Injected {
                operation: "reset"
            }))
        ),
        "{err}"
    );
    assert_eq!(solver.state(), SolverState::Failed);
    for device in [DeviceId(0), DeviceId(1)] {
        assert_eq!(registry.stakeholders(device), 0);
        assert_eq!(driver.counters(device).unwrap().resets, 1);
        assert_eq!(driver.live_streams(device), 0);
    }
}

#[test]
fn registry_is_reusable_after_a_solve() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let registry = registry_on(&driver);
    let e = Extent::new(4, 4, 1);
    for round in 1..=2 {
        let (h, a, c) = flat_tree();
        let mut solver = HierarchySolver::new(Arc::clone(&registry), h, params(2));
        solver.set_data_term(a, Volume::filled(e, 0.5)).unwrap();
        solver.set_data_term(c, Volume::filled(e, 0.5)).unwrap();
        solver.solve().unwrap();
        assert_eq!(driver.counters(DeviceId(0)).unwrap().resets, round);
    }
}

#[test]
fn unknown_device_fails_initialization() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let (h, a, c) = flat_tree();
    let mut p = params(1);
    p.devices = vec![DeviceId(3)];
    let mut solver = HierarchySolver::new(registry_on(&driver), h, p);
    let e = Extent::new(2, 2, 1);
    solver.set_data_term(a, Volume::zeros(e)).unwrap();
    solver.set_data_term(c, Volume::zeros(e)).unwrap();
    solver.validate().unwrap();
    assert!(matches!(
        solver.initialize(),
        Err(SolveError::Registry(RegistryError::InvalidDevice { count: 1, .. }))
    ));
    assert_eq!(solver.state(), SolverState::Failed);
}

#[test]
fn configuration_errors_precede_device_work() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let (h, a, c) = flat_tree();
    let mut p = params(1);
    p.cc = 1.5;
    let mut solver = HierarchySolver::new(registry_on(&driver), h, p);
    solver.set_data_term(a, Volume::zeros(Extent::new(2, 2, 1))).unwrap();
    solver.set_data_term(c, Volume::zeros(Extent::new(2, 3, 1))).unwrap();
    assert!(matches!(
        solver.solve(),
        Err(SolveError::Configuration(ConfigurationError::InvalidParameter { name: "cc", .. }))
    ));
    assert_eq!(driver.counters(DeviceId(0)).unwrap().streams_created, 0);
    assert!(matches!(
        solver.run(),
        Err(SolveError::InvalidState {
            expected: "initialized",
            actual: "failed"
        })
    ));
}

#[test]
fn zero_iterations_return_initial_shares() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let mut solver = nested_solver(registry_on(&driver), params(0));
    let [_, a, c, _, _] = ids(&solver);
    let solution = solver.solve().unwrap();
    assert_eq!(solution.report.iterations, 0);
    for &v in solution.segmentation.get(a).unwrap().as_slice() {
        assert!((v - 0.5).abs() < 1e-6);
    }
    assert_eq!(
        solution.segmentation.get(a),
        solution.segmentation.get(c)
    );
}

#[test]
fn solved_labelling_beats_its_mirror_image() {
    let driver = Arc::new(HostDriver::uniform(1, 1 << 20));
    let (h, a, c) = flat_tree();
    let e = Extent::new(6, 6, 1);
    let mut solver = HierarchySolver::new(registry_on(&driver), h.clone(), params(100));
    let inputs_a = halves(e, 0.1, 0.9);
    let inputs_c = halves(e, 0.9, 0.1);
    solver.set_data_term(a, inputs_a).unwrap();
    solver.set_data_term(c, inputs_c).unwrap();
    let labels = solver.solve().unwrap().segmentation.into_labels();
    let swapped: BTreeMap<NodeId, Volume> =
        BTreeMap::from([(a, labels[&c].clone()), (c, labels[&a].clone())]);

    let inputs = solver.inputs().clone();
    let solved = decompose(&h, &inputs, &labels).unwrap();
    let mirrored = decompose(&h, &inputs, &swapped).unwrap();
    assert!(solved.total < mirrored.total);
}
