//! End-to-end scenarios covering the SDR container, proxies, metrics,
//! the Spatial Pooler and the stream format working together.

use veles::prelude::*;
use veles::VelesError;

#[test]
fn sdr_round_trip_all_views() {
    let mut x = Sdr::new(&[3, 3]).unwrap();
    x.set_dense(&[0, 1, 0, 0, 1, 0, 0, 0, 1]).unwrap();

    assert_eq!(x.get_sparse(), vec![1, 4, 8]);
    assert_eq!(x.get_coordinates(), vec![vec![0, 1, 2], vec![1, 1, 2]]);
    assert_eq!(x.get_sum(), 3);

    // Writing through any view yields the same logical value.
    let mut y = Sdr::new(&[3, 3]).unwrap();
    y.set_coordinates(&vec![vec![0, 1, 2], vec![1, 1, 2]]).unwrap();
    assert_eq!(x, y);

    let mut z = Sdr::new(&[3, 3]).unwrap();
    z.set_sparse(&[1, 4, 8]).unwrap();
    assert_eq!(x, z);
}

#[test]
fn proxy_reshape_tracks_parent() {
    let mut a = Sdr::new(&[4, 4]).unwrap();
    a.set_coordinates(&vec![vec![1, 1, 2], vec![0, 1, 2]]).unwrap();

    let b = SdrProxy::with_dimensions(&a, &[8, 2]).unwrap();
    assert_eq!(
        b.get_coordinates().unwrap(),
        vec![vec![2, 2, 5], vec![0, 1, 0]]
    );

    // Parent mutations are visible through the proxy tree.
    let c = b.child_with_dimensions(&[16]).unwrap();
    a.set_sparse(&[15]).unwrap();
    assert_eq!(c.get_sparse().unwrap(), vec![15]);

    // Destroying the parent invalidates the whole subtree.
    drop(a);
    assert!(matches!(b.get_sparse(), Err(VelesError::InvalidState(_))));
    assert!(matches!(c.get_sparse(), Err(VelesError::InvalidState(_))));
}

#[test]
fn activation_frequency_entropy_extremes() {
    let mut rng = Random::new(42);
    let mut sdr = Sdr::new(&[1000]).unwrap();

    let always_off = ActivationFrequency::new(&sdr, 100).unwrap();
    for _ in 0..20 {
        sdr.randomize(0.0, &mut rng);
    }
    assert_eq!(always_off.entropy(), 0.0);

    let always_on = ActivationFrequency::new(&sdr, 100).unwrap();
    for _ in 0..20 {
        sdr.randomize(1.0, &mut rng);
    }
    assert_eq!(always_on.entropy(), 0.0);

    // A run several periods long lets the per-bit frequencies settle at 0.5.
    let half = ActivationFrequency::new(&sdr, 100).unwrap();
    for _ in 0..1000 {
        sdr.randomize(0.5, &mut rng);
    }
    assert!(half.entropy() > 0.98, "entropy {}", half.entropy());
}

#[test]
fn add_noise_preserves_sum_and_fixes_overlap() {
    let mut rng = Random::new(7);
    let mut sdr = Sdr::new(&[2000]).unwrap();
    sdr.randomize(0.1, &mut rng);
    let sum = sdr.get_sum();

    for &fraction in &[0.0f32, 0.1, 0.25, 0.5, 1.0] {
        let before = sdr.clone();
        sdr.add_noise(fraction, &mut rng);

        assert_eq!(sdr.get_sum(), sum);
        let flips = (f64::from(fraction) * sum as f64).round() as usize;
        assert_eq!(before.get_overlap(&sdr).unwrap(), sum - flips);
    }
}

#[test]
fn spatial_pooler_deterministic_across_instances() {
    let params = SpatialPoolerParams {
        input_dimensions: vec![32, 32],
        column_dimensions: vec![64, 64],
        num_active_columns_per_inh_area: 40,
        local_area_density: 0.0,
        global_inhibition: true,
        seed: 42,
        ..Default::default()
    };
    let mut sp1 = SpatialPooler::new(params.clone()).unwrap();
    let mut sp2 = SpatialPooler::new(params).unwrap();

    let mut rng = Random::new(2020);
    let mut input = Sdr::new(&[32, 32]).unwrap();
    let mut active1 = Sdr::new(&[64, 64]).unwrap();
    let mut active2 = Sdr::new(&[64, 64]).unwrap();

    for _ in 0..100 {
        input.randomize(0.05, &mut rng);
        sp1.compute(&input, true, &mut active1).unwrap();
        sp2.compute(&input, true, &mut active2).unwrap();

        assert_eq!(active1.get_sparse(), active2.get_sparse());
        // The column-count knob is honored exactly under global inhibition.
        assert_eq!(active1.get_sum(), 40);
    }
}

#[test]
fn spatial_pooler_different_seeds_diverge() {
    let mut sp1 = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![32, 32],
        column_dimensions: vec![64, 64],
        seed: 42,
        ..Default::default()
    })
    .unwrap();
    let mut sp2 = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![32, 32],
        column_dimensions: vec![64, 64],
        seed: 43,
        ..Default::default()
    })
    .unwrap();

    let mut rng = Random::new(2020);
    let mut input = Sdr::new(&[32, 32]).unwrap();
    let mut active1 = Sdr::new(&[64, 64]).unwrap();
    let mut active2 = Sdr::new(&[64, 64]).unwrap();

    let mut diverged = false;
    for _ in 0..10 {
        input.randomize(0.05, &mut rng);
        sp1.compute(&input, true, &mut active1).unwrap();
        sp2.compute(&input, true, &mut active2).unwrap();
        if active1.get_sparse() != active2.get_sparse() {
            diverged = true;
        }
    }
    assert!(diverged);
}

#[test]
fn spatial_pooler_local_inhibition_stays_sparse() {
    let mut sp = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![64],
        column_dimensions: vec![128],
        potential_radius: 16,
        global_inhibition: false,
        wrap_around: true,
        local_area_density: 0.1,
        ..Default::default()
    })
    .unwrap();

    let mut rng = Random::new(9);
    let mut input = Sdr::new(&[64]).unwrap();
    let mut active = Sdr::new(&[128]).unwrap();

    for _ in 0..30 {
        input.randomize(0.1, &mut rng);
        sp.compute(&input, true, &mut active).unwrap();

        let sparsity = active.get_sparsity();
        assert!(
            sparsity <= 0.5,
            "local inhibition failed to stay sparse: {sparsity}"
        );
    }
}

#[test]
fn duty_cycles_converge_for_stable_input() {
    let mut sp = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![100],
        column_dimensions: vec![200],
        potential_radius: 50,
        duty_cycle_period: 10,
        boost_strength: 0.0,
        ..Default::default()
    })
    .unwrap();

    let mut input = Sdr::new(&[100]).unwrap();
    let mut active = Sdr::new(&[200]).unwrap();
    input.set_sparse(&[2, 12, 22, 32, 42]).unwrap();

    for _ in 0..100 {
        sp.compute(&input, true, &mut active).unwrap();
        // Default density 0.05 over 200 columns: exactly 10 winners.
        assert_eq!(active.get_sum(), 10);
    }

    // The duty cycles integrate to the per-step activity count, and no
    // column exceeds a duty cycle of one.
    let total: f32 = sp.active_duty_cycles().iter().sum();
    assert!((total - 10.0).abs() < 1e-2, "total duty {total}");
    for &duty_cycle in sp.active_duty_cycles() {
        assert!((0.0..=1.0 + 1e-6).contains(&duty_cycle));
    }

    // Columns active every recent step dominate the duty-cycle table.
    let best = sp
        .active_duty_cycles()
        .iter()
        .copied()
        .fold(0.0_f32, f32::max);
    assert!(best > 0.95, "best duty cycle {best}");
}

#[test]
fn metrics_observe_spatial_pooler_output() {
    let mut sp = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![100],
        column_dimensions: vec![400],
        potential_radius: 50,
        local_area_density: 0.05,
        ..Default::default()
    })
    .unwrap();

    let mut rng = Random::new(11);
    let mut input = Sdr::new(&[100]).unwrap();
    let mut active = Sdr::new(&[400]).unwrap();
    let metrics = Metrics::new(&active, 20).unwrap();

    for _ in 0..50 {
        input.randomize(0.1, &mut rng);
        sp.compute(&input, true, &mut active).unwrap();
    }

    assert_eq!(metrics.sparsity.num_samples(), 50);
    assert!((metrics.sparsity.mean() - 0.05).abs() < 0.01);
    assert!(metrics.overlap.num_samples() > 0);

    let report = format!("{metrics}");
    assert!(report.contains("Sparsity"));
    assert!(report.contains("Entropy"));
}

#[test]
fn mixed_object_stream_concatenation() {
    let mut input = Sdr::new(&[50]).unwrap();
    input.set_sparse(&[1, 2, 3]).unwrap();

    let mut sp = SpatialPooler::new(SpatialPoolerParams {
        input_dimensions: vec![50],
        column_dimensions: vec![100],
        potential_radius: 20,
        seed: 5,
        ..Default::default()
    })
    .unwrap();
    let mut active = Sdr::new(&[100]).unwrap();
    sp.compute(&input, true, &mut active).unwrap();

    // One stream holding an SDR, an SP, and another SDR.
    let mut stream = Vec::new();
    input.save_stream(&mut stream).unwrap();
    sp.save_stream(&mut stream).unwrap();
    active.save_stream(&mut stream).unwrap();

    let mut reader = &stream[..];
    let input2 = Sdr::load_stream(&mut reader).unwrap();
    let mut sp2 = SpatialPooler::load_stream(&mut reader).unwrap();
    let active2 = Sdr::load_stream(&mut reader).unwrap();
    assert!(reader.is_empty());

    assert_eq!(input, input2);
    assert_eq!(active, active2);
    assert_eq!(sp, sp2);

    // The restored pooler picks up exactly where the original left off.
    let mut next1 = Sdr::new(&[100]).unwrap();
    let mut next2 = Sdr::new(&[100]).unwrap();
    sp.compute(&input, true, &mut next1).unwrap();
    sp2.compute(&input2, true, &mut next2).unwrap();
    assert_eq!(next1.get_sparse(), next2.get_sparse());
}

#[test]
fn in_place_mutation_commits_and_notifies() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut sdr = Sdr::new(&[10, 10]).unwrap();
    let notifications = Rc::new(Cell::new(0));
    let n = Rc::clone(&notifications);
    sdr.add_callback(Box::new(move || n.set(n.get() + 1)));

    {
        let mut dense = sdr.get_dense_mut();
        dense[15] = 1;
        dense[85] = 1;
    }
    sdr.set_dense_inplace();

    assert_eq!(notifications.get(), 1);
    assert_eq!(sdr.get_sparse(), vec![15, 85]);

    {
        let mut sparse = sdr.get_sparse_mut();
        sparse.clear();
        sparse.push(3);
    }
    sdr.set_sparse_inplace().unwrap();

    assert_eq!(notifications.get(), 2);
    assert_eq!(sdr.get_sum(), 1);
}
