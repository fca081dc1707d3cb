use mcgenir::callbacks::{CollectingRecorder, SinkRecorder};
use mcgenir::core::{Error, Integrand};
use mcgenir::generators::unweighted::{GeneratorState, UnweightedGenerator};

use rand_pcg::Pcg64;

fn rng() -> Pcg64 {
    let _ = env_logger::builder().is_test(true).try_init();
    Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
}

struct One;

impl Integrand<f64> for One {
    fn call(&self, _: &[f64]) -> f64 {
        1.0
    }

    fn dim(&self) -> usize {
        1
    }
}

struct Linear;

impl Integrand<f64> for Linear {
    // density 2x on [0,1); events drawn from it have mean 2/3
    fn call(&self, x: &[f64]) -> f64 {
        2.0 * x[0]
    }

    fn dim(&self) -> usize {
        1
    }
}

#[test]
fn uniform_distribution_is_recovered() {
    let mut generator = UnweightedGenerator::new(One, rng(), 10, 100).unwrap();
    let mut recorder = CollectingRecorder::new();
    generator.generate(2_000, &mut recorder).unwrap();

    let mut xs: Vec<f64> = recorder.events().iter().map(|(x, _)| x[0]).collect();
    assert_eq!(xs.len(), 2_000);
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());

    // two-sided Kolmogorov-Smirnov statistic against Uniform(0,1)
    let n = xs.len() as f64;
    let mut d = 0.0_f64;
    for (i, x) in xs.iter().enumerate() {
        let above = (i + 1) as f64 / n - x;
        let below = x - i as f64 / n;
        d = d.max(above.max(below));
    }

    // critical value at significance 0.01
    let critical = 1.628 / n.sqrt();
    assert!(
        d < critical,
        "KS statistic {} exceeds the critical value {}",
        d,
        critical
    );
}

#[test]
fn linear_density_is_recovered_through_corrections() {
    // a single preparation point per cell underestimates every cell maximum,
    // so this run exercises breaches and correction cycles heavily; the
    // emitted events must still follow the density
    let mut generator = UnweightedGenerator::new(Linear, rng(), 10, 1).unwrap();
    let mut recorder = CollectingRecorder::new();
    generator.generate(4_000, &mut recorder).unwrap();

    let mean = recorder.events().iter().map(|(x, _)| x[0]).sum::<f64>() / 4_000.0;
    assert!(
        (mean - 2.0 / 3.0).abs() < 0.03,
        "sample mean {} too far from 2/3",
        mean
    );
}

#[test]
fn recorded_weights_match_a_reevaluation() {
    // the recorder receives the exact accepted point and the weight that
    // admitted it
    let mut generator = UnweightedGenerator::new(Linear, rng(), 10, 10).unwrap();
    let mut recorder = CollectingRecorder::new();
    generator.generate(100, &mut recorder).unwrap();

    for (x, weight) in recorder.events() {
        assert_eq!(*weight, Linear.call(x));
        assert!(*weight > 0.0);
    }
}

#[test]
fn generation_can_be_resumed_between_batches() {
    let mut generator = UnweightedGenerator::new(Linear, rng(), 10, 10).unwrap();
    let mut recorder = CollectingRecorder::new();

    generator.generate(50, &mut recorder).unwrap();
    generator.generate(50, &mut recorder).unwrap();

    assert_eq!(recorder.events().len(), 100);
    assert_eq!(generator.events_generated(), 100);
}

#[test]
fn independent_streams_can_be_merged() {
    // horizontal scaling: two generators with different seeds produce
    // independent, individually correct streams
    let mut first = UnweightedGenerator::new(One, Pcg64::new(1, 11), 10, 50).unwrap();
    let mut second = UnweightedGenerator::new(One, Pcg64::new(2, 13), 10, 50).unwrap();

    let mut merged = CollectingRecorder::new();
    first.generate(500, &mut merged).unwrap();
    second.generate(500, &mut merged).unwrap();

    assert_eq!(merged.events().len(), 1_000);
    let mean = merged.events().iter().map(|(x, _)| x[0]).sum::<f64>() / 1_000.0;
    assert!((mean - 0.5).abs() < 0.05);
}

#[test]
fn dimension_cap_fails_before_any_evaluation() {
    struct Unevaluatable;

    impl Integrand<f64> for Unevaluatable {
        fn call(&self, _: &[f64]) -> f64 {
            panic!("the integrand must not be evaluated");
        }

        fn dim(&self) -> usize {
            16
        }
    }

    match UnweightedGenerator::new(Unevaluatable, rng(), 3, 10) {
        Err(Error::DimensionTooLarge { dim: 16, .. }) => {}
        _ => panic!("expected a dimension error"),
    }
}

#[test]
fn correction_state_is_observable() {
    struct Steep;

    impl Integrand<f64> for Steep {
        fn call(&self, x: &[f64]) -> f64 {
            0.1 + x[0].powi(8)
        }

        fn dim(&self) -> usize {
            1
        }
    }

    let mut generator = UnweightedGenerator::new(Steep, rng(), 10, 1).unwrap();
    let mut recorder = SinkRecorder {};

    let mut corrections = 0;
    let mut accepted = 0;
    while accepted < 1_000 {
        if generator.generate_one(&mut recorder).unwrap() {
            accepted += 1;
        }
        if let GeneratorState::Correcting(pending) = generator.state() {
            corrections += 1;
            // corrections are always owed to the cell that breached, with
            // finite debt
            assert!(pending.cell() < generator.grid().cells());
            assert!(pending.debt().is_finite());
        }
    }

    assert!(corrections > 0);
}
