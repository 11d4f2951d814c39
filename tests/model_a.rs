use curation_harness::models::model_a::{alphas_from_omega, Pattern};
use curation_harness::{
    AnnotationMatrix, AnnotationModel, AnyModel, FitConfig, FitOptions, ModelA, ModelError,
    ModelKind, RunOrchestrator, SamplerConfig, MISSING,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const THETA: [f64; 5] = [0.9, 0.8, 0.75, 0.85, 0.7];

fn truth() -> ModelA {
    let omega = vec![0.25; 4];
    let alpha = alphas_from_omega(&omega);
    ModelA::new(THETA.to_vec(), omega, alpha, false).unwrap()
}

#[test]
fn pattern_of_reads_agreement_left_to_right() {
    assert_eq!(Pattern::of([2, 2, 2]), Pattern::Aaa);
    assert_eq!(Pattern::of([2, 2, 0]), Pattern::Aab);
    assert_eq!(Pattern::of([2, 0, 2]), Pattern::Aba);
    assert_eq!(Pattern::of([0, 2, 2]), Pattern::Abb);
    assert_eq!(Pattern::of([0, 1, 2]), Pattern::Abc);
}

#[test]
fn derived_alphas_for_uniform_base_rates() {
    let alpha = alphas_from_omega(&[0.25; 4]);
    let q: f64 = 1.0 / 3.0;
    assert!((alpha[0] - q).abs() < 1e-12);
    assert!((alpha[3] - q * q).abs() < 1e-12);
    assert!((alpha[4] - q * (1.0 - q)).abs() < 1e-12);
    // Two classes: wrong annotators can only agree.
    let binary = alphas_from_omega(&[0.5, 0.5]);
    assert!((binary[0] - 1.0).abs() < 1e-12);
    assert!((binary[3] - 1.0).abs() < 1e-12);
}

#[test]
fn model_a_requires_three_annotators_and_two_classes() {
    let mut rng = StdRng::seed_from_u64(0);
    assert!(matches!(
        ModelA::create_initial_state(3, 2, false, &mut rng),
        Err(ModelError::InvalidDimension { what: "nannotators", .. })
    ));
    assert!(matches!(
        ModelA::create_initial_state(1, 4, false, &mut rng),
        Err(ModelError::InvalidDimension { what: "nclasses", .. })
    ));
}

#[test]
fn model_a_generates_loop_design() {
    let model = truth();
    let mut rng = StdRng::seed_from_u64(1);
    let labels = model.generate_labels(50, &mut rng);
    let data = model.generate_annotations(&labels, &mut rng).unwrap();
    for (i, row) in data.rows().enumerate() {
        let observed: Vec<usize> = row
            .iter()
            .enumerate()
            .filter(|(_, &x)| x != MISSING)
            .map(|(j, _)| j)
            .collect();
        let mut expected = vec![i % 5, (i + 1) % 5, (i + 2) % 5];
        expected.sort_unstable();
        assert_eq!(observed, expected, "item {i}");
    }
}

#[test]
fn model_a_rejects_items_outside_triplet_design() {
    let model = truth();
    let data = AnnotationMatrix::new(
        vec![
            vec![0, 1, 2, MISSING, MISSING],
            vec![0, 1, MISSING, MISSING, MISSING],
        ],
        4,
    )
    .unwrap();
    assert!(matches!(
        model.log_likelihood(&data),
        Err(ModelError::InvalidAnnotations(_))
    ));

    let crowded = AnnotationMatrix::new(vec![vec![0, 1, 2, 3, MISSING]], 4).unwrap();
    assert!(matches!(
        model.log_likelihood(&crowded),
        Err(ModelError::InvalidAnnotations(_))
    ));
}

#[test]
fn model_a_orchestrated_mle_recovers_accuracies() {
    let truth = truth();
    let mut rng = StdRng::seed_from_u64(29);
    let labels = truth.generate_labels(6_000, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let orchestrator = RunOrchestrator::new(FitConfig {
        model: ModelKind::A,
        number_of_runs: 4,
        use_priors: false,
        seed: 11,
        ..Default::default()
    })
    .unwrap();
    let outcome = orchestrator.run(&data, None).unwrap();
    for ll in outcome.run_log_likelihoods() {
        assert!(outcome.best_log_likelihood >= ll);
    }
    let AnyModel::A(fitted) = &outcome.best_model else {
        panic!("expected a Model A fit");
    };
    assert!(fitted.satisfies_simplex_constraints());
    for (got, want) in fitted.theta().iter().zip(THETA) {
        assert!((got - want).abs() < 0.05, "theta {got} vs {want}");
    }
    // Base rates are taken from the data.
    for w in fitted.omega() {
        assert!((w - 0.25).abs() < 0.03);
    }
}

#[test]
fn model_a_explicit_alphas_stay_valid_after_map() {
    let truth = truth();
    let mut rng = StdRng::seed_from_u64(31);
    let labels = truth.generate_labels(1_500, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let mut model = ModelA::create_initial_state(4, 5, true, &mut rng).unwrap();
    assert!(model.explicit_alphas());
    let report = model.map(&data, &FitOptions::default(), None).unwrap();
    assert!(report.log_likelihood.is_finite());
    assert!(model.satisfies_simplex_constraints());
    let alpha = model.alpha();
    assert_eq!(alpha.len(), 7);
    assert_eq!(alpha[0], alpha[1]);
    assert_eq!(alpha[1], alpha[2]);
    assert_eq!(alpha[4], alpha[6]);
    assert_eq!(model.parameter_count(), 5 + 3);
}

#[test]
fn model_a_posterior_draws_cover_accuracies_and_free_alphas() {
    let truth = truth();
    let mut rng = StdRng::seed_from_u64(37);
    let labels = truth.generate_labels(600, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let mut model = ModelA::create_initial_state(4, 5, true, &mut rng).unwrap();
    model.map(&data, &FitOptions::default(), None).unwrap();
    let cfg = SamplerConfig {
        n_iterations: 150,
        step_optimization_block_size: 100,
        adjust_step_every: 50,
        ..Default::default()
    };
    let samples = model
        .sample_posterior_over_accuracy(&data, &cfg, &mut rng, None)
        .unwrap();
    assert_eq!(samples.len(), 150);
    assert_eq!(samples.names.len(), 8);
    assert!(samples
        .draws
        .iter()
        .all(|d| d.len() == 8 && d.iter().all(|v| (0.0..=1.0).contains(v))));
}

#[test]
fn model_a_label_posteriors_are_distributions() {
    let model = truth();
    let mut rng = StdRng::seed_from_u64(41);
    let labels = model.generate_labels(200, &mut rng);
    let data = model.generate_annotations(&labels, &mut rng).unwrap();
    let posteriors = model.infer_labels(&data).unwrap();
    assert_eq!(posteriors.len(), 200);
    for row in posteriors {
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}

#[test]
fn model_a_fit_commits_base_rates_only_on_success() {
    let omega = vec![0.7, 0.1, 0.1, 0.1];
    let alpha = alphas_from_omega(&omega);
    let mut model = ModelA::new(THETA.to_vec(), omega.clone(), alpha.clone(), false).unwrap();

    // Balanced classes, but one item outside the triplet design.
    let bad = AnnotationMatrix::new(
        vec![
            vec![0, 1, 2, MISSING, MISSING],
            vec![3, 3, MISSING, MISSING, MISSING],
        ],
        4,
    )
    .unwrap();
    assert!(model.mle(&bad, &FitOptions::default(), None).is_err());
    assert_eq!(model.omega(), omega.as_slice());
    assert_eq!(model.alpha(), alpha.as_slice());
    assert_eq!(model.theta(), THETA.as_slice());

    let mut rng = StdRng::seed_from_u64(43);
    let labels = truth().generate_labels(400, &mut rng);
    let data = truth().generate_annotations(&labels, &mut rng).unwrap();
    model.mle(&data, &FitOptions::default(), None).unwrap();
    let observed = data.class_frequencies().unwrap();
    assert_eq!(model.omega(), observed.as_slice());
    assert_eq!(model.alpha(), alphas_from_omega(&observed).as_slice());
}
