use curation_harness::{
    AnnotationMatrix, AnnotationModel, EmConfig, FitOptions, ModelB, ModelBPriors, ModelError,
    StopReason, MISSING,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const K: usize = 4;
const J: usize = 6;

fn true_model() -> ModelB {
    let pi = vec![0.25; K];
    let theta: Vec<Vec<Vec<f64>>> = (0..J)
        .map(|j| {
            // Slightly different accuracies per annotator.
            let diag = 0.8 + 0.02 * j as f64;
            let off = (1.0 - diag) / (K - 1) as f64;
            (0..K)
                .map(|k| (0..K).map(|m| if m == k { diag } else { off }).collect())
                .collect()
        })
        .collect();
    ModelB::new(pi, theta).unwrap()
}

fn tight_options() -> FitOptions {
    FitOptions {
        em: EmConfig {
            epsilon: 1e-8,
            max_epochs: 2_000,
        },
        ..Default::default()
    }
}

/// MAP estimate computed from the true labels (complete data).
fn complete_data_map(
    labels: &[usize],
    data: &AnnotationMatrix,
    priors: &ModelBPriors,
) -> (Vec<f64>, Vec<Vec<Vec<f64>>>) {
    let mut class_counts = vec![0.0; K];
    let mut co = vec![vec![vec![0.0; K]; K]; J];
    for (i, &l) in labels.iter().enumerate() {
        class_counts[l] += 1.0;
        for j in 0..J {
            if let Some(m) = data.get(i, j) {
                co[j][l][m] += 1.0;
            }
        }
    }
    let pi_num: Vec<f64> = (0..K).map(|k| class_counts[k] + priors.beta[k] - 1.0).collect();
    let pi_den: f64 = pi_num.iter().sum();
    let pi = pi_num.iter().map(|v| v / pi_den).collect();
    let theta: Vec<Vec<Vec<f64>>> = co
        .iter()
        .map(|annotator| {
            annotator
                .iter()
                .enumerate()
                .map(|(k, row)| {
                    let num: Vec<f64> = row
                        .iter()
                        .enumerate()
                        .map(|(m, c)| c + priors.alpha[k][m] - 1.0)
                        .collect();
                    let den: f64 = num.iter().sum();
                    num.iter().map(|v| v / den).collect()
                })
                .collect()
        })
        .collect();
    (pi, theta)
}

#[test]
fn model_b_generate_labels_matches_class_prior() {
    let model = true_model();
    let mut rng = StdRng::seed_from_u64(1);
    let labels = model.generate_labels(10_000, &mut rng);
    for k in 0..K {
        let freq = labels.iter().filter(|&&l| l == k).count() as f64 / labels.len() as f64;
        assert!((freq - 0.25).abs() < 0.02, "class {k}: {freq}");
    }
}

#[test]
fn model_b_initial_state_satisfies_simplex_constraints() {
    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..20 {
        let model = ModelB::create_initial_state(K, J, None, &mut rng).unwrap();
        assert!(model.satisfies_simplex_constraints());
        assert_eq!(model.theta().len(), J);
    }
}

#[test]
fn model_b_rejects_invalid_dimensions_and_parameters() {
    let mut rng = StdRng::seed_from_u64(3);
    assert!(matches!(
        ModelB::create_initial_state(0, 3, None, &mut rng),
        Err(ModelError::InvalidDimension { what: "nclasses", .. })
    ));
    assert!(matches!(
        ModelB::create_initial_state(3, 0, None, &mut rng),
        Err(ModelError::InvalidDimension { what: "nannotators", .. })
    ));
    assert!(matches!(
        ModelB::new(vec![0.6, 0.6], vec![vec![vec![0.5, 0.5], vec![0.5, 0.5]]]),
        Err(ModelError::InvalidParameters(_))
    ));
}

#[test]
fn model_b_map_recovers_complete_data_estimate() {
    let truth = true_model();
    let mut rng = StdRng::seed_from_u64(42);
    let labels = truth.generate_labels(10_000, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let mut fitted = ModelB::create_initial_state(K, J, None, &mut rng).unwrap();
    let report = fitted.map(&data, &tight_options(), None).unwrap();
    assert_eq!(report.stop_reason, StopReason::Converged);
    assert!(fitted.satisfies_simplex_constraints());

    let (pi, theta) = complete_data_map(&labels, &data, fitted.priors());
    for k in 0..K {
        assert!((fitted.pi()[k] - pi[k]).abs() < 1e-2, "pi[{k}]");
    }
    for j in 0..J {
        for k in 0..K {
            for m in 0..K {
                let got = fitted.theta()[j][k][m];
                assert!(
                    (got - theta[j][k][m]).abs() < 1e-2,
                    "theta[{j}][{k}][{m}] = {got}, expected {}",
                    theta[j][k][m]
                );
                // And close to the generating value.
                assert!((got - truth.theta()[j][k][m]).abs() < 0.05);
            }
        }
    }
}

#[test]
fn model_b_mle_from_perturbed_truth_returns_near_truth() {
    let truth = true_model();
    let mut rng = StdRng::seed_from_u64(7);
    let labels = truth.generate_labels(10_000, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let noise = Normal::new(0.0, 0.02).unwrap();
    let perturb = |row: &[f64], rng: &mut StdRng| -> Vec<f64> {
        let mut out: Vec<f64> = row
            .iter()
            .map(|v| (v + noise.sample(rng)).max(1e-3))
            .collect();
        let total: f64 = out.iter().sum();
        out.iter_mut().for_each(|v| *v /= total);
        out
    };
    let pi = perturb(truth.pi(), &mut rng);
    let theta: Vec<Vec<Vec<f64>>> = truth
        .theta()
        .iter()
        .map(|a| a.iter().map(|row| perturb(row, &mut rng)).collect())
        .collect();
    let mut model = ModelB::new(pi, theta).unwrap();
    model.mle(&data, &FitOptions::default(), None).unwrap();

    assert!(model.satisfies_simplex_constraints());
    for k in 0..K {
        assert!((model.pi()[k] - truth.pi()[k]).abs() < 0.1);
    }
    for j in 0..J {
        for k in 0..K {
            for m in 0..K {
                assert!((model.theta()[j][k][m] - truth.theta()[j][k][m]).abs() < 0.1);
            }
        }
    }
}

#[test]
fn model_b_em_objective_is_non_decreasing() {
    let mut rng = StdRng::seed_from_u64(11);
    let truth = ModelB::create_initial_state(3, 4, None, &mut rng).unwrap();
    let labels = truth.generate_labels(500, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    for use_map in [false, true] {
        let mut model = ModelB::create_initial_state(3, 4, None, &mut rng).unwrap();
        let report = if use_map {
            model.map(&data, &tight_options(), None).unwrap()
        } else {
            model.mle(&data, &tight_options(), None).unwrap()
        };
        assert!(report.trace.len() >= 2);
        for w in report.trace.windows(2) {
            assert!(w[1] >= w[0] - 1e-9 * w[0].abs(), "{} then {}", w[0], w[1]);
        }
        let ll = model.log_likelihood(&data).unwrap();
        assert!((ll - report.log_likelihood).abs() < 1e-9 * ll.abs());
    }
}

#[test]
fn model_b_max_epochs_is_reported_not_fatal() {
    let truth = true_model();
    let mut rng = StdRng::seed_from_u64(5);
    let labels = truth.generate_labels(300, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();
    let mut model = ModelB::create_initial_state(K, J, None, &mut rng).unwrap();
    let opts = FitOptions {
        em: EmConfig {
            epsilon: 1e-12,
            max_epochs: 2,
        },
        ..Default::default()
    };
    let report = model.map(&data, &opts, None).unwrap();
    assert_eq!(report.stop_reason, StopReason::MaxIterations);
    assert_eq!(report.iterations, 2);
    assert!(model.satisfies_simplex_constraints());
}

#[test]
fn model_b_fit_rejects_all_missing_row() {
    let data = AnnotationMatrix::new(
        vec![vec![0, 1], vec![MISSING, MISSING], vec![1, 1]],
        2,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let mut model = ModelB::create_initial_state(2, 2, None, &mut rng).unwrap();
    let err = model.map(&data, &FitOptions::default(), None).unwrap_err();
    assert!(matches!(err, ModelError::DegenerateData(_)));
    assert!(model.satisfies_simplex_constraints());
}

#[test]
fn model_b_rejects_mismatched_annotation_shape() {
    let data = AnnotationMatrix::new(vec![vec![0, 1, 1]], 2).unwrap();
    let mut rng = StdRng::seed_from_u64(10);
    let model = ModelB::create_initial_state(2, 2, None, &mut rng).unwrap();
    assert!(matches!(
        model.log_likelihood(&data),
        Err(ModelError::ShapeMismatch { .. })
    ));
}

#[test]
fn model_b_missing_cells_contribute_nothing() {
    let full = ModelB::new(
        vec![0.3, 0.7],
        vec![
            vec![vec![0.9, 0.1], vec![0.2, 0.8]],
            vec![vec![0.7, 0.3], vec![0.4, 0.6]],
            vec![vec![0.6, 0.4], vec![0.1, 0.9]],
        ],
    )
    .unwrap();
    let reduced = ModelB::new(full.pi().to_vec(), full.theta()[..2].to_vec()).unwrap();

    let with_missing =
        AnnotationMatrix::new(vec![vec![0, 1, MISSING], vec![1, 1, MISSING]], 2).unwrap();
    let without = AnnotationMatrix::new(vec![vec![0, 1], vec![1, 1]], 2).unwrap();
    let a = full.log_likelihood(&with_missing).unwrap();
    let b = reduced.log_likelihood(&without).unwrap();
    assert!((a - b).abs() < 1e-12);
}

#[test]
fn model_b_label_posteriors_identify_true_labels() {
    let truth = true_model();
    let mut rng = StdRng::seed_from_u64(13);
    let labels = truth.generate_labels(1_000, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();
    let posteriors = truth.infer_labels(&data).unwrap();
    assert_eq!(posteriors.len(), labels.len());

    let mut correct = 0;
    for (post, &label) in posteriors.iter().zip(labels.iter()) {
        assert!((post.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        let argmax = post
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        if argmax == label {
            correct += 1;
        }
    }
    assert!(correct as f64 / labels.len() as f64 > 0.95);
}

fn sparse_priors(k: usize) -> ModelBPriors {
    ModelBPriors {
        alpha: vec![vec![0.5; k]; k],
        beta: vec![0.5; k],
    }
}

#[test]
fn model_b_map_with_sparse_dirichlet_priors_stays_finite() {
    let mut rng = StdRng::seed_from_u64(17);
    let truth = ModelB::new(
        vec![0.3, 0.3, 0.4],
        (0..3)
            .map(|_| {
                vec![
                    vec![0.8, 0.1, 0.1],
                    vec![0.1, 0.8, 0.1],
                    vec![0.1, 0.1, 0.8],
                ]
            })
            .collect(),
    )
    .unwrap();
    let labels = truth.generate_labels(50, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    let mut model = ModelB::create_initial_state(3, 3, None, &mut rng)
        .unwrap()
        .with_priors(sparse_priors(3))
        .unwrap();
    let report = model.map(&data, &tight_options(), None).unwrap();
    assert_eq!(report.stop_reason, StopReason::Converged);
    assert!(report.iterations < 2_000);
    assert!(report.objective.is_finite());
    assert!(report.trace.iter().all(|v| v.is_finite()));
    assert!(model.satisfies_simplex_constraints());
    let ll = model.log_likelihood(&data).unwrap();
    assert!(ll.is_finite());
    assert!((ll - report.log_likelihood).abs() < 1e-9 * ll.abs());
    assert!(model.log_prior().is_finite());
}

#[test]
fn model_b_random_state_follows_custom_priors() {
    let priors = ModelBPriors {
        alpha: vec![
            vec![6.0, 2.0, 2.0],
            vec![1.0, 5.0, 4.0],
            vec![3.0, 3.0, 3.0],
        ],
        beta: vec![1.0, 2.0, 3.0],
    };
    let draws = 2_000;
    let mut rng = StdRng::seed_from_u64(19);
    let mut pi_sum = [0.0; 3];
    let mut theta_sum = [[0.0; 3]; 3];
    for _ in 0..draws {
        let model = ModelB::create_initial_state(3, 2, Some(priors.clone()), &mut rng).unwrap();
        assert_eq!(model.priors(), &priors);
        for (acc, p) in pi_sum.iter_mut().zip(model.pi()) {
            *acc += p;
        }
        for annotator in model.theta() {
            for (k, row) in annotator.iter().enumerate() {
                for (m, p) in row.iter().enumerate() {
                    theta_sum[k][m] += p;
                }
            }
        }
    }

    for k in 0..3 {
        let expected = priors.beta[k] / 6.0;
        let mean = pi_sum[k] / draws as f64;
        assert!((mean - expected).abs() < 0.02, "pi[{k}] mean {mean}");
        let row_total: f64 = priors.alpha[k].iter().sum();
        for m in 0..3 {
            let expected = priors.alpha[k][m] / row_total;
            let mean = theta_sum[k][m] / (2 * draws) as f64;
            assert!((mean - expected).abs() < 0.02, "theta[{k}][{m}] mean {mean}");
        }
    }
}

#[test]
fn model_b_rejects_malformed_priors() {
    let mut rng = StdRng::seed_from_u64(21);
    let ragged = ModelBPriors {
        alpha: vec![vec![1.0; 3]; 2],
        beta: vec![1.0; 3],
    };
    assert!(matches!(
        ModelB::create_initial_state(3, 2, Some(ragged), &mut rng),
        Err(ModelError::ShapeMismatch { .. })
    ));
    let mut zero = sparse_priors(2);
    zero.beta[0] = 0.0;
    assert!(matches!(
        ModelB::create_initial_state(2, 2, Some(zero), &mut rng),
        Err(ModelError::InvalidParameters(_))
    ));
}

#[test]
fn model_b_generated_annotations_follow_confusion_rows() {
    let truth = true_model();
    let mut rng = StdRng::seed_from_u64(23);
    let labels = truth.generate_labels(20_000, &mut rng);
    let data = truth.generate_annotations(&labels, &mut rng).unwrap();

    for j in 0..J {
        let mut counts = vec![vec![0.0; K]; K];
        for (i, &l) in labels.iter().enumerate() {
            let m = data.get(i, j).unwrap();
            counts[l][m] += 1.0;
        }
        for k in 0..K {
            let total: f64 = counts[k].iter().sum();
            for m in 0..K {
                let freq = counts[k][m] / total;
                let want = truth.theta()[j][k][m];
                assert!(
                    (freq - want).abs() < 0.03,
                    "P(x={m} | l={k}) for annotator {j}: {freq} vs {want}"
                );
            }
        }
    }
}
