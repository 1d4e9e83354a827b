use virulence_survival::{
    analysis::{self, ModelKind, ModelSettings},
    design::model_frame,
    km, simulation, AssayTable, ColumnSpec, CoxModel, DesignSpec, FrailtyCoxModel,
    PiecewiseExponentialModel, SimulationConfig, SurvivalData, SurvivalFit, Ties,
};
use ndarray::{Array1, Array2};
use approx::assert_relative_eq;

const ASSAY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/virulence_assay.csv");

fn two_factor_columns() -> ColumnSpec {
    ColumnSpec {
        factors: vec!["treatment".into(), "temperature".into()],
        ..Default::default()
    }
}

fn create_synthetic_data(n_samples: usize, n_features: usize, seed: u64) -> SurvivalData {
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    let mut rng = StdRng::seed_from_u64(seed);

    let mut covariates_vec = Vec::with_capacity(n_samples * n_features);
    for _ in 0..(n_samples * n_features) {
        covariates_vec.push(rng.gen_range(-2.0..2.0));
    }
    let covariates = Array2::from_shape_vec((n_samples, n_features), covariates_vec).unwrap();

    // only the first 3 features matter
    let true_coefficients = Array1::from(vec![0.5, -0.3, 0.2]);

    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let linear_pred: f64 = covariates.row(i).slice(ndarray::s![0..3]).dot(&true_coefficients);
        let time = -(1.0 - rng.gen::<f64>()).ln() / (0.1 * linear_pred.exp());
        let censoring_time = rng.gen_range(1.0..20.0);

        if time < censoring_time {
            times.push(time);
            events.push(true);
        } else {
            times.push(censoring_time);
            events.push(false);
        }
    }

    SurvivalData::new(times, events, covariates).unwrap()
}

#[test]
fn test_cox_recovers_coefficients() {
    let data = create_synthetic_data(600, 4, 42);
    let fit = CoxModel::new().fit(&data).unwrap();

    let beta = fit.coefficients();
    let truth = [0.5, -0.3, 0.2, 0.0];
    for (b, t) in beta.iter().zip(truth) {
        assert!((b - t).abs() < 0.2, "estimate {} vs truth {}", b, t);
    }

    let (lrt, df, p) = fit.likelihood_ratio_test();
    assert_eq!(df, 4);
    assert!(lrt > 0.0);
    assert!(p < 1e-6);
}

#[test]
fn test_predicted_survival_is_monotone() {
    let data = create_synthetic_data(200, 3, 7);
    let fit = CoxModel::new().fit(&data).unwrap();

    let grid = Array1::from(vec![0.5, 1.0, 2.0, 5.0, 10.0]);
    let hosts = data.covariates().slice(ndarray::s![0..5, ..]).to_owned();
    let survival = fit.predict_survival(hosts.view(), grid.view()).unwrap();

    for row in survival.rows() {
        for k in 1..row.len() {
            assert!(row[k] <= row[k - 1] + 1e-12);
        }
        assert!(row.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }
}

#[test]
fn test_assay_to_cox_pipeline() {
    let table = AssayTable::from_path(ASSAY, &two_factor_columns()).unwrap();
    assert_eq!(table.len(), 96);
    assert_eq!(table.clones().len(), 8);

    let data = model_frame(&table, &DesignSpec::default()).unwrap();
    assert_eq!(data.term_names(), &["treatmentevolved".to_string(), "temperature37C".to_string()]);

    let naive = CoxModel::new().fit(&data).unwrap();
    let robust = CoxModel::new().with_robust_variance(true).fit(&data).unwrap();

    // same point estimate, different uncertainty
    for (a, b) in naive.coefficients().iter().zip(robust.coefficients().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }
    assert!(naive.standard_errors().iter().all(|se| *se > 0.0));
    assert!(robust.standard_errors().iter().all(|se| *se > 0.0));
    assert!((naive.standard_errors()[0] - robust.standard_errors()[0]).abs() > 1e-6);

    let rows = robust.tidy();
    assert_eq!(rows[0].model, "coxph_robust");
    assert!(rows.iter().all(|r| r.conf_low < r.estimate && r.estimate < r.conf_high));
}

#[test]
fn test_kaplan_meier_on_assay() {
    let table = AssayTable::from_path(ASSAY, &two_factor_columns()).unwrap();
    let curves = km::survfit(&table, &["treatment".to_string()], 0.95).unwrap();

    let labels: Vec<&str> = curves.strata.iter().map(|(l, _)| l.as_str()).collect();
    assert_eq!(labels, vec!["treatment=ancestor", "treatment=evolved"]);

    for (_, curve) in &curves.strata {
        assert_eq!(curve.n, 48);
        for pair in curve.steps.windows(2) {
            assert!(pair[1].survival <= pair[0].survival);
        }
    }

    let test = curves.log_rank.as_ref().unwrap();
    assert_eq!(test.df, 1);
    assert_relative_eq!(
        test.observed.iter().sum::<f64>(),
        test.expected.iter().sum::<f64>(),
        epsilon = 1e-9
    );

    let points = curves.points();
    assert!(points.iter().filter(|p| p.time == 0.0).count() == 2);
}

#[test]
fn test_piecewise_matches_breslow_cox() {
    let table = AssayTable::from_path(ASSAY, &two_factor_columns()).unwrap();
    let data = model_frame(&table, &DesignSpec::default()).unwrap();

    let cox = CoxModel::new().with_ties(Ties::Breslow).fit(&data).unwrap();
    let pwe = PiecewiseExponentialModel::new().fit(&data).unwrap();
    for (a, b) in cox.coefficients().iter().zip(pwe.coefficients().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }
    for (a, b) in cox.standard_errors().iter().zip(pwe.standard_errors().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
}

#[test]
fn test_frailty_on_assay() {
    let table = AssayTable::from_path(ASSAY, &two_factor_columns()).unwrap();
    let data = model_frame(&table, &DesignSpec::default()).unwrap();

    let fit = FrailtyCoxModel::new().fit(&data).unwrap();
    assert!(fit.theta() > 0.0);
    assert_eq!(fit.clone_effects().len(), 8);

    let (stat, p) = fit.likelihood_ratio_test();
    assert!(stat >= 0.0);
    assert!((0.0..=0.5).contains(&p));

    let rows = fit.tidy();
    assert_eq!(rows.last().unwrap().term, "sd(clone)");
    assert_eq!(fit.fit_statistics().n_parameters, 3);
}

#[test]
fn test_compare_reports_every_model() {
    let table = AssayTable::from_path(ASSAY, &ColumnSpec::default()).unwrap();
    let data = model_frame(&table, &DesignSpec::default()).unwrap();

    let kinds = [ModelKind::Cox, ModelKind::CoxRobust, ModelKind::Frailty, ModelKind::Piecewise];
    let comparison = analysis::compare(&data, &kinds, &ModelSettings::default()).unwrap();

    let names: Vec<&str> = comparison.metrics.iter().map(|m| m.model.as_str()).collect();
    assert_eq!(names, vec!["coxph", "coxph_robust", "coxme", "pwe"]);
    for m in &comparison.metrics {
        let c = m.c_index.unwrap();
        assert!(c > 0.5 && c < 1.0, "{}: c-index {}", m.model, c);
        assert!(m.aic.is_some());
    }
    // treatment row from each model, plus the frailty sd
    assert_eq!(comparison.estimates.len(), 5);
}

#[test]
fn test_simulation_is_reproducible() {
    let config = SimulationConfig {
        n_clones: 6,
        hosts_per_clone: 6,
        replicates: 8,
        seed: 99,
        models: vec![ModelKind::Cox, ModelKind::CoxRobust],
        ..Default::default()
    };
    let settings = ModelSettings::default();

    let first = simulation::run(&config, &settings).unwrap();
    let second = simulation::run(&config, &settings).unwrap();
    assert_eq!(first.estimates, second.estimates);

    let summaries = simulation::summarize(&first, config.effect);
    assert_eq!(summaries.len(), 2);
    for s in &summaries {
        assert_eq!(s.replicates + s.failures, 8);
        assert!((0.0..=1.0).contains(&s.coverage));
    }
    // robust and naive share the point estimate
    assert_relative_eq!(summaries[0].mean_estimate, summaries[1].mean_estimate, epsilon = 1e-12);
}
