use virulence_survival::{
    analysis::{self, ModelKind, ModelSettings},
    design::model_frame,
    km, report, simulation, AssayTable, BayesConfig, BayesWeibullModel, ColumnSpec, CoxModel,
    DesignSpec, FrailtyCoxModel, PiecewiseExponentialModel, SimulationConfig, SurvivalFit,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Virulence Assay Survival Analysis - Walkthrough");
    println!("===============================================\n");

    let columns = ColumnSpec {
        factors: vec!["treatment".to_string(), "temperature".to_string()],
        ..Default::default()
    };
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/virulence_assay.csv");
    let table = AssayTable::from_path(path, &columns)?;

    println!("Assay:");
    println!("  - hosts: {}", table.len());
    println!("  - deaths: {}", table.n_deaths());
    println!("  - clones: {}", table.clones().join(", "));
    println!();

    // Step 1: look at the curves before modelling anything
    println!("Step 1: Kaplan-Meier curves by treatment");
    println!("----------------------------------------");
    let curves = km::survfit(&table, &["treatment".to_string()], 0.95)?;
    print!("{}", report::render_curves(&curves));
    println!();

    // Step 2: hosts infected by the same clone are not independent
    println!("Step 2: Cox models, with and without the clone structure");
    println!("--------------------------------------------------------");
    let data = model_frame(&table, &DesignSpec::default())?;

    let naive = CoxModel::new().fit(&data)?;
    let robust = CoxModel::new().with_robust_variance(true).fit(&data)?;
    let frailty = FrailtyCoxModel::new().fit(&data)?;

    let mut rows = naive.tidy();
    rows.extend(robust.tidy());
    rows.extend(frailty.tidy());
    print!("{}", report::render_estimates(&rows));
    println!();
    println!("  clone variance (theta): {:.4}", frailty.theta());
    let (lrt, p) = frailty.likelihood_ratio_test();
    println!("  test of theta = 0: LRT = {:.3}, p = {:.4}", lrt, p);
    println!();

    // Step 3: the same hazard ratios from a poisson model on split data
    println!("Step 3: Piecewise exponential model, 12-hour intervals");
    println!("------------------------------------------------------");
    let cuts: Vec<f64> = (1..=6).map(|k| 12.0 * k as f64).collect();
    let pwe = PiecewiseExponentialModel::new().with_cuts(cuts).fit(&data)?;
    print!("{}", report::render_estimates(&pwe.tidy()));
    for interval in pwe.intervals() {
        println!(
            "  ({:>4.0}, {:>4.0}]  deaths {:>3}  hazard {:.5}",
            interval.start, interval.end, interval.deaths, interval.hazard
        );
    }
    println!();

    // Step 4: bayesian weibull with a clone intercept
    println!("Step 4: Bayesian Weibull model");
    println!("------------------------------");
    let config = BayesConfig { chains: 4, warmup: 500, draws: 500, ..Default::default() };
    let bayes = BayesWeibullModel::new(config).fit(&data)?;
    for s in bayes.summaries() {
        println!(
            "  {:<18} mean {:>8.4}  sd {:>7.4}  95% [{:>8.4}, {:>8.4}]  R-hat {:.3}",
            s.parameter, s.mean, s.sd, s.q025, s.q975, s.r_hat
        );
    }
    println!();

    // Step 5: model comparison
    println!("Step 5: Fit statistics");
    println!("----------------------");
    let kinds = [ModelKind::Cox, ModelKind::Frailty, ModelKind::Piecewise];
    let comparison = analysis::compare(&data, &kinds, &ModelSettings::default())?;
    print!("{}", report::render_metrics(&comparison.metrics));
    println!();

    // Step 6: what pseudoreplication does to coverage
    println!("Step 6: Simulation - coverage of the treatment effect");
    println!("-----------------------------------------------------");
    let sim = SimulationConfig { replicates: 100, ..Default::default() };
    let results = simulation::run(&sim, &ModelSettings::default())?;
    print!("{}", report::render_summaries(&simulation::summarize(&results, sim.effect)));

    Ok(())
}
