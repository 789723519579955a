use chrono::{Days, NaiveDate};
use futures::stream::{self, StreamExt};
use genetic_portfolio::{
    AssetView, DateWindow, GeneticConfig, GeneticPortfolio, ReturnMatrix, ReturnRow,
};
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::MultivariateNormal;
use std::{fs::File, io::Write, time::Instant};
use tokio::task;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ASSETS: [(&str, f64); 5] = [
    ("PETR4", 0.14),
    ("VALE3", 0.11),
    ("ITUB4", 0.09),
    ("WEGE3", 0.12),
    ("ABEV3", 0.06),
];

/// Draws daily returns from a correlated normal so the experiment needs no market data.
fn synthetic_returns(periods: usize, seed: u64) -> anyhow::Result<ReturnMatrix> {
    let n = ASSETS.len();
    let daily_vol = [0.025, 0.022, 0.016, 0.018, 0.012];
    let correlation = 0.35;
    let covariance = (0..n * n)
        .map(|idx| {
            let (i, j) = (idx / n, idx % n);
            let rho = if i == j { 1. } else { correlation };
            rho * daily_vol[i] * daily_vol[j]
        })
        .collect::<Vec<f64>>();
    let normal = MultivariateNormal::new(vec![0.0004; n], covariance)?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).ok_or_else(|| anyhow::anyhow!("bad date"))?;
    let rows = (0..periods)
        .map(|offset| ReturnRow {
            date: start + Days::new(offset as u64),
            values: normal.sample(&mut rng).iter().map(|r| Some(*r)).collect(),
        })
        .collect();

    let assets = ASSETS.iter().map(|(name, _)| name.to_string()).collect();
    Ok(ReturnMatrix::new(assets, rows)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let returns = synthetic_returns(750, 42)?;
    let views = ASSETS
        .iter()
        .map(|(name, view)| AssetView::new(*name, *view))
        .collect::<Vec<_>>();
    let window = DateWindow::new(
        NaiveDate::from_ymd_opt(2020, 1, 1).ok_or_else(|| anyhow::anyhow!("bad date"))?,
        NaiveDate::from_ymd_opt(2022, 1, 1).ok_or_else(|| anyhow::anyhow!("bad date"))?,
    );
    let base_config = GeneticConfig {
        population_size: 200,
        n_iterations: 150,
        ..GeneticConfig::default()
    };

    info!("Starting experiment over seeds 0..4");
    let start = Instant::now();

    stream::iter(0..4u64)
        .map(|seed| {
            let config = GeneticConfig {
                global_seed: Some(seed),
                max_concurrency: 2,
                ..base_config.clone()
            };
            let returns = returns.clone();
            let views = views.clone();

            async move {
                let result = task::spawn_blocking(move || {
                    let mut optimizer = GeneticPortfolio::new(&views, &returns, &window, config)?;
                    optimizer.fit()?;
                    optimizer.into_result()
                })
                .await??;

                // offload blocking file I/O
                let filename = format!("ga_result_seed{}.json", seed);
                let json = serde_json::to_string_pretty(&result)?;
                task::spawn_blocking(move || {
                    let mut f = File::create(&filename)?;
                    f.write_all(json.as_bytes())?;
                    Ok::<_, std::io::Error>(())
                })
                .await??;

                anyhow::Ok((seed, result))
            }
        })
        .buffer_unordered(2)
        .for_each(|res| async move {
            match res {
                Ok((seed, r)) => info!(
                    "seed {}: best fitness = {:.4}, return = {:.4}, volatility = {:.4}, weights = {:?}",
                    seed,
                    r.best_fitness,
                    r.best_expected_return,
                    r.best_volatility,
                    r.best_portfolio
                ),
                Err(e) => error!("experiment failed: {e:#}"),
            }
        })
        .await;

    info!("Total experiment time: {:.2?}", start.elapsed());
    Ok(())
}
