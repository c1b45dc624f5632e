use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use tinkclaw_sdk::api::{ApiClient, Confluence};
use tinkclaw_sdk::strategy::{OrderIntent, PositionBook, Strategy, StrategyRunner};
use tracing_subscriber::EnvFilter;

/// Buys on strong breakout confluence and exits when the score fades.
struct MomentumBot {
    entry_score: f64,
    exit_score: f64,
    size: f64,
}

impl Strategy for MomentumBot {
    fn on_signal(
        &mut self,
        symbol: &str,
        confluence: &Confluence,
        positions: &PositionBook,
    ) -> Vec<OrderIntent> {
        let score = confluence.score.unwrap_or_default();
        let held = positions.get(symbol);
        let breakout = confluence.setup_type.as_deref() == Some("breakout");

        if held == 0.0 && score > self.entry_score && breakout {
            vec![OrderIntent::buy(symbol, self.size).with_reason(format!("score {score:.1}"))]
        } else if held > 0.0 && score < self.exit_score {
            vec![OrderIntent::sell(symbol, held).with_reason("confluence faded")]
        } else {
            Vec::new()
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_key =
        std::env::var("TINKCLAW_API_KEY").unwrap_or_else(|_| "REPLACE_WITH_API_KEY".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = ApiClient::new(SecretString::new(api_key))?;
        let bot = MomentumBot {
            entry_score: 75.0,
            exit_score: 40.0,
            size: 0.1,
        };
        let mut runner = StrategyRunner::new(["BTC", "ETH", "SOL"], client.clone(), bot);

        let summary = runner
            .run(Duration::from_secs(4 * 3600), Some(3))
            .await;
        println!(
            "iterations={} orders={} errors={} calls_remaining={:?}",
            summary.iterations,
            summary.orders,
            summary.errors,
            client.calls_remaining()
        );
        for (symbol, size) in runner.positions().iter() {
            println!("{symbol}: {size}");
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
