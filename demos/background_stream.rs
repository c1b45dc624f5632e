use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tinkclaw_sdk::stream::StreamClient;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("TINKCLAW_STREAM_TOKEN")
        .unwrap_or_else(|_| "REPLACE_WITH_STREAM_TOKEN".to_string());

    let client = StreamClient::new(SecretString::new(token)).with_max_backoff(Duration::from_secs(30));
    client.subscribe(["BTC", "ETH", "SOL"], ["candle:60", "options_signal"]);

    let candles = Arc::new(AtomicU64::new(0));
    {
        let candles = Arc::clone(&candles);
        client.callbacks().on_candle(move |candle| {
            candles.fetch_add(1, Ordering::Relaxed);
            if let Some(change_pct) = candle.change_pct().filter(|pct| pct.abs() > 0.5) {
                println!(
                    "{} candle {change_pct:+.2}% (H={:?} L={:?})",
                    candle.symbol, candle.high, candle.low
                );
            }
        });
    }
    client.callbacks().on_options_signal(|signal| {
        println!(
            "{} {} severity={}",
            signal.underlying,
            signal.signal_type.as_deref().unwrap_or("?"),
            signal.severity.as_deref().unwrap_or("?")
        );
    });

    let handle = client.start_background()?;
    std::thread::sleep(Duration::from_secs(120));
    handle.stop();
    handle.join()?;

    println!("received {} candles", candles.load(Ordering::Relaxed));
    Ok(())
}
