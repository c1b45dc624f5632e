use std::error::Error;

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

    let client = StreamClient::new(SecretString::new(token));
    client.subscribe(["BTC", "ETH"], ["tick", "signal"]);

    client
        .callbacks()
        .on_connect(|info| {
            println!("connected plan={}", info.plan.as_deref().unwrap_or("unknown"));
        })
        .on_tick(|tick| {
            if let Some(price) = tick.price {
                println!(
                    "{}: ${price:.2} (vol {:.4})",
                    tick.symbol,
                    tick.volume.unwrap_or_default()
                );
            }
        })
        .on_signal(|signal| {
            println!(
                "** {} {} confidence={:.0}% **",
                signal.signal,
                signal.symbol,
                signal.confidence.unwrap_or_default()
            );
        })
        .on_disconnect(|reason| println!("disconnected: {reason}"));

    let stopper = client.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        stopper.stop();
    });

    println!("streaming; press enter to stop");
    client.start_blocking()?;
    Ok(())
}
