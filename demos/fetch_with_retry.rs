//! Fetch a URL through the body-retry stage
//!
//! Demonstrates wrapping a `reqwest` transport, streaming the protected body
//! and cancelling on Ctrl-C.
//!
//! Run with: cargo run --example fetch_with_retry -- http://localhost:8080/report
//!
//! Configuration can be supplied as JSON in `BODY_RETRY_CONFIG`, e.g.
//! `{"retry_budget": 3, "retry_delay_ms": 200}`.

use anyhow::Context;
use body_retry::{
    AbortContext, BodyRetry, BodyRetryConfig, DispatchContext, ReqwestTransport,
    RequestDescriptor,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    body_retry::logging::init_tracing("body_retry=debug,fetch_with_retry=info");

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8080/".to_string());
    let url = target.parse().with_context(|| format!("invalid url: {}", target))?;

    let config = match std::env::var("BODY_RETRY_CONFIG") {
        Ok(json) => BodyRetryConfig::from_json(&json).context("invalid BODY_RETRY_CONFIG")?,
        Err(_) => BodyRetryConfig::default()
            .with_retry_budget(2)
            .with_retry_delay_ms(250)
            .with_max_buffered_bytes_per_attempt(16 * 1024 * 1024),
    };

    println!("Body Retry Fetch Example");
    println!("========================\n");
    println!("GET {} (retry budget {})", target, config.retry_budget);

    let signal = CancellationToken::new();
    let ctrl_c = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let stage = BodyRetry::new(ReqwestTransport::new(), config);
    let ctx = DispatchContext::new(AbortContext::none().with_request_signal(signal.clone()));
    let response = stage.execute(RequestDescriptor::get(url), ctx).await?;

    println!(
        "status {} ({})",
        response.status,
        if response.is_wrapped() { "retry protected" } else { "pass-through" }
    );

    let Some(mut body) = response.body else {
        println!("no body");
        return Ok(());
    };

    let mut total = 0usize;
    loop {
        tokio::select! {
            _ = signal.cancelled() => {
                println!("cancelled after {} bytes", total);
                break;
            }
            chunk = body.next() => match chunk {
                Some(chunk) => total += chunk?.len(),
                None => {
                    println!("received {} bytes", total);
                    break;
                }
            },
        }
    }

    Ok(())
}
