use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_gate::{ClientBuilder, WsEvent};

/// send one message and print what comes back
#[derive(Parser)]
struct Args {
    /// ws:// or wss:// url
    #[arg(default_value = "ws://127.0.0.1:9000/ws/")]
    url: String,
    /// text to send
    #[arg(short, long, default_value = "hello ws-gate")]
    message: String,
    /// offer permessage-deflate
    #[arg(long)]
    deflate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let mut session = ClientBuilder::new()
        .deflate(args.deflate)
        .connect(&args.url)
        .await?;
    session.send_text(&args.message).await?;
    while let Some(event) = session.next_event().await {
        match event {
            WsEvent::Open => {}
            WsEvent::Message { data, is_text } => {
                if is_text {
                    println!("{}", String::from_utf8_lossy(&data));
                } else {
                    println!("{} binary bytes", data.len());
                }
                session.close(1000, "done").await?;
            }
            WsEvent::Close { code, reason, clean } => {
                tracing::info!("closed: {code} {reason} clean={clean}");
                break;
            }
            other => tracing::debug!("{other:?}"),
        }
    }
    Ok(())
}
