use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_gate::{AcceptOptions, HttpListener, WsEvent};

/// websocket echo server on an embedded http listener
#[derive(Parser)]
struct Args {
    /// listen host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// listen port
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
    /// negotiate permessage-deflate
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

    let listener = HttpListener::new();
    listener.add_prefix(&format!("http://{}:{}/ws/", args.host, args.port))?;
    listener.start()?;
    tracing::info!("listening on ws://{}:{}/ws/", args.host, args.port);

    let options = AcceptOptions {
        protocols: vec![],
        enable_deflate: args.deflate,
    };
    loop {
        let context = listener.get_context().await?;
        tracing::info!("got connect from {:?}", context.remote_addr());
        let options = options.clone();
        tokio::spawn(async move {
            let mut session = match context.accept_websocket(&options).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("handshake failed: {e}");
                    return;
                }
            };
            while let Some(event) = session.next_event().await {
                match event {
                    WsEvent::Message { data, is_text } => {
                        let result = if is_text {
                            session
                                .send_text(String::from_utf8_lossy(&data).as_ref())
                                .await
                        } else {
                            session.send(&data[..]).await
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    WsEvent::Close { code, reason, .. } => {
                        tracing::info!("closed with {code} {reason}");
                    }
                    _ => {}
                }
            }
            tracing::info!("one conn down");
        });
    }
}
