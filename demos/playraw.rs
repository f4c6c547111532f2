//! Streams raw 44.1 kHz 16-bit stereo little-endian PCM from stdin.
//!
//! ```text
//! ffmpeg -i song.flac -f s16le -ar 44100 -ac 2 - | cargo run --example playraw -- 192.168.1.20
//! ```
//!
//! `RUST_LOG=aerial=debug` shows the RTSP exchange.

use std::io::Read;
use std::time::Duration;

use aerial::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().ok_or("usage: playraw <host[:port]> [config.json]")?;
    let config = match args.next() {
        Some(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ClientConfig::default(),
    };

    let mut client = Client::with_config(config);
    client.on_error(|err| eprintln!("receiver lost: {}", err));
    client.play(&addr).await?;

    let mut stdin = std::io::stdin().lock();
    let mut buf = vec![0u8; Client::BYTES_PER_FRAME * 4096];
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        client.write(&buf[..n])?;
        client.pace(Duration::from_millis(500)).await?;
    }

    // let the receiver play out what it has
    tokio::time::sleep(client.lead()).await;
    client.disconnect().await;
    Ok(())
}
