use micro_tcp::handler::{ConnectionIo, make_handler};
use micro_tcp::server::{Server, ServerConfig};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = ServerConfig::builder().address("127.0.0.1:8080".parse()?).build()?;

    // Echo whatever arrives straight back to the peer.
    let handler = make_handler(|io: &mut ConnectionIo<'_>| {
        let payload = io.bytes().to_vec();
        io.consume(payload.len());
        io.send(payload);
    });

    Server::new(config, handler).run()?;
    Ok(())
}
