//! Echo TCP server: accepts connections and echoes every byte back until
//! the peer closes.
//!
//! ```sh
//! cargo run --example echo-server -- 127.0.0.1:0
//! ```

use std::net::SocketAddr;

use weft::net::NetServer;
use weft::task;

fn main() -> weft::Result<()> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:0".to_string())
        .parse()
        .expect("usage: echo-server [ip:port]");

    weft::run(move || {
        let server = NetServer::bind(addr, "echo", |sock| {
            task::set_name("echo");
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.recv(&mut buf, None)?;
                if n == 0 {
                    return Ok(());
                }
                sock.sendall(&buf[..n], None)?;
            }
        })?;
        println!("listening on: {}", server.local_addr()?);
        server.serve(1)
    })
}
