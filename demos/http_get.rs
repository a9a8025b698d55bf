//! Minimal HTTP GET client: dials a host, writes the request, prints the raw
//! response.
//!
//! ```sh
//! cargo run --example http-get -- example.com 80 /
//! ```

use std::time::Duration;

use weft::net::NetSock;
use weft::task;

fn main() -> weft::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().expect("usage: http-get <host> <port> [path]");
    let port: u16 = args
        .next()
        .expect("usage: http-get <host> <port> [path]")
        .parse()
        .expect("port must be a number");
    let path = args.next().unwrap_or_else(|| "/".to_string());

    weft::run(move || {
        // Address resolution is synchronous and stack-hungry.
        task::spawn_with_stack(
            move || {
                let sock = NetSock::dial(&host, port, Some(Duration::from_secs(10)))?;

                let request = format!(
                    "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
                );
                println!("Request:\n--------------\n{request}");
                sock.sendall(request.as_bytes(), None)?;

                println!("Response:\n--------------");
                let mut buf = [0u8; 4096];
                let mut total = 0usize;
                loop {
                    let n = sock.recv(&mut buf, Some(Duration::from_secs(30)))?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                    print!("{}", String::from_utf8_lossy(&buf[..n]));
                }
                println!("\nBody+headers size: {total}");
                Ok(())
            },
            task::DIAL_STACK_SIZE,
        )?;
        Ok(())
    })
}
