use std::thread;

use rrcomm::prelude::*;
use rrcomm::transport::Provider;

const PORT: u16 = 18515;

fn client<P: Provider>(provider: P) -> anyhow::Result<()> {
    let mut client = RdmaChannel::open(provider, "127.0.0.1", PORT, ChannelConfig::default())?;
    client.connect()?;

    // Send the message to the server, then wait for its reply.
    client.write(b"PING")?;
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf)?;
    println!("client got: {}", String::from_utf8_lossy(&buf[..n]));

    client.close()?;
    Ok(())
}

fn ping<P: Provider + 'static>(provider: P) -> anyhow::Result<()> {
    let mut server = RdmaChannel::open(provider.clone(), "0.0.0.0", PORT, ChannelConfig::default())?;
    server.serve()?;

    let cli = thread::spawn(move || client(provider));

    // Receive a message from the client and answer it.
    let mut conn = server.accept()?;
    println!("negotiated: {:?}", conn.caps());
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf)?;
    println!("server got: {}", String::from_utf8_lossy(&buf[..n]));
    conn.write(b"PONG")?;

    cli.join().unwrap()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Pass `--loopback` to run without an RDMA device.
    if std::env::args().any(|arg| arg == "--loopback") {
        return ping(LoopbackFabric::new());
    }

    #[cfg(rdma_core)]
    return ping(CmProvider);

    #[cfg(not(rdma_core))]
    {
        eprintln!("built without librdmacm, falling back to the loopback transport");
        ping(LoopbackFabric::new())
    }
}
