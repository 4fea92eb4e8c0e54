use eyre::Result;
use futures_util::StreamExt;
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;

use tokio_workgroup::{Context, FutureExt as _, Group};

/// Connection task
async fn handle_connection(connection: TcpStream, ctx: Context) {
    let addr = connection.peer_addr().unwrap();
    eprintln!("Accepted connection from {} ...", addr);

    let (mut reader, mut writer) = connection.into_split();
    let res = io::copy(&mut reader, &mut writer).until(ctx.cancelled()).await;

    match res {
        Ok(Ok(bytes)) => eprintln!("{}: {} bytes echoed", addr, bytes),
        Ok(Err(err)) => eprintln!("{}: connection error: {}", addr, err),
        Err(_) => eprintln!("{}: shutting down connection task ...", addr),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    const LISTEN_ADDR: &str = "[::]:12345";

    // Serve at most 64 connections at once; further ones get queued.
    let group = Group::limited(64)?;

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    eprintln!("Listening for connections at {} ...", LISTEN_ADDR);

    // The server task accepts connections until the group is cancelled.
    // It uses the group2 clone to submit connection tasks.
    let group2 = group.clone();
    group.submit(move |ctx| async move {
        let mut listener = TcpListenerStream::new(listener).take_until(ctx.cancelled());

        while let Some(Ok(connection)) = listener.next().await {
            // Submit a connection task
            let res = group2.submit(move |ctx| handle_connection(connection, ctx));
            if res.is_err() {
                // The group was cancelled in the meantime
                break;
            }
        }

        eprintln!("Server task shutting down ...");
    })?;

    // Cancel the group on Ctrl+C
    signal::ctrl_c().await?;
    eprintln!("\nStopping ...");

    // Cancel and wait for all the tasks
    group.close().await.ok();
    eprintln!("All tasks finished! Bye ...");

    Ok(())
}
