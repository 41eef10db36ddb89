//! Harness control channel.
//!
//! A harness drives the mock over TCP with JSON commands, each terminated
//! by a zero byte. The channel works either way round: the mock can listen
//! for harness connections, or dial out to a harness and announce itself
//! with `hello`.

mod codec;
mod command;
mod handler;

use std::sync::Arc;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::cluster::ClusterError;
use crate::logging::{debug, info, warn};

pub use codec::{FRAME_DELIMITER, MAX_FRAME_LEN, decode, encode, read_command, write_command};
pub use command::Command;
pub use handler::{ControlHandler, TestContext, default_cluster};

/// Errors raised on the control channel.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control stream ended inside a {0} byte frame")]
    TruncatedFrame(usize),

    #[error("control frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("invalid run id: {0:?}")]
    UnknownRun(String),

    #[error("invalid cluster id: {0:?}")]
    UnknownCluster(String),

    #[error("no test is running in run {0:?}")]
    NoRunningTest(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Accept harness connections until the listener fails.
pub async fn serve(listener: TcpListener, handler: Arc<ControlHandler>) -> Result<(), ControlError> {
    info!(addr = ?listener.local_addr().ok(), "control channel listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "control client connected");
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = run_connection(stream, &handler).await {
                warn!(peer = %peer, error = %err, "control connection failed");
            }
            debug!(peer = %peer, "control client disconnected");
        });
    }
}

/// Dial a waiting harness, say hello, then serve its commands until it hangs up.
pub async fn connect<A: ToSocketAddrs>(addr: A, handler: Arc<ControlHandler>) -> Result<(), ControlError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_command(&mut stream, &Command::Hello).await?;
    info!(peer = ?stream.peer_addr().ok(), "connected to harness");
    run_connection(stream, &handler).await
}

async fn run_connection(stream: TcpStream, handler: &ControlHandler) -> Result<(), ControlError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(cmd) = read_command(&mut reader).await? {
        let Some(reply) = handler.handle(cmd).await else {
            break;
        };
        write_command(&mut write_half, &reply).await?;
    }
    Ok(())
}
