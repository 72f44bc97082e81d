//! Worker side of the channel.

use buildit_core::{MasterMessage, WorkerId, WorkerMessage};
use futures::SinkExt;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::codec::{encode, frame_codec, next_message};
use crate::{ChannelError, TlsMaterial};

/// A registered connection to the master.
pub struct WorkerConnection {
    framed: ClientFramed,
    worker_id: WorkerId,
}

impl WorkerConnection {
    /// Dial the master, complete the mutual TLS handshake and register.
    /// Returns once the master acknowledged the registration.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls: &TlsMaterial,
        worker_id: WorkerId,
        capacity: u32,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let connector = tls.connector()?;
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| ChannelError::Handshake(format!("invalid server name: {e}")))?;

        let pending = register(addr, server_name, connector, &worker_id, capacity);
        let framed = tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| ChannelError::Timeout("registration"))??;
        debug!(worker_id = %worker_id, %addr, "Registered with master");

        Ok(Self { framed, worker_id })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn send(&mut self, message: &WorkerMessage) -> Result<(), ChannelError> {
        self.framed.send(encode(message)?).await?;
        Ok(())
    }

    /// Next message from the master, `None` once the master closed the
    /// stream.
    pub async fn recv(&mut self) -> Result<Option<MasterMessage>, ChannelError> {
        next_message(&mut self.framed).await
    }
}

type ClientFramed = Framed<TlsStream<TcpStream>, LengthDelimitedCodec>;

async fn register(
    addr: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    worker_id: &WorkerId,
    capacity: u32,
) -> Result<ClientFramed, ChannelError> {
    let tcp = TcpStream::connect(addr).await?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;
    let mut framed = Framed::new(stream, frame_codec());

    let hello = WorkerMessage::RegisterWorker {
        worker_id: worker_id.clone(),
        capacity,
    };
    framed.send(encode(&hello)?).await?;

    match next_message::<MasterMessage, _, _>(&mut framed).await? {
        Some(MasterMessage::RegisterAck { worker_id: acked }) if acked == *worker_id => Ok(framed),
        Some(other) => Err(ChannelError::Protocol(format!(
            "unexpected reply to registration: {other:?}"
        ))),
        None => Err(ChannelError::Protocol(
            "master closed the connection during registration".into(),
        )),
    }
}
