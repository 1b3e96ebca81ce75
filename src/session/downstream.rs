use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::net::BoxStream;
use crate::session::SessionEvent;

#[derive(Debug)]
pub enum DownstreamEvent {
    Data(Bytes),
    /// EOF on the downstream socket's read side
    Closed,
    Failed(anyhow::Error),
    WriteFailed(anyhow::Error),
}

#[derive(Debug)]
enum DownstreamCommand {
    Write(Bytes),
    Shutdown,
}

enum DownstreamState {
    /// the socket is not there yet (responding side, destination connection in progress)
    Connecting { queued: Vec<Bytes>, shutdown_requested: bool },
    Connected { commands: mpsc::UnboundedSender<DownstreamCommand> },
    /// data for the socket is dropped, either because writing failed or because there is no
    ///  socket to write to
    Discarding,
}

/// The session's socket on the far side from the tunnel: the user connection on the initiating
///  side, the destination connection on the responding side.
pub struct Downstream {
    state: DownstreamState,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Downstream {
    pub fn connecting() -> Downstream {
        Downstream {
            state: DownstreamState::Connecting { queued: Vec::new(), shutdown_requested: false },
            reader: None,
            writer: None,
        }
    }

    pub fn connected(stream: BoxStream, read_buffer_size: usize, events: mpsc::UnboundedSender<SessionEvent>) -> Downstream {
        let mut result = Downstream::connecting();
        result.connect(stream, read_buffer_size, events);
        result
    }

    /// Starts I/O on the socket once it is available. Data written before is passed on first.
    pub fn connect(&mut self, stream: BoxStream, read_buffer_size: usize, events: mpsc::UnboundedSender<SessionEvent>) {
        let (queued, shutdown_requested) = match &mut self.state {
            DownstreamState::Connecting { queued, shutdown_requested } => (std::mem::take(queued), *shutdown_requested),
            _ => {
                debug!("downstream socket is not needed any more - dropping it");
                return;
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (commands, command_receiver) = mpsc::unbounded_channel();
        self.reader = Some(tokio::spawn(receive_loop(read_half, read_buffer_size, events.clone())));
        self.writer = Some(tokio::spawn(send_loop(write_half, command_receiver, events)));

        for data in queued {
            let _ = commands.send(DownstreamCommand::Write(data));
        }
        if shutdown_requested {
            let _ = commands.send(DownstreamCommand::Shutdown);
        }
        self.state = DownstreamState::Connected { commands };
    }

    pub fn write(&mut self, data: Bytes) {
        match &mut self.state {
            DownstreamState::Connecting { queued, .. } => queued.push(data),
            DownstreamState::Connected { commands } => {
                let _ = commands.send(DownstreamCommand::Write(data));
            }
            DownstreamState::Discarding => trace!("discarding {} bytes for the downstream socket", data.len()),
        }
    }

    /// Closes the socket's write side after everything written so far
    pub fn shutdown(&mut self) {
        match &mut self.state {
            DownstreamState::Connecting { shutdown_requested, .. } => *shutdown_requested = true,
            DownstreamState::Connected { commands } => {
                let _ = commands.send(DownstreamCommand::Shutdown);
            }
            DownstreamState::Discarding => {}
        }
    }

    pub fn discard(&mut self) {
        self.state = DownstreamState::Discarding;
    }

    #[cfg(test)]
    pub fn is_discarding(&self) -> bool {
        matches!(self.state, DownstreamState::Discarding)
    }

    /// Graceful close: pending writes are completed before the socket is closed
    pub fn close(mut self) {
        self.shutdown();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    pub fn abort(mut self) {
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

async fn receive_loop(mut read_half: ReadHalf<BoxStream>, read_buffer_size: usize, events: mpsc::UnboundedSender<SessionEvent>) {
    // data is copied out: it lives in the replay cache until acknowledged
    let mut buf = vec![0u8; read_buffer_size];
    loop {
        let event = match read_half.read(&mut buf).await {
            Ok(0) => DownstreamEvent::Closed,
            Ok(n) => DownstreamEvent::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => DownstreamEvent::Failed(e.into()),
        };

        let is_final = !matches!(event, DownstreamEvent::Data(_));
        if events.send(SessionEvent::Downstream(event)).is_err() || is_final {
            break;
        }
    }
    trace!("downstream receive loop terminated");
}

async fn send_loop(mut write_half: WriteHalf<BoxStream>, mut commands: mpsc::UnboundedReceiver<DownstreamCommand>, events: mpsc::UnboundedSender<SessionEvent>) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            DownstreamCommand::Write(data) => write_half.write_all(&data).await,
            DownstreamCommand::Shutdown => {
                let result = write_half.shutdown().await;
                trace!("downstream write side shut down: {:?}", result);
                return;
            }
        };
        if let Err(e) = result {
            let _ = events.send(SessionEvent::Downstream(DownstreamEvent::WriteFailed(e.into())));
            return;
        }
    }
}
