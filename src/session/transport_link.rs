use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::net::BoxStream;
use crate::protocol::{read_frame, Frame};
use crate::session::SessionEvent;

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    /// the peer closed the connection at a frame boundary
    Closed,
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub enum Outbound {
    Bytes(Bytes),
    /// flush and close the write side, then stop
    Shutdown,
}

/// A transport connection bound to a session: a reader task that decodes frames and a writer
///  task that writes whatever the session sends. Both report to the session actor, tagged with
///  the connection's generation.
pub struct TransportLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportLink {
    pub fn spawn(stream: BoxStream, generation: u64, max_packet_len: u32, events: mpsc::UnboundedSender<SessionEvent>) -> TransportLink {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();

        let reader = tokio::spawn(receive_loop(read_half, generation, max_packet_len, events.clone()));
        let writer = tokio::spawn(send_loop(write_half, generation, outbound_receiver, events));

        TransportLink {
            generation,
            outbound,
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<Outbound> {
        self.outbound.clone()
    }

    /// Drops the connection right away, discarding everything that is not written yet
    pub fn abort(self) {
        trace!("aborting transport connection #{}", self.generation);
        self.reader.abort();
        self.writer.abort();
    }

    /// Writes everything that was sent so far, shuts down the write side and stops reading
    pub fn finish(self) {
        trace!("finishing transport connection #{}", self.generation);
        let _ = self.outbound.send(Outbound::Shutdown);

        let TransportLink { writer, reader, .. } = self;
        tokio::spawn(async move {
            let _ = writer.await;
            reader.abort();
        });
    }
}

async fn receive_loop(read_half: ReadHalf<BoxStream>, generation: u64, max_packet_len: u32, events: mpsc::UnboundedSender<SessionEvent>) {
    let mut reader = BufReader::new(read_half);

    loop {
        let event = match read_frame(&mut reader, max_packet_len).await {
            Ok(Some(frame)) => {
                trace!("received {:?} on transport connection #{}", frame, generation);
                TransportEvent::Frame(frame)
            }
            Ok(None) => TransportEvent::Closed,
            Err(e) => TransportEvent::Failed(e),
        };

        let is_final = !matches!(event, TransportEvent::Frame(_));
        if events.send(SessionEvent::Transport { generation, event }).is_err() || is_final {
            break;
        }
    }
    debug!("receive loop of transport connection #{} terminated", generation);
}

/// Upper bound for the bytes collected into a single write
const MAX_BATCH_LEN: usize = 64*1024;

/// Appends `first` and whatever else is already queued (up to [`MAX_BATCH_LEN`]) to `batch`.
///  Returns true if a shutdown was requested.
fn collect_batch(first: Outbound, outbound: &mut mpsc::UnboundedReceiver<Outbound>, batch: &mut BytesMut) -> bool {
    let mut next = first;
    loop {
        match next {
            Outbound::Bytes(bytes) => batch.extend_from_slice(&bytes),
            Outbound::Shutdown => return true,
        }
        if batch.len() >= MAX_BATCH_LEN {
            return false;
        }
        match outbound.try_recv() {
            Ok(queued) => next = queued,
            Err(_) => return false,
        }
    }
}

async fn send_loop(mut write_half: WriteHalf<BoxStream>, generation: u64, mut outbound: mpsc::UnboundedReceiver<Outbound>, events: mpsc::UnboundedSender<SessionEvent>) {
    let mut batch = BytesMut::new();
    while let Some(first) = outbound.recv().await {
        let shutdown_requested = collect_batch(first, &mut outbound, &mut batch);

        if !batch.is_empty() {
            if let Err(e) = write_half.write_all(&batch).await {
                let _ = events.send(SessionEvent::Transport { generation, event: TransportEvent::Failed(e.into()) });
                return;
            }
            batch.clear();
        }

        if shutdown_requested {
            let result = write_half.shutdown().await;
            debug!("transport connection #{} shut down: {:?}", generation, result);
            return;
        }
    }
}
