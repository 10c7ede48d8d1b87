//! Line framing over accepted TCP connections.
//!
//! Each connection gets a read task and a write task. The read task slices
//! the byte stream into newline-terminated frames (4 KiB cap — an oversized
//! frame closes the connection) and enqueues them, never running protocol
//! logic itself. The write task serializes all outbound traffic so a status
//! broadcast and a command never interleave mid-frame.
//!
//! Frames are delivered through a re-pointable [`LineSink`]: connections
//! start out feeding the dispatcher, and ownership of the frame stream moves
//! to an observation system when a device is coupled (GFT mounts, cameras).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::hub::{HubEvent, Peer};
use crate::obss::ObssEvent;

/// Longest accepted frame, terminator included.
pub const FRAME_MAX: usize = 4096;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection's framed lines are delivered.
#[derive(Debug, Clone)]
pub enum LineSink {
    /// Still owned by the dispatcher.
    Hub(crate::bus::Bus<HubEvent>),
    /// Owned by one observation system.
    Obss(crate::bus::Bus<ObssEvent>),
}

#[derive(Debug)]
enum WriteCmd {
    Data(Vec<u8>),
}

/// One accepted connection. Cloned freely; GWAC observation systems in the
/// same group all hold the same link.
#[derive(Debug)]
pub struct TcpLink {
    id: u64,
    peer: Peer,
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<WriteCmd>,
    sink: Mutex<LineSink>,
    closer: watch::Sender<bool>,
}

pub type Link = Arc<TcpLink>;

impl TcpLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue one already-terminated line for writing. Errors only surface in
    /// the write task; a closed link drops the data.
    pub fn send_line(&self, line: &str) {
        let _ = self.writer.send(WriteCmd::Data(line.as_bytes().to_vec()));
    }

    /// Ask both tasks to wind down. The read task delivers one final
    /// `Closed` notification through the current sink.
    pub fn close(&self) {
        let _ = self.closer.send(true);
    }

    /// Transfer the frame stream to a new owner.
    pub fn retarget(&self, sink: LineSink) {
        *self.sink.lock().unwrap() = sink;
    }

    fn current_sink(&self) -> LineSink {
        self.sink.lock().unwrap().clone()
    }
}

async fn deliver_line(link: &Link, line: String) {
    match link.current_sink() {
        LineSink::Hub(bus) => {
            bus.post(HubEvent::Line {
                link: link.clone(),
                peer: link.peer,
                line,
            })
            .await
        }
        LineSink::Obss(bus) => {
            bus.post(ObssEvent::DeviceLine {
                link: link.clone(),
                line,
            })
            .await
        }
    }
}

async fn deliver_closed(link: &Link) {
    match link.current_sink() {
        LineSink::Hub(bus) => {
            bus.post(HubEvent::Closed {
                link: link.clone(),
                peer: link.peer,
            })
            .await
        }
        LineSink::Obss(bus) => bus.post(ObssEvent::DeviceClosed { link: link.clone() }).await,
    }
}

/// Adopt an accepted stream: enable keepalive, spawn the read/write tasks,
/// return the shared handle.
pub fn spawn_link(stream: TcpStream, peer: Peer, sink: LineSink) -> Link {
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        debug!("keepalive on {} connection: {e}", peer.label());
    }
    let addr = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (mut rd, mut wr) = stream.into_split();

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    let (closer, close_rx) = watch::channel(false);

    let link: Link = Arc::new(TcpLink {
        id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
        peer,
        addr,
        writer: writer_tx,
        sink: Mutex::new(sink),
        closer,
    });

    // Write task: one writer per connection, no interleaving.
    let mut wr_close = close_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = wr_close.changed() => break,
                cmd = writer_rx.recv() => match cmd {
                    Some(WriteCmd::Data(data)) => {
                        if wr.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = wr.shutdown().await;
    });

    // Read task: frame on '\n', cap at FRAME_MAX, enqueue via the sink.
    let link_rd = link.clone();
    let mut rd_close = close_rx;
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(FRAME_MAX);
        loop {
            // Drain complete frames before reading more.
            while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
                if nl + 1 > FRAME_MAX {
                    error!(
                        "frame from {} {} is over the {FRAME_MAX}-byte cap",
                        link_rd.peer.label(),
                        link_rd.addr
                    );
                    link_rd.close();
                    deliver_closed(&link_rd).await;
                    return;
                }
                let frame = buf.split_to(nl + 1);
                let line = String::from_utf8_lossy(&frame[..nl])
                    .trim_end_matches('\r')
                    .to_string();
                deliver_line(&link_rd, line).await;
            }
            if buf.len() > FRAME_MAX {
                error!(
                    "unterminated frame from {} {} exceeds the {FRAME_MAX}-byte cap",
                    link_rd.peer.label(),
                    link_rd.addr
                );
                link_rd.close();
                deliver_closed(&link_rd).await;
                return;
            }

            tokio::select! {
                _ = rd_close.changed() => {
                    deliver_closed(&link_rd).await;
                    return;
                }
                r = rd.read_buf(&mut buf) => match r {
                    Ok(0) | Err(_) => {
                        debug!("{} {} disconnected", link_rd.peer.label(), link_rd.addr);
                        link_rd.close();
                        deliver_closed(&link_rd).await;
                        return;
                    }
                    Ok(_) => {}
                },
            }
        }
    });

    link
}
