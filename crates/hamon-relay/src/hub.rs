use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, warn};

pub type SnapshotBytes = Arc<[u8]>;

pub enum Registration {
    Subscribe {
        id: String,
        sender: mpsc::Sender<SnapshotBytes>,
    },
    Unsubscribe {
        id: String,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// Downstream consumers keyed by peer address.
#[derive(Default)]
pub struct Subscribers {
    senders: HashMap<String, mpsc::Sender<SnapshotBytes>>,
}

impl Subscribers {
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn apply(&mut self, registration: Registration) {
        match registration {
            Registration::Subscribe { id, sender } => {
                self.senders.insert(id.clone(), sender);
                info!(event = "relay_subscriber_add", id = %id, subscribers = self.senders.len());
            }
            Registration::Unsubscribe { id } => {
                if self.senders.remove(&id).is_some() {
                    info!(event = "relay_subscriber_remove", id = %id, subscribers = self.senders.len());
                }
            }
        }
    }

    /// Offers `snapshot` to everyone without waiting. A consumer whose queue
    /// is full misses this update; one whose queue is closed is forgotten.
    pub fn publish(&mut self, snapshot: &SnapshotBytes) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for (id, sender) in &self.senders {
            match sender.try_send(snapshot.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(event = "relay_slow_subscriber", id = %id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }
        for id in closed {
            self.senders.remove(&id);
            info!(event = "relay_subscriber_remove", id = %id, reason = "closed");
            report.removed += 1;
        }
        report
    }
}

/// Owns the subscriber registry. Runs until the snapshot source goes away.
pub async fn fan_out(
    mut snapshots: mpsc::Receiver<SnapshotBytes>,
    mut registrations: mpsc::Receiver<Registration>,
) {
    let mut subscribers = Subscribers::default();
    let mut registrations_open = true;
    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else {
                    break;
                };
                if subscribers.is_empty() {
                    continue;
                }
                let report = subscribers.publish(&snapshot);
                debug!(
                    event = "relay_publish",
                    subscribers = subscribers.len(),
                    delivered = report.delivered,
                    dropped = report.dropped,
                    removed = report.removed
                );
            }
            registration = registrations.recv(), if registrations_open => {
                match registration {
                    Some(registration) => subscribers.apply(registration),
                    None => registrations_open = false,
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct HubHandles {
    pub registrations: mpsc::Sender<Registration>,
    pub commands: mpsc::Sender<String>,
    pub queue_capacity: usize,
}

pub async fn accept_loop(listener: TcpListener, handles: HubHandles) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handles = handles.clone();
                tokio::spawn(async move {
                    serve_consumer(stream, peer, handles).await;
                });
            }
            Err(err) => {
                warn!(event = "relay_accept_error", error = %err);
            }
        }
    }
}

/// Streams snapshots to one consumer and passes its lines upstream as
/// control commands.
pub async fn serve_consumer(stream: TcpStream, peer: SocketAddr, handles: HubHandles) {
    let id = peer.to_string();
    let (tx, mut rx) = mpsc::channel(handles.queue_capacity.max(1));
    let subscribe = Registration::Subscribe {
        id: id.clone(),
        sender: tx,
    };
    if handles.registrations.send(subscribe).await.is_err() {
        return;
    }

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                let Some(snapshot) = snapshot else {
                    break;
                };
                if let Err(err) = writer.write_all(&snapshot).await {
                    warn!(event = "relay_subscriber_write_error", id = %id, error = %err);
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let command = line.trim();
                        if command.is_empty() {
                            continue;
                        }
                        info!(event = "relay_command", id = %id, command = %command);
                        if handles.commands.send(command.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(event = "relay_subscriber_read_error", id = %id, error = %err);
                        break;
                    }
                }
            }
        }
    }

    let _ = handles
        .registrations
        .send(Registration::Unsubscribe { id })
        .await;
}
