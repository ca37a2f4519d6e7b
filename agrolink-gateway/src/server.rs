use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::mpsc,
};

use agrolink::{
    isobus::Filter,
    journal::Journal,
    net::{Endpoint, EndpointHandle, Message},
    ring::RingLog,
    Error, Result,
};

use crate::wire::{self, Command, Record};

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

/// The gateway server.
///
/// One task owns the ring and the journal: bus messages arriving on the
/// inbound channel are journaled and appended, and whenever a peer is
/// connected the unread part of the ring is streamed out to it. Commands
/// from the peer are handled inline. One peer at a time, like the serial
/// link it stands in for.
pub struct Server {
    listener: TcpListener,
    inbound: mpsc::Receiver<(usize, Message)>,
    endpoints: Vec<EndpointHandle>,
    ring: RingLog,
    journal: Journal,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        inbound: mpsc::Receiver<(usize, Message)>,
        endpoints: Vec<EndpointHandle>,
        ring: RingLog,
        journal: Journal,
    ) -> Self {
        Self {
            listener,
            inbound,
            endpoints,
            ring,
            journal,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut peer: Option<Peer> = None;

        loop {
            match &mut peer {
                None => {
                    tokio::select! {
                        result = self.listener.accept() => {
                            let (stream, address) = result.map_err(Error::Io)?;
                            log::info!("Peer {} connected", address);

                            let (read_half, write_half) = stream.into_split();
                            peer = Some(Peer {
                                reader: BufReader::new(read_half),
                                writer: write_half,
                                line: String::new(),
                            });
                        }
                        message = self.inbound.recv() => match message {
                            Some((iface, message)) => self.log_message(iface, &message),
                            None => return Ok(()),
                        }
                    }
                }
                Some(p) => {
                    p.line.clear();

                    tokio::select! {
                        message = self.inbound.recv() => match message {
                            Some((iface, message)) => self.log_message(iface, &message),
                            None => return Ok(()),
                        },
                        result = p.reader.read_line(&mut p.line) => match result {
                            Ok(0) => {
                                log::info!("Peer disconnected");
                                peer = None;
                                continue;
                            }
                            Ok(_) => {
                                let line = std::mem::take(&mut p.line);
                                if self.handle_line(&line, p).await.is_err() {
                                    peer = None;
                                    continue;
                                }
                            }
                            Err(e) => {
                                log::warn!("Peer read: {}", e);
                                peer = None;
                                continue;
                            }
                        }
                    }
                }
            }

            // Stream whatever is unread to the peer; back pressure simply
            // leaves bytes in the ring.
            if let Some(p) = &mut peer {
                let unread = self.ring.unread_bytes();
                if unread > 0 {
                    match p.writer.write_all(self.ring.unread()).await {
                        Ok(()) => self.ring.read_advance(unread),
                        Err(e) => {
                            log::warn!("Peer write: {}", e);
                            peer = None;
                        }
                    }
                }
            }
        }
    }

    /// Journal and append one received message.
    fn log_message(&mut self, iface: usize, message: &Message) {
        if message.error {
            log::debug!("socket {}: error frame 0x{:X}", iface, message.pgn);
            return;
        }

        let key = match self.journal.next_key() {
            Ok(key) => key,
            Err(e) => {
                log::error!("Journal: {}", e);
                return;
            }
        };

        let record = Record::from_message(iface, key, message);

        if let Err(e) = self.journal.append(record.fields().as_bytes()) {
            log::error!("Journal: {}", e);
        }
        if let Err(e) = self.ring.append(record.live_line().as_bytes()) {
            log::error!("Ring: {}", e);
        }
    }

    /// Handle one command line from the peer.
    ///
    /// Malformed lines are logged and dropped; only transport errors tear
    /// the session down.
    async fn handle_line(&mut self, line: &str, peer: &mut Peer) -> std::io::Result<()> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("{}", e);
                return Ok(());
            }
        };

        match command {
            Command::SetFilters { socket, pgns } => {
                let Some(endpoint) = self.endpoints.get(socket) else {
                    log::warn!("No such socket {}", socket);
                    return Ok(());
                };

                // No group numbers means receive everything.
                let filters = if pgns.is_empty() {
                    vec![Filter::accept_all()]
                } else {
                    pgns.into_iter().map(Filter::from_pgn).collect()
                };

                if let Err(e) = endpoint.set_filters(filters) {
                    log::warn!("Set filters: {}", e);
                } else if let Err(e) = self.ring.clear() {
                    log::error!("Ring: {}", e);
                }
            }
            Command::Send {
                socket,
                dest,
                pgn,
                data,
            } => {
                let Some(endpoint) = self.endpoints.get(socket) else {
                    log::warn!("No such socket {}", socket);
                    return Ok(());
                };

                if let Err(e) = endpoint.send_to(pgn, &data, dest).await {
                    log::warn!("Send: {}", e);
                }
            }
            Command::GetPast { low, high } => {
                let records = match self.journal.range(low, high) {
                    Ok(records) => records,
                    Err(e) => {
                        log::error!("Journal: {}", e);
                        return Ok(());
                    }
                };

                for (_, fields) in records {
                    peer.writer.write_all(&wire::old_line(&fields)).await?;
                }
            }
        }

        Ok(())
    }
}

/// Forward received messages from an endpoint into the server channel.
pub async fn pump(iface: usize, mut endpoint: Endpoint, sender: mpsc::Sender<(usize, Message)>) {
    loop {
        match endpoint.recv().await {
            Ok(message) => {
                if sender.send((iface, message)).await.is_err() {
                    break;
                }
            }
            Err(Error::Overflow) => {
                log::warn!("socket {}: receive queue overflowed", iface);
            }
            Err(Error::NetworkDown) => {
                log::warn!("socket {}: network is down", iface);
            }
            Err(e) => {
                log::error!("socket {}: {}", iface, e);
                break;
            }
        }
    }
}
