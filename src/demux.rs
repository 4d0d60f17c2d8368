//! Connection-ID demultiplexing over a shared UDP socket.
//!
//! One socket carries many sessions; the demultiplexer owns the single read
//! loop and routes each datagram by its destination connection ID. Datagrams
//! for unregistered IDs fall through to the listener's admission pipeline.
//! The listener consumes the [`Demultiplexer`] trait rather than the
//! concrete [`PacketHandlerMap`], so tests can inject a fake.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use ring::hmac;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::buffer::{BufferPool, ReceivedPacket};
use crate::cid::ConnectionId;
use crate::server::ServerError;
use crate::RESET_TOKEN_SIZE;

/// Receives datagrams routed to one registered connection ID
pub trait PacketHandler: Send + Sync + 'static {
    /// Takes ownership of the packet, including its buffer.
    fn handle_packet(&self, packet: ReceivedPacket);
}

/// Receives datagrams whose destination connection ID is not registered
pub trait UnknownPacketHandler: Send + Sync + 'static {
    /// Takes ownership of the packet. Must not block: called from the
    /// socket read loop.
    fn handle_packet(&self, packet: ReceivedPacket);

    /// Reports that the socket died and no further packets will arrive.
    fn set_close_error(&self, error: ServerError);
}

/// Routing table mapping connection IDs to sessions
pub trait Demultiplexer: Send + Sync + 'static {
    /// Registers `handler` under `cid`. Returns `false` if the ID is
    /// already taken (duplicate-Initial race), in which case nothing is
    /// registered.
    fn add(&self, cid: ConnectionId, handler: Arc<dyn PacketHandler>) -> bool;

    fn remove(&self, cid: &ConnectionId);

    /// Deterministic stateless-reset token for a CID this endpoint issued.
    fn stateless_reset_token(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_SIZE];

    /// Installs the handler for unknown-CID packets.
    fn set_server(&self, server: Arc<dyn UnknownPacketHandler>);

    /// Stops routing unknown-CID packets; established sessions continue.
    fn close_server(&self);

    /// Tears the demultiplexer down, including its socket reader.
    fn destroy(&self) -> io::Result<()>;
}

/// The production [`Demultiplexer`]: owns the socket read loop.
pub struct PacketHandlerMap {
    socket: Arc<UdpSocket>,
    state: Mutex<MapState>,
    reset_key: hmac::Key,
    pool: Arc<BufferPool>,
    connection_id_length: usize,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct MapState {
    handlers: HashMap<ConnectionId, Arc<dyn PacketHandler>>,
    server: Option<Arc<dyn UnknownPacketHandler>>,
}

impl PacketHandlerMap {
    /// Starts demultiplexing `socket`. Must be called within a tokio
    /// runtime; the read loop runs until [`Demultiplexer::destroy`] or a
    /// fatal socket error.
    pub fn new(
        socket: Arc<UdpSocket>,
        connection_id_length: usize,
        stateless_reset_key: Option<&[u8]>,
    ) -> Arc<Self> {
        let reset_key = match stateless_reset_key {
            Some(key) => hmac::Key::new(hmac::HMAC_SHA256, key),
            None => {
                let mut key = [0; 32];
                rand::thread_rng().fill_bytes(&mut key);
                hmac::Key::new(hmac::HMAC_SHA256, &key)
            }
        };
        let map = Arc::new(Self {
            socket,
            state: Mutex::new(MapState {
                handlers: HashMap::new(),
                server: None,
            }),
            reset_key,
            pool: BufferPool::new(),
            connection_id_length,
            reader: Mutex::new(None),
        });
        let reader = tokio::spawn(Self::read_loop(map.clone()));
        *map.reader.lock().unwrap() = Some(reader);
        map
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let mut buffer = self.pool.get();
            match self.socket.recv_from(buffer.data_mut()).await {
                Ok((len, remote)) => {
                    buffer.data_mut().truncate(len);
                    self.dispatch(ReceivedPacket::new(remote, buffer));
                }
                // Undefined for QUIC and injectable by off-path attackers
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    debug!(error = %e, "socket read failed, stopping demultiplexer");
                    let server = self.state.lock().unwrap().server.clone();
                    if let Some(server) = server {
                        server.set_close_error(ServerError::Io(Arc::new(e)));
                    }
                    return;
                }
            }
        }
    }

    fn dispatch(&self, packet: ReceivedPacket) {
        let cid = match ConnectionId::from_datagram(packet.data(), self.connection_id_length) {
            Some(cid) => cid,
            None => {
                trace!("dropping datagram too short for a connection ID");
                return;
            }
        };
        let (handler, server) = {
            let state = self.state.lock().unwrap();
            (state.handlers.get(&cid).cloned(), state.server.clone())
        };
        if let Some(handler) = handler {
            handler.handle_packet(packet);
        } else if let Some(server) = server {
            server.handle_packet(packet);
        } else {
            trace!(dcid = %cid, "dropping packet for unknown connection");
        }
    }
}

impl Demultiplexer for PacketHandlerMap {
    fn add(&self, cid: ConnectionId, handler: Arc<dyn PacketHandler>) -> bool {
        use std::collections::hash_map::Entry;
        match self.state.lock().unwrap().handlers.entry(cid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(handler);
                true
            }
        }
    }

    fn remove(&self, cid: &ConnectionId) {
        self.state.lock().unwrap().handlers.remove(cid);
    }

    fn stateless_reset_token(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
        let signature = hmac::sign(&self.reset_key, cid);
        let mut token = [0; RESET_TOKEN_SIZE];
        token.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
        token
    }

    fn set_server(&self, server: Arc<dyn UnknownPacketHandler>) {
        self.state.lock().unwrap().server = Some(server);
    }

    fn close_server(&self) {
        self.state.lock().unwrap().server = None;
    }

    fn destroy(&self) -> io::Result<()> {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        let mut state = self.state.lock().unwrap();
        state.server = None;
        state.handlers.clear();
        Ok(())
    }
}
