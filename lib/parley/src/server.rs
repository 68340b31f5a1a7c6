use crate::config::Config;
use crate::logging;
use crate::registry::Registry;
use crate::session::{Conn, Session};
use crate::support::NetworkResult;
use crate::SocketId;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

/// Accepts connections and hands each one to a dedicated session worker,
/// enforcing the concurrent-connection cap.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry<Conn>>,
    connections: Arc<Mutex<u32>>,
    next_socket_id: SocketId,
    config: Config,
    log: logging::Logger,
}

/// Entry point of the core: binds the listener and runs the accept loop
/// until the host terminates the process.
pub fn serve(config: Config, log: &logging::Logger) -> NetworkResult<()> {
    Server::bind(config, log)?.run()
}

impl Server {
    /// Binds the listening socket and prepares the shared state. IPv4 only.
    pub fn bind(config: Config, log: &logging::Logger) -> NetworkResult<Server> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
        let log = log.new(logging::o!());

        logging::info!(log, "listening";
                       "port" => listener.local_addr().map(|addr| addr.port()).unwrap_or(config.port),
                       "max_connections" => config.max_connections,
                       "max_chatrooms" => config.max_chatrooms);

        Ok(Server {
            listener,
            registry: Arc::new(Registry::new()),
            connections: Arc::new(Mutex::new(0)),
            next_socket_id: 0,
            config,
            log,
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocking accept loop. Transient accept errors are tolerated; anything
    /// else tears the server down.
    pub fn run(mut self) -> NetworkResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(err) => match err.kind() {
                    io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset => {
                        logging::debug!(self.log, "transient accept error"; "error" => ?err);
                    }
                    _ => {
                        logging::error!(self.log, "accept failed"; "error" => ?err);
                        return Err(err.into());
                    }
                },
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        {
            let mut count = self.lock_connections();

            if *count >= self.config.max_connections {
                logging::info!(self.log, "connection limit reached, refusing connection";
                               "peer" => %peer,
                               "max_connections" => self.config.max_connections);
                drop(stream);
                return;
            }

            *count += 1;
        }

        let socket_id = self.next_socket_id;
        self.next_socket_id += 1;

        logging::info!(self.log, "connection established";
                       "peer" => %peer,
                       "socket_id" => socket_id);

        let session = Session::new(
            socket_id,
            Arc::new(stream),
            peer.ip().to_string(),
            self.registry.clone(),
            &self.log,
        );

        // The guard travels into the worker and releases the slot when the
        // session terminates, however it terminates.
        let slot = ConnectionSlot {
            connections: self.connections.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("session-{}", socket_id))
            .spawn(move || {
                let _slot = slot;
                session.run();
            });

        if let Err(err) = spawned {
            logging::error!(self.log, "failed to spawn session worker"; "error" => ?err);
        }
    }

    #[inline]
    fn lock_connections(&self) -> std::sync::MutexGuard<u32> {
        self.connections.lock().expect("Connection counter lock poisoned")
    }
}

/// Holds one admitted connection's slot in the counter.
struct ConnectionSlot {
    connections: Arc<Mutex<u32>>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut count = self
            .connections
            .lock()
            .expect("Connection counter lock poisoned");
        *count -= 1;
    }
}
