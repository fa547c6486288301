use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{Arc, Mutex},
};

use mio::net::TcpListener;
use strand_core::{Channel, LoopHandle};
use tracing::{debug, error, info};

pub type NewConnectionCallback = Box<dyn Fn(mio::net::TcpStream, SocketAddr) + Send>;

/// Listening socket plus its channel; accepted sockets are handed to
/// the owning server untouched.
pub struct Acceptor {
    loop_: LoopHandle,
    listener: TcpListener,
    channel: Arc<Channel>,
    listen_addr: SocketAddr,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(loop_: &LoopHandle, listen_addr: SocketAddr) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr)?;
        let local_addr = listener.local_addr()?;
        let channel = Channel::new(loop_, listener.as_raw_fd());
        info!(%local_addr, "listening");
        Ok(Arc::new(Self {
            loop_: loop_.clone(),
            listener,
            channel,
            listen_addr: local_addr,
            on_connection: Mutex::new(None),
        }))
    }

    /// The bound address; useful when listening on port 0.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock().unwrap() = Some(callback);
    }

    /// Starts accepting; runs on the owning loop.
    pub fn listen(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || {
            let acceptor = Arc::clone(&me);
            me.channel.set_read_callback(Box::new(move || acceptor.handle_read()));
            me.channel.enable_reading();
            debug!(addr = %me.listen_addr, "acceptor armed");
        });
    }

    pub fn stop(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || {
            me.channel.disable_all();
            me.channel.remove();
        });
    }

    fn handle_read(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "accepted");
                    let callbacks = self.on_connection.lock().unwrap();
                    if let Some(cb) = callbacks.as_ref() {
                        cb(stream, peer_addr);
                    } else {
                        // Nobody to adopt the socket; closing it is the
                        // only safe answer.
                        drop(stream);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(?err, "accept failed");
                    break;
                }
            }
        }
    }
}
