//! Server dispatcher.
//!
//! Owns the listen sockets and the main completion ring, runs the
//! accept/read loop, hands finished request heads to the worker pool
//! and orchestrates graceful shutdown. Accept SQEs are tagged with a
//! pointer into the listener array and recognised by pointer range;
//! every other submission carries a boxed [`ServerEvent`].

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use io_ring::{AcceptResult, Cqe, RecvResult, Ring};
use tracing::{debug, info, warn};

use protocol_http::StatusCode;

use crate::config::Config;
use crate::error::ServerError;
use crate::event::ServerEvent;
use crate::router::Router;
use crate::session::{Session, Transport};
use crate::shared::ServerShared;
use crate::stream::Stream;
use crate::transaction::Transaction;
use crate::worker::{TransactionContext, WorkQueue, WorkerPool};

struct Listener {
    socket: socket2::Socket,
    transport: Transport,
    addr: Option<SocketAddr>,
}

/// An unbound server: configuration plus routing table.
pub struct Server {
    config: Config,
    router: Arc<Router>,
}

impl Server {
    pub fn new(config: Config, router: Router) -> Server {
        Server {
            config,
            router: Arc::new(router),
        }
    }

    /// Bind the listen sockets and set up the ring and worker pool.
    pub fn bind(self) -> Result<BoundServer, ServerError> {
        if self.config.listener.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let mut listeners = Vec::with_capacity(self.config.listener.len());
        for entry in &self.config.listener {
            if let Some(addr) = entry.address {
                let socket = bind_tcp(addr)?;
                let local = socket.local_addr()?.as_socket();
                listeners.push(Listener {
                    socket,
                    transport: Transport::Tcp,
                    addr: local,
                });
            }
            if let Some(path) = &entry.path {
                let socket = bind_unix(path)?;
                listeners.push(Listener {
                    socket,
                    transport: Transport::Unix,
                    addr: None,
                });
            }
        }
        if listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let ring = Ring::with_backend(self.config.ring.entries, self.config.ring.backend)?;
        info!(backend = %ring.backend(), listeners = listeners.len(), "server bound");

        let work = WorkQueue::new(self.config.workers.queue_depth);
        let workers = WorkerPool::spawn(work.clone(), self.config.workers.threads);
        let shared = ServerShared::new(
            ring.submitter(),
            self.config.keep_alive.clone(),
            work,
            self.router,
            self.config.ring.sub_entries,
        );

        Ok(BoundServer {
            listeners: listeners.into_boxed_slice(),
            ring,
            shared,
            workers: Some(workers),
            sessions: Vec::new(),
        })
    }
}

/// A bound server ready to run its dispatch loop.
pub struct BoundServer {
    listeners: Box<[Listener]>,
    ring: Ring,
    shared: Arc<ServerShared>,
    workers: Option<WorkerPool>,
    sessions: Vec<Arc<Session>>,
}

/// Cloneable handle that requests shutdown.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<ServerShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl BoundServer {
    /// The first TCP listener's bound address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(|l| l.addr)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the dispatch loop until [`StopHandle::stop`] is called.
    pub fn run(mut self) -> Result<(), ServerError> {
        parklot::init();

        for index in 0..self.listeners.len() {
            let user_data = self.listener_user_data(index);
            let fd = self.listeners[index].socket.as_raw_fd();
            self.ring.accept(fd, user_data)?;
        }
        self.ring.submit()?;

        let result = self.dispatch_loop();

        // Wake handlers blocked on stream input before joining the
        // workers, and only close the sockets after every transaction
        // has finished its drop-time writes.
        for session in &self.sessions {
            if let Some(stream) = session.current_stream() {
                stream.remote_closed();
            }
            session.close();
        }
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        for session in self.sessions.drain(..) {
            unsafe { libc::close(session.fd) };
        }
        info!("server stopped");
        result
    }

    fn dispatch_loop(&mut self) -> Result<(), ServerError> {
        loop {
            let cqe = self.ring.wait_cqe()?;
            let keep_running = self.handle_cqe(cqe)?;
            // A blocked submitter may be waiting for the SQ room this
            // completion just created.
            self.shared.signal_sq_available();
            if !keep_running {
                return Ok(());
            }
        }
    }

    fn handle_cqe(&mut self, cqe: Cqe) -> Result<bool, ServerError> {
        if cqe.user_data == 0 {
            return Ok(true);
        }
        if let Some(index) = self.listener_index(cqe.user_data) {
            self.handle_accept(index, cqe)?;
            return Ok(true);
        }

        // Safety: every non-zero, non-listener tag on this ring was
        // produced by ServerEvent::into_user_data and is reclaimed
        // exactly once, here.
        let event = unsafe { ServerEvent::from_user_data(cqe.user_data) };
        match *event {
            ServerEvent::ReadBuffer { session } => {
                self.handle_read(&session, cqe)?;
            }
            ServerEvent::CloseStream { session, stream } => {
                self.handle_close_stream(session, stream)?;
            }
            ServerEvent::CancelReadBuffer { session } => {
                debug!(fd = session.fd, result = ?cqe.as_cancel(), "read cancel completed");
                self.finish_session_if_closing(&session);
            }
            ServerEvent::CheckServerStatus => {
                if self.shared.stopping() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn listener_user_data(&self, index: usize) -> u64 {
        &self.listeners[index] as *const Listener as u64
    }

    /// Accept completions are identified by their tag falling inside
    /// the listener array.
    fn listener_index(&self, user_data: u64) -> Option<usize> {
        let base = self.listeners.as_ptr() as u64;
        let size = std::mem::size_of::<Listener>() as u64;
        let end = base + size * self.listeners.len() as u64;
        if user_data < base || user_data >= end {
            return None;
        }
        let offset = user_data - base;
        if offset % size != 0 {
            return None;
        }
        Some((offset / size) as usize)
    }

    fn handle_accept(&mut self, index: usize, cqe: Cqe) -> Result<(), ServerError> {
        // Re-arm before handling so the listener never goes quiet.
        let user_data = self.listener_user_data(index);
        let fd = self.listeners[index].socket.as_raw_fd();
        match self.ring.accept(fd, user_data) {
            Ok(()) => {}
            Err(io_ring::Error::SubmissionQueueFull) => {
                self.ring.submit()?;
                self.ring.accept(fd, user_data)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.ring.submit()?;

        match cqe.as_accept() {
            AcceptResult::Fd(conn_fd) => {
                set_nonblocking(conn_fd);
                let transport = self.listeners[index].transport;
                if let Err(e) = self.setup_new_session(conn_fd, transport) {
                    warn!(fd = conn_fd, error = %e, "session setup failed");
                    unsafe { libc::close(conn_fd) };
                }
            }
            AcceptResult::Again => {}
            other => warn!(result = ?other, "accept failed"),
        }
        Ok(())
    }

    fn setup_new_session(&mut self, fd: RawFd, transport: Transport) -> Result<(), ServerError> {
        let session = Session::new(fd, transport, self.shared.clone());
        session.open_stream(&self.ring)?;
        session.set_read_buffer()?;
        debug!(fd, ?transport, "session created");
        self.sessions.push(session);
        Ok(())
    }

    fn handle_read(&mut self, session: &Arc<Session>, cqe: Cqe) -> Result<(), ServerError> {
        match cqe.as_recv() {
            RecvResult::Bytes(0) => {
                session.discard_read();
                if let Some(stream) = session.current_stream() {
                    stream.remote_closed();
                }
                session.close();
                self.finish_session_if_closing(session);
            }
            RecvResult::Bytes(n) => {
                let Some(slice) = session.take_read_slice(n) else {
                    return Ok(());
                };
                let Some(stream) = session.current_stream() else {
                    return Ok(());
                };
                stream.push_input(slice);
                if stream.has_transaction() {
                    // Body bytes for the in-flight transaction; its
                    // reader was woken by push_input and re-arms reads
                    // itself.
                    return Ok(());
                }
                match stream.process_input() {
                    Ok(Some(transaction)) => {
                        dispatch_transaction(&self.shared, transaction);
                    }
                    Ok(None) => {
                        // Head incomplete; keep reading.
                        session.set_read_buffer()?;
                    }
                    Err(e) => {
                        debug!(fd = session.fd, error = %e, "request parse failed");
                        let _ = stream.write_slice(protocol_http::BAD_REQUEST);
                        stream.close();
                        session.close();
                        self.finish_session_if_closing(session);
                    }
                }
            }
            RecvResult::Cancelled => {
                session.discard_read();
                self.finish_session_if_closing(session);
            }
            RecvResult::Again => {
                session.discard_read();
                session.set_read_buffer()?;
            }
            other => {
                debug!(fd = session.fd, result = ?other, "recv failed");
                session.discard_read();
                if let Some(stream) = session.current_stream() {
                    stream.remote_closed();
                }
                session.close();
                self.finish_session_if_closing(session);
            }
        }
        Ok(())
    }

    fn handle_close_stream(
        &mut self,
        session: Arc<Session>,
        stream: Arc<Stream>,
    ) -> Result<(), ServerError> {
        if stream.has_transaction() {
            // Still in flight: revisit on a later loop turn.
            let event = Box::new(ServerEvent::CloseStream {
                session,
                stream,
            });
            let user_data = event.into_user_data();
            if let Err(e) = self
                .shared
                .submit_with_retry(|| self.shared.submitter.nop(user_data))
            {
                debug!(error = %e, "close-stream repost failed");
                drop(unsafe { ServerEvent::from_user_data(user_data) });
            }
            return Ok(());
        }

        let remaining = session.remove_stream(&stream);
        debug!(fd = session.fd, stream = stream.id, remaining, "stream removed");
        if remaining == 0 {
            session.close();
        }
        self.finish_session_if_closing(&session);
        Ok(())
    }

    /// Destroy the session once nothing keeps it alive: close the
    /// socket through the ring (tag zero: the completion is ignored).
    fn finish_session_if_closing(&mut self, session: &Arc<Session>) {
        if !session.check_closing() {
            return;
        }
        session.mark_closed();
        let before = self.sessions.len();
        self.sessions.retain(|s| !Arc::ptr_eq(s, session));
        if self.sessions.len() == before {
            // Already destroyed on an earlier event.
            return;
        }
        if self.ring.close_fd(session.fd, 0).is_err() {
            unsafe { libc::close(session.fd) };
        } else {
            let _ = self.ring.submit();
        }
        debug!(fd = session.fd, "session destroyed");
    }
}

/// Hand a transaction to the worker pool; a full queue is answered
/// with 429 right here on the dispatching thread.
pub(crate) fn dispatch_transaction(shared: &Arc<ServerShared>, transaction: Transaction) {
    let ctx = TransactionContext {
        transaction,
        router: shared.router.clone(),
    };
    if let Err(mut rejected) = shared.work.try_push(ctx) {
        warn!("worker queue full, responding 429");
        rejected
            .transaction
            .reset_response(StatusCode::TOO_MANY_REQUESTS);
        if let Err(e) = rejected.transaction.write_body_no_content() {
            debug!(error = %e, "429 write failed");
        }
        drop(rejected);
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket)
}

fn bind_unix(path: &std::path::Path) -> io::Result<socket2::Socket> {
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(path);
    let socket = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::unix(path)?)?;
    socket.listen(256)?;
    Ok(socket)
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Embedded serve helper: bind, then run the dispatcher on a spawned
/// thread. Mostly used by tests and examples.
pub struct Serve {
    addr: SocketAddr,
    stop: StopHandle,
    thread: std::thread::JoinHandle<Result<(), ServerError>>,
}

impl Serve {
    /// Serve `router` on an ephemeral local port.
    pub fn start(router: Router) -> Result<Serve, ServerError> {
        Self::start_with_config(Config::local(), router)
    }

    pub fn start_with_config(config: Config, router: Router) -> Result<Serve, ServerError> {
        let bound = Server::new(config, router).bind()?;
        let addr = bound.local_addr().ok_or(ServerError::NoListeners)?;
        let stop = bound.stop_handle();
        let thread = std::thread::Builder::new()
            .name("http-dispatch".to_string())
            .spawn(move || bound.run())
            .map_err(ServerError::Io)?;
        Ok(Serve { addr, stop, thread })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the dispatcher and wait for it to finish.
    pub fn stop(self) -> Result<(), ServerError> {
        self.stop.stop();
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(ServerError::Io(io::Error::other("dispatcher panicked"))),
        }
    }
}
