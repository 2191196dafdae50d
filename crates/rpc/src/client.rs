//! RPC client: call multiplexing over one connection.
//!
//! Every call gets a sequence number and a slot in the pending table. A
//! single receive task reads responses, matches them to pending calls by
//! sequence number and completes each call exactly once. The first read
//! failure fails every call still pending and leaves the client unusable.

use crate::codec::{CodecReader, CodecType, CodecWriter};
use crate::error::{ConnectionError, Error, Result};
use crate::options::{MAGIC_NUMBER, Options};
use crate::protocol::{Handshake, Header, framing};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the completion channel `go` creates when none is supplied.
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// How long `close` waits for an in-flight write before giving up on it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A completed call.
#[derive(Debug)]
pub struct Call {
    /// Sequence number the call was sent under.
    pub seq: u64,
    /// `"Service.Method"` the call addressed.
    pub service_method: String,
    codec: CodecType,
    outcome: Result<Bytes>,
}

impl Call {
    /// The call's error, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }

    /// Decode the reply.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or a codec error if the reply does not
    /// decode into `R`.
    pub fn into_reply<R: DeserializeOwned>(self) -> Result<R> {
        self.codec.decode(&self.outcome?)
    }
}

/// Handle on a call issued with [`Client::go`].
#[derive(Debug)]
pub struct AsyncCall {
    seq: u64,
    service_method: String,
    done: Option<mpsc::Receiver<Call>>,
}

impl AsyncCall {
    /// Sequence number of the call; zero if it was never registered.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// `"Service.Method"` the call addresses.
    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the completion.
    ///
    /// Returns `None` when the completion goes to a caller-supplied channel,
    /// or when the call was abandoned.
    pub async fn done(&mut self) -> Option<Call> {
        match &mut self.done {
            Some(done) => done.recv().await,
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    /// Closed by the user.
    Closing,
    /// The connection failed.
    Shutdown,
}

struct Pending {
    service_method: String,
    done: mpsc::Sender<Call>,
}

struct State {
    seq: u64,
    pending: HashMap<u64, Pending>,
    status: Status,
}

struct Shared {
    codec: CodecType,
    sending: Mutex<CodecWriter>,
    state: parking_lot::Mutex<State>,
    shutdown: CancellationToken,
}

impl Shared {
    fn register_call(&self, service_method: &str, done: mpsc::Sender<Call>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.status != Status::Active {
            return Err(Error::Shutdown);
        }

        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(
            seq,
            Pending {
                service_method: service_method.to_string(),
                done,
            },
        );
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Pending> {
        self.state.lock().pending.remove(&seq)
    }

    fn complete(&self, seq: u64, pending: Pending, outcome: Result<Bytes>) {
        let call = Call {
            seq,
            service_method: pending.service_method,
            codec: self.codec,
            outcome,
        };
        match pending.done.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                debug!(
                    "rpc client: done channel full, deferring completion of {} seq {}",
                    call.service_method, call.seq
                );
                let done = pending.done;
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(call)) = done.send(call).await {
                        debug!(
                            "rpc client: nobody waiting for {} seq {}",
                            call.service_method, call.seq
                        );
                    }
                });
            }
            Err(TrySendError::Closed(call)) => debug!(
                "rpc client: nobody waiting for {} seq {}",
                call.service_method, call.seq
            ),
        }
    }

    /// Fail every pending call and mark the client unusable.
    fn terminate_calls(&self, reason: &str) {
        let (user_closed, pending) = {
            let mut state = self.state.lock();
            let user_closed = state.status == Status::Closing;
            state.status = Status::Shutdown;
            (user_closed, std::mem::take(&mut state.pending))
        };

        for (seq, pending) in pending {
            let error = if user_closed {
                Error::Shutdown
            } else {
                ConnectionError::Lost(reason.to_string()).into()
            };
            self.complete(seq, pending, Err(error));
        }
    }
}

/// A client bound to one connection.
///
/// Calls may be issued concurrently from any number of tasks. Dropping the
/// client closes the connection.
pub struct Client {
    shared: Arc<Shared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.shared.codec)
            .field("status", &self.shared.state.lock().status)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Perform the client side of the handshake on `stream` and start the
    /// receive loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake cannot be written.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frames_in, mut frames_out) = framing::split(stream);
        if let Err(e) = Handshake::from(&options).send(&mut frames_out).await {
            warn!("rpc client: options error: {}", e);
            return Err(e);
        }

        let codec = options.codec_type;
        let shared = Arc::new(Shared {
            codec,
            sending: Mutex::new(CodecWriter::new(frames_out, codec)),
            state: parking_lot::Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                status: Status::Active,
            }),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(receive(Arc::clone(&shared), CodecReader::new(frames_in, codec)));

        Ok(Self { shared })
    }

    /// Whether the client still accepts calls.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.state.lock().status == Status::Active
    }

    /// Close the connection. Pending calls fail with [`Error::Shutdown`].
    ///
    /// A write stuck behind a peer that stopped reading is abandoned after
    /// a short wait; the receive loop closes the stream once it exits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the client is already closed or its
    /// connection has failed.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.status != Status::Active {
                return Err(Error::Shutdown);
            }
            state.status = Status::Closing;
        }
        self.shared.shutdown.cancel();

        let close = async { self.shared.sending.lock().await.close().await };
        match timeout(CLOSE_TIMEOUT, close).await {
            Ok(result) => result,
            Err(_) => {
                warn!("rpc client: close gave up waiting for a pending write");
                Ok(())
            }
        }
    }

    /// Issue a call without waiting for it.
    ///
    /// The completion is delivered to `done` if given, otherwise to a channel
    /// of capacity [`DEFAULT_DONE_CAPACITY`] owned by the returned handle. A
    /// completion that finds `done` full is delivered once the channel has
    /// room.
    pub fn go<A>(
        &self,
        service_method: &str,
        args: &A,
        done: Option<mpsc::Sender<Call>>,
    ) -> AsyncCall
    where
        A: Serialize + ?Sized,
    {
        let (done, receiver) = match done {
            Some(done) => (done, None),
            None => {
                let (tx, rx) = mpsc::channel(DEFAULT_DONE_CAPACITY);
                (tx, Some(rx))
            }
        };
        let mut call = AsyncCall {
            seq: 0,
            service_method: service_method.to_string(),
            done: receiver,
        };

        let seq = match self.shared.register_call(service_method, done.clone()) {
            Ok(seq) => seq,
            Err(e) => {
                let pending = Pending {
                    service_method: service_method.to_string(),
                    done,
                };
                self.shared.complete(0, pending, Err(e));
                return call;
            }
        };
        call.seq = seq;

        let body = match self.shared.codec.encode(args) {
            Ok(body) => body,
            Err(e) => {
                if let Some(pending) = self.shared.remove_call(seq) {
                    self.shared.complete(seq, pending, Err(e));
                }
                return call;
            }
        };

        let shared = Arc::clone(&self.shared);
        let header = Header::request(service_method, seq);
        tokio::spawn(async move {
            let result = shared.sending.lock().await.write_encoded(&header, body).await;
            if let Err(e) = result {
                if let Some(pending) = shared.remove_call(seq) {
                    shared.complete(seq, pending, Err(e));
                }
            }
        });

        call
    }

    /// Call and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or a transport or codec error.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_until(service_method, args, future::pending()).await
    }

    /// Call and wait for the reply at most `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the deadline expires first, otherwise as
    /// [`Client::call`].
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        deadline: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let expired = async move {
            tokio::time::sleep(deadline).await;
            Error::Timeout(deadline)
        };
        self.call_until(service_method, args, expired).await
    }

    /// Call and wait for the reply until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the token fires first, otherwise as
    /// [`Client::call`].
    pub async fn call_with_cancel<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let cancelled = async {
            cancel.cancelled().await;
            Error::Cancelled
        };
        self.call_until(service_method, args, cancelled).await
    }

    async fn call_until<A, R, F>(&self, service_method: &str, args: &A, stop: F) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
        F: Future<Output = Error>,
    {
        let mut call = self.go(service_method, args, None);
        let seq = call.seq();
        tokio::select! {
            biased;
            done = call.done() => done.ok_or(Error::Shutdown)?.into_reply(),
            error = stop => {
                self.shared.remove_call(seq);
                Err(error)
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == Status::Active {
                state.status = Status::Closing;
            }
        }
        self.shared.shutdown.cancel();
    }
}

/// Read responses until the connection fails or the client is closed.
async fn receive(shared: Arc<Shared>, mut reader: CodecReader) {
    let reason = loop {
        let header = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break "client closed".to_string(),
            header = reader.read_header() => match header {
                Ok(header) => header,
                Err(e) => break e.to_string(),
            },
        };

        let Some(pending) = shared.remove_call(header.seq) else {
            // Cancelled or never issued.
            if let Err(e) = reader.discard_body().await {
                break e.to_string();
            }
            continue;
        };

        if header.is_error() {
            let discarded = reader.discard_body().await;
            shared.complete(header.seq, pending, Err(Error::from_remote(header.error)));
            if let Err(e) = discarded {
                break e.to_string();
            }
            continue;
        }

        match reader.read_body().await {
            Ok(body) => shared.complete(header.seq, pending, Ok(body)),
            Err(e) => {
                let reason = format!("reading body {e}");
                shared.complete(header.seq, pending, Err(e));
                break reason;
            }
        }
    };

    debug!("rpc client: receive loop finished: {}", reason);
    shared.terminate_calls(&reason);
    let _ = shared.sending.lock().await.close().await;
}

/// Connect to `addr` over TCP and perform the handshake.
///
/// The protocol magic number is always used, whatever `options` carries.
///
/// # Errors
///
/// Returns an error if connecting fails or connecting plus handshake takes
/// longer than a non-zero connect timeout.
pub async fn dial(addr: &str, options: Options) -> Result<Client> {
    let options = Options {
        magic_number: MAGIC_NUMBER,
        ..options
    };
    dial_timeout(Client::new::<TcpStream>, addr, options).await
}

pub(crate) async fn dial_timeout<F, Fut>(new_client: F, addr: &str, options: Options) -> Result<Client>
where
    F: FnOnce(TcpStream, Options) -> Fut,
    Fut: Future<Output = Result<Client>>,
{
    let connect = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;
        new_client(stream, options).await
    };

    if options.connect_timeout.is_zero() {
        return connect.await;
    }
    timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(options.connect_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::service::Service;
    use tokio::net::TcpListener;

    struct Bar;

    impl Bar {
        async fn timeout(self: Arc<Self>, _args: i64) -> std::result::Result<i64, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }

        async fn echo(self: Arc<Self>, args: i64) -> std::result::Result<i64, String> {
            Ok(args)
        }
    }

    async fn connect(options: Options) -> Client {
        let server = Server::new();
        server
            .register(
                Service::from_receiver(Bar)
                    .method("Timeout", Bar::timeout)
                    .method("Echo", Bar::echo),
            )
            .unwrap();

        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { server.serve_conn(server_end).await });
        Client::new(client_end, options).await.unwrap()
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_call() {
        let client = connect(Options::default()).await;

        let err = client
            .call_with_timeout::<_, i64>("Bar.Timeout", &1, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_available());
        assert_eq!(client.call::<_, i64>("Bar.Echo", &7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_call() {
        let client = connect(Options::default()).await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = client
            .call_with_cancel::<_, i64>("Bar.Timeout", &1, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one() {
        let client = connect(Options::default()).await;

        let mut first = client.go("Bar.Echo", &1, None);
        let mut second = client.go("Bar.Echo", &2, None);

        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        assert_eq!(first.done().await.unwrap().into_reply::<i64>().unwrap(), 1);
        assert_eq!(second.done().await.unwrap().into_reply::<i64>().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let client = connect(Options::default()).await;

        client.close().await.unwrap();

        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(Error::Shutdown)));
        assert!(matches!(
            client.call::<_, i64>("Bar.Echo", &1).await,
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let client = connect(Options::default()).await;

        let mut call = client.go("Bar.Timeout", &1, None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();

        let done = call.done().await.unwrap();
        assert!(matches!(done.error(), Some(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_full_done_channel_delivers_every_completion() {
        let client = connect(Options::default()).await;
        let (tx, mut rx) = mpsc::channel(1);

        for i in 0..3_i64 {
            client.go("Bar.Echo", &i, Some(tx.clone()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let done = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(done.error().is_none());
            seqs.push(done.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_stuck_write() {
        let (client_end, _server_end) = tokio::io::duplex(1024);
        let client = Client::new(client_end, Options::default()).await.unwrap();

        let mut call = client.go("Bar.Echo", &vec![0_u8; 64 * 1024], None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(5), client.close())
            .await
            .unwrap()
            .unwrap();
        let done = timeout(Duration::from_secs(5), call.done())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(done.error(), Some(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let slow = |_stream: TcpStream, _options: Options| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Err(Error::Shutdown)
        };
        let options = Options::default().with_connect_timeout(Duration::from_millis(100));
        let err = dial_timeout(slow, &addr, options).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectTimeout(_))
        ));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_dial_without_timeout_waits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let slow = |_stream: TcpStream, _options: Options| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err(Error::Shutdown)
        };
        let options = Options::default().with_connect_timeout(Duration::ZERO);
        let err = dial_timeout(slow, &addr, options).await.unwrap_err();

        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial(&addr, Options::default()).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::ConnectFailed { .. })
        ));
    }
}
