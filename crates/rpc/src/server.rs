//! RPC server: service map, accept loop and per-connection dispatch.

use crate::codec::{CodecReader, CodecType, CodecWriter};
use crate::error::{ConnectionError, Error, HandlerError, Result};
use crate::options::Options;
use crate::protocol::{Handshake, Header, framing};
use crate::service::{Argv, MethodType, Service, is_exported};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<Mutex<CodecWriter>>;

/// A request whose service, method and argument have been resolved.
struct Request {
    header: Header,
    service: Arc<Service>,
    method: Arc<MethodType>,
    argv: Argv,
}

/// Why a request could not be dispatched.
enum ReadFailure {
    /// The header could not be read; the connection is done.
    Fatal,
    /// This request failed but the stream is still aligned.
    Request { header: Header, error: HandlerError },
}

/// Serves registered services to any number of connections.
///
/// Cloning is cheap; clones share the same service map.
#[derive(Debug, Clone, Default)]
pub struct Server {
    services: Arc<DashMap<String, Arc<Service>>>,
}

impl Server {
    /// Create a server with no services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not an exported identifier or a
    /// service with the same name is already registered.
    pub fn register(&self, service: impl Into<Service>) -> Result<()> {
        let service = service.into();
        if !is_exported(service.name()) {
            return Err(HandlerError::InvalidServiceName(service.name().to_string()).into());
        }

        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(HandlerError::DuplicateService(entry.key().clone()).into()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Look a registered service up by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn find_service(
        &self,
        service_method: &str,
    ) -> std::result::Result<(Arc<Service>, Arc<MethodType>), HandlerError> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| HandlerError::IllFormed(service_method.to_string()))?;
        let service = self
            .service(service_name)
            .ok_or_else(|| HandlerError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| HandlerError::MethodNotFound(method_name.to_string()))?;
        Ok((service, method))
    }

    /// Accept connections until the listener fails, serving each on its own
    /// task.
    pub async fn accept(&self, listener: TcpListener) {
        self.accept_until(listener, CancellationToken::new()).await;
    }

    /// Accept connections until the listener fails or `shutdown` fires.
    ///
    /// Connections already accepted keep being served.
    pub async fn accept_until(&self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("rpc server: connection from {}", addr);
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_conn(stream).await;
                            debug!("rpc server: connection from {} closed", addr);
                        });
                    }
                    Err(e) => {
                        error!("rpc server: accept error: {}", e);
                        return;
                    }
                },
                () = shutdown.cancelled() => {
                    info!("rpc server: shutdown requested");
                    return;
                }
            }
        }
    }

    /// Serve one connection until its client goes away.
    ///
    /// Reads the handshake first; a foreign magic number or an unknown codec
    /// closes the connection before any request is read. Returns once the
    /// stream ends and every in-flight request has been answered.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut frames_in, mut frames_out) = framing::split(stream);

        let options = match Handshake::receive(&mut frames_in)
            .await
            .and_then(Handshake::negotiate)
        {
            Ok(options) => options,
            Err(e) => {
                warn!("rpc server: options error: {}", e);
                let _ = frames_out.get_mut().shutdown().await;
                return;
            }
        };
        debug!(
            "rpc server: negotiated codec {} with handle timeout {:?}",
            options.codec_type, options.handle_timeout
        );

        let reader = CodecReader::new(frames_in, options.codec_type);
        let writer = CodecWriter::new(frames_out, options.codec_type);
        self.serve_codec(reader, writer, options).await;
    }

    async fn serve_codec(&self, mut reader: CodecReader, writer: CodecWriter, options: Options) {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let tracker = TaskTracker::new();

        loop {
            match self.read_request(&mut reader).await {
                Ok(request) => {
                    tracker.spawn(handle_request(
                        request,
                        Arc::clone(&writer),
                        options.codec_type,
                        options.handle_timeout,
                    ));
                }
                Err(ReadFailure::Request { header, error }) => {
                    send_response(&writer, header, Err(error)).await;
                }
                Err(ReadFailure::Fatal) => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        let _ = writer.lock().await.close().await;
    }

    async fn read_request(
        &self,
        reader: &mut CodecReader,
    ) -> std::result::Result<Request, ReadFailure> {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(Error::Connection(ConnectionError::Closed)) => return Err(ReadFailure::Fatal),
            Err(e) => {
                warn!("rpc server: read header error: {}", e);
                return Err(ReadFailure::Fatal);
            }
        };

        let (service, method) = match self.find_service(&header.service_method) {
            Ok(found) => found,
            Err(error) => {
                if let Err(e) = reader.discard_body().await {
                    warn!("rpc server: read body error: {}", e);
                    return Err(ReadFailure::Fatal);
                }
                return Err(ReadFailure::Request { header, error });
            }
        };

        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => {
                warn!("rpc server: read body error: {}", e);
                return Err(ReadFailure::Fatal);
            }
        };

        match method.new_argv(reader.codec_type(), &body) {
            Ok(argv) => Ok(Request {
                header,
                service,
                method,
                argv,
            }),
            Err(e) => {
                warn!("rpc server: read argv err: {}", e);
                Err(ReadFailure::Request {
                    header,
                    error: HandlerError::InvalidArgument(e.to_string()),
                })
            }
        }
    }
}

/// Run one request's handler and send its single response.
///
/// The handler runs on its own task. With a non-zero `handle_timeout` the
/// response is a timeout error once the timer fires first; the handler's
/// later result is dropped.
async fn handle_request(
    request: Request,
    writer: SharedWriter,
    codec: CodecType,
    handle_timeout: Duration,
) {
    let Request {
        header,
        service,
        method,
        argv,
    } = request;

    let (done_tx, done_rx) = oneshot::channel();
    let call = service.call(&method, codec, argv);
    tokio::spawn(async move {
        let _ = done_tx.send(call.await);
    });

    let outcome = if handle_timeout.is_zero() {
        done_rx.await.unwrap_or(Err(HandlerError::Panicked))
    } else {
        match timeout(handle_timeout, done_rx).await {
            Ok(done) => done.unwrap_or(Err(HandlerError::Panicked)),
            Err(_) => {
                warn!(
                    "rpc server: {} seq {} exceeded handle timeout {:?}",
                    header.service_method, header.seq, handle_timeout
                );
                Err(HandlerError::HandleTimeout(handle_timeout))
            }
        }
    };

    send_response(&writer, header, outcome).await;
}

/// Write one response; an error outcome goes out as header text with a unit
/// body.
async fn send_response(
    writer: &Mutex<CodecWriter>,
    mut header: Header,
    outcome: std::result::Result<Bytes, HandlerError>,
) {
    let mut writer = writer.lock().await;
    let result = match outcome {
        Ok(body) => writer.write_encoded(&header, body).await,
        Err(error) => {
            header.error = error.to_string();
            writer.write(&header, &()).await
        }
    };

    if let Err(e) = result {
        warn!("rpc server: write response error: {}", e);
    }
}
