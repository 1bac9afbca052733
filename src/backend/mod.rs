//! Backend connector.
//!
//! Every proxied operation opens a fresh, short-lived backend session: TCP
//! connect, optional TLS upgrade, startup handshake, then one query (or one
//! fan-out transaction), then close. Connections never outlive the client
//! request that triggered them.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::messages::response::SslResponse;
use crate::messages::startup::{Authentication, Password, SASLInitialResponse, SASLResponse, SslRequest, Startup};
use crate::messages::{BackendMessage, FrontendMessage, Message};

pub mod auth;
pub mod endpoint;
pub mod tls;

pub use endpoint::{BackendTlsMode, Endpoint};
pub use tls::BackendTls;

/// Grace window for the polite close of a backend session.
const CLOSE_GRACE: tokio::time::Duration = tokio::time::Duration::from_secs(2);

/// Bound a backend operation by the per-query deadline.
pub(crate) async fn with_deadline<T, F>(deadline: tokio::time::Instant, fut: F) -> ProxyResult<T>
where
    F: Future<Output = ProxyResult<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::DeadlineExceeded),
    }
}

/// Plain or TLS-wrapped backend stream.
pub enum BackendSocket {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            BackendSocket::Secure(tls_socket) => Pin::new(tls_socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            BackendSocket::Secure(tls_socket) => Pin::new(tls_socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            BackendSocket::Secure(tls_socket) => Pin::new(tls_socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            BackendSocket::Secure(tls_socket) => Pin::new(tls_socket).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Default)]
pub struct BackendCodec;

impl Decoder for BackendCodec {
    type Item = BackendMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        BackendMessage::decode(src)
    }
}

impl Encoder<FrontendMessage> for BackendCodec {
    type Error = ProxyError;

    fn encode(
        &mut self,
        item: FrontendMessage,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

/// One authenticated backend session.
pub struct BackendConnection {
    socket: Framed<BackendSocket, BackendCodec>,
    endpoint: String,
    in_transaction: bool,
}

impl BackendConnection {
    /// Connect, upgrade the transport per policy and run the startup
    /// handshake. The caller bounds this with `with_deadline`.
    pub async fn connect(endpoint: &Endpoint, tls: &BackendTls) -> ProxyResult<BackendConnection> {
        let address = endpoint.address();

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ProxyError::BackendConnect {
                endpoint: address.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        let socket = match &tls.connector {
            None => BackendSocket::Plain(tcp),
            Some(connector) => ssl_handshake(tcp, endpoint, connector).await?,
        };

        let mut conn = BackendConnection {
            socket: Framed::new(socket, BackendCodec),
            endpoint: address,
            in_transaction: false,
        };
        conn.startup(endpoint).await?;

        debug!(endpoint = %conn.endpoint, "backend session established");
        Ok(conn)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn startup(&mut self, endpoint: &Endpoint) -> ProxyResult<()> {
        let mut startup = Startup::default();
        startup
            .parameters
            .insert("user".to_owned(), endpoint.user.clone());
        startup.parameters.insert(
            "database".to_owned(),
            endpoint
                .database
                .clone()
                .unwrap_or_else(|| endpoint.user.clone()),
        );
        startup
            .parameters
            .insert("application_name".to_owned(), "pgmirror".to_owned());
        self.send(FrontendMessage::Startup(startup)).await?;

        let mut scram: Option<auth::ScramClient> = None;

        loop {
            match self.receive().await? {
                BackendMessage::Authentication(Authentication::Ok) => {}
                BackendMessage::Authentication(Authentication::CleartextPassword) => {
                    let password = self.required_password(endpoint)?;
                    self.send(FrontendMessage::PasswordMessageFamily(
                        crate::messages::startup::PasswordMessageFamily::Password(Password::new(
                            password,
                        )),
                    ))
                    .await?;
                }
                BackendMessage::Authentication(Authentication::MD5Password(salt)) => {
                    let password = self.required_password(endpoint)?;
                    let hashed = auth::md5_password(&endpoint.user, &password, &salt);
                    self.send(FrontendMessage::PasswordMessageFamily(
                        crate::messages::startup::PasswordMessageFamily::Password(Password::new(
                            hashed,
                        )),
                    ))
                    .await?;
                }
                BackendMessage::Authentication(Authentication::SASL(mechanisms)) => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(ProxyError::UnsupportedSaslMechanism(mechanisms.join(",")));
                    }
                    let password = self.required_password(endpoint)?;
                    let client = auth::ScramClient::new(&password);
                    let first = client.client_first_message();
                    scram = Some(client);
                    self.send(FrontendMessage::PasswordMessageFamily(
                        crate::messages::startup::PasswordMessageFamily::SASLInitialResponse(
                            SASLInitialResponse::new(
                                "SCRAM-SHA-256".to_owned(),
                                Some(first.into_bytes().into()),
                            ),
                        ),
                    ))
                    .await?;
                }
                BackendMessage::Authentication(Authentication::SASLContinue(data)) => {
                    let client = scram
                        .as_mut()
                        .ok_or(ProxyError::BackendProtocol("sasl continue"))?;
                    let server_first = String::from_utf8_lossy(&data).into_owned();
                    let client_final = client.process_server_first(&server_first)?;
                    self.send(FrontendMessage::PasswordMessageFamily(
                        crate::messages::startup::PasswordMessageFamily::SASLResponse(
                            SASLResponse::new(client_final.into_bytes().into()),
                        ),
                    ))
                    .await?;
                }
                BackendMessage::Authentication(Authentication::SASLFinal(data)) => {
                    let client = scram
                        .as_ref()
                        .ok_or(ProxyError::BackendProtocol("sasl final"))?;
                    client.verify_server_final(&String::from_utf8_lossy(&data))?;
                }
                BackendMessage::ParameterStatus(_)
                | BackendMessage::BackendKeyData(_)
                | BackendMessage::NoticeResponse(_) => {}
                BackendMessage::ReadyForQuery(_) => return Ok(()),
                BackendMessage::ErrorResponse(resp) => return Err((&resp).into()),
                _ => return Err(ProxyError::BackendProtocol("startup")),
            }
        }
    }

    fn required_password(&self, endpoint: &Endpoint) -> ProxyResult<String> {
        endpoint.password.clone().ok_or_else(|| ProxyError::BackendConnect {
            endpoint: self.endpoint.clone(),
            reason: "backend requires a password but none is configured".to_owned(),
        })
    }

    pub async fn send(&mut self, message: FrontendMessage) -> ProxyResult<()> {
        self.socket.send(message).await
    }

    /// Read the next backend message, tracking transaction state from
    /// `ReadyForQuery`.
    pub async fn receive(&mut self) -> ProxyResult<BackendMessage> {
        match self.socket.next().await {
            Some(Ok(message)) => {
                if let BackendMessage::ReadyForQuery(ref rfq) = message {
                    self.in_transaction = rfq.status
                        != crate::messages::response::TransactionStatus::Idle;
                }
                Ok(message)
            }
            Some(Err(e)) => Err(e),
            None => Err(ProxyError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed the connection",
            ))),
        }
    }

    /// Run one simple query, discard any rows and return the first command
    /// tag. Used for transaction control and parameterless writes.
    pub async fn simple_query(&mut self, sql: &str) -> ProxyResult<String> {
        self.send(FrontendMessage::Query(
            crate::messages::simplequery::Query::new(sql.to_owned()),
        ))
        .await?;

        let mut tag = None;
        let mut error: Option<ProxyError> = None;
        loop {
            match self.receive().await? {
                BackendMessage::CommandComplete(cc) => {
                    tag.get_or_insert(cc.tag);
                }
                BackendMessage::EmptyQueryResponse(_)
                | BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::ParameterStatus(_)
                | BackendMessage::NoticeResponse(_) => {}
                BackendMessage::ErrorResponse(resp) => {
                    error.get_or_insert((&resp).into());
                }
                BackendMessage::ReadyForQuery(_) => break,
                _ => return Err(ProxyError::BackendProtocol("simple query")),
            }
        }

        if let Some(error) = error {
            Err(error)
        } else {
            tag.ok_or(ProxyError::BackendProtocol("simple query"))
        }
    }

    /// Execute one parameterized statement over the extended protocol,
    /// discarding rows and returning the command tag.
    pub async fn extended_query(
        &mut self,
        sql: &str,
        param_types: &[crate::messages::Oid],
        parameters: &[Option<bytes::Bytes>],
        parameter_format_codes: &[i16],
    ) -> ProxyResult<String> {
        use crate::messages::extendedquery::{Bind, Execute, Parse, Sync};

        self.socket
            .feed(FrontendMessage::Parse(Parse::new(
                None,
                sql.to_owned(),
                param_types.to_vec(),
            )))
            .await?;
        self.socket
            .feed(FrontendMessage::Bind(Bind::new(
                None,
                None,
                parameter_format_codes.to_vec(),
                parameters.to_vec(),
                vec![],
            )))
            .await?;
        self.socket
            .feed(FrontendMessage::Execute(Execute::new(None, 0)))
            .await?;
        self.socket.send(FrontendMessage::Sync(Sync)).await?;

        let mut tag = None;
        let mut error: Option<ProxyError> = None;
        loop {
            match self.receive().await? {
                BackendMessage::ParseComplete(_)
                | BackendMessage::BindComplete(_)
                | BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::NoData(_)
                | BackendMessage::ParameterStatus(_)
                | BackendMessage::NoticeResponse(_)
                | BackendMessage::EmptyQueryResponse(_)
                | BackendMessage::PortalSuspended(_) => {}
                BackendMessage::CommandComplete(cc) => {
                    tag.get_or_insert(cc.tag);
                }
                BackendMessage::ErrorResponse(resp) => {
                    error.get_or_insert((&resp).into());
                }
                BackendMessage::ReadyForQuery(_) => break,
                _ => return Err(ProxyError::BackendProtocol("extended query")),
            }
        }

        if let Some(error) = error {
            Err(error)
        } else {
            tag.ok_or(ProxyError::BackendProtocol("extended query"))
        }
    }

    /// Close the session on the return path: roll back a live transaction,
    /// send Terminate, drop the socket. Bounded by a short grace window so
    /// a dead backend cannot stall the session; failures here are not
    /// actionable.
    pub async fn close(&mut self) {
        let grace = tokio::time::Instant::now() + CLOSE_GRACE;
        let _ = tokio::time::timeout_at(grace, async {
            if self.in_transaction {
                let _ = self.simple_query("ROLLBACK").await;
            }
            let _ = self
                .socket
                .send(FrontendMessage::Terminate(
                    crate::messages::terminate::Terminate,
                ))
                .await;
            let _ = self.socket.close().await;
        })
        .await;
    }
}

/// Negotiate TLS with the backend: send the sentinel, expect `S`, wrap the
/// stream. A refusal is an error because every encrypted mode requires
/// encryption.
async fn ssl_handshake(
    mut tcp: TcpStream,
    endpoint: &Endpoint,
    connector: &tokio_rustls::TlsConnector,
) -> ProxyResult<BackendSocket> {
    let mut request = bytes::BytesMut::new();
    SslRequest::new().encode(&mut request)?;
    tcp.write_all(&request).await?;

    let mut reply = [0u8; 1];
    tcp.read_exact(&mut reply).await?;
    match reply[0] {
        SslResponse::BYTE_ACCEPT => {
            let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|_| {
                ProxyError::Config(format!("invalid backend host name {:?}", endpoint.host))
            })?;
            let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
                ProxyError::BackendConnect {
                    endpoint: endpoint.address(),
                    reason: format!("tls handshake failed: {}", e),
                }
            })?;
            Ok(BackendSocket::Secure(Box::new(tls_stream)))
        }
        SslResponse::BYTE_REFUSE => Err(ProxyError::BackendConnect {
            endpoint: endpoint.address(),
            reason: "backend refused TLS".to_owned(),
        }),
        other => Err(ProxyError::InvalidMessageType(other)),
    }
}
