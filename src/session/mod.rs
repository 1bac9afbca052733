//! Per-session frontend engine.
//!
//! One task per accepted connection. The session is a strictly sequential
//! state machine: a message is fully handled, including any backend I/O it
//! triggers, before the next one is read. Output toward the client is
//! serialized through the framed codec.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Sleep, sleep};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::auth::scram::ScramExchange;
use crate::auth::{self, AuthPhase, METADATA_APPLICATION_NAME, METADATA_USER};
use crate::error::{ErrorInfo, ProxyError, ProxyResult};
use crate::messages::response::{ReadyForQuery, TransactionStatus};
use crate::messages::startup::{Authentication, SslRequest};
use crate::messages::{BackendMessage, FrontendMessage, Oid};
use crate::router::QueryClass;
use crate::server::ProxyShared;

pub mod fanout;
pub mod query;
pub mod relay;

/// Clients that have not finished startup within this window are dropped.
const STARTUP_TIMEOUT_MILLIS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    AwaitingStartup,
    AuthenticationInProgress,
    ReadyForQuery,
    /// An extended-query error was reported; everything but Sync is
    /// discarded until the group ends.
    AwaitingSync,
}

/// Parse-created statement, session-scoped.
#[derive(Debug)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
    pub param_types: Vec<Oid>,
    pub class: QueryClass,
}

/// Bind-created portal, session-scoped.
#[derive(Debug)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub parameters: Vec<Option<Bytes>>,
    pub parameter_format_codes: Vec<i16>,
    pub result_format_codes: Vec<i16>,
}

/// Everything the engine tracks for one client connection.
pub struct SessionContext {
    pub socket_addr: SocketAddr,
    pub is_secure: bool,
    pub state: SessionState,
    /// Authenticated user; set once at startup, never reassigned.
    pub user: Option<String>,
    pub metadata: HashMap<String, String>,
    pub statements: BTreeMap<String, Arc<PreparedStatement>>,
    pub portals: BTreeMap<String, Arc<Portal>>,
    pub auth: AuthPhase,
}

impl SessionContext {
    pub fn new(socket_addr: SocketAddr, is_secure: bool) -> SessionContext {
        SessionContext {
            socket_addr,
            is_secure,
            state: SessionState::default(),
            user: None,
            metadata: HashMap::new(),
            statements: BTreeMap::new(),
            portals: BTreeMap::new(),
            auth: AuthPhase::NotStarted,
        }
    }
}

/// Frame codec carrying the session context, the same shape as a framed
/// server codec: decode frontend messages in, encode backend messages out.
pub struct SessionCodec {
    pub context: SessionContext,
}

impl SessionCodec {
    pub fn new(context: SessionContext) -> SessionCodec {
        SessionCodec { context }
    }
}

impl Decoder for SessionCodec {
    type Item = FrontendMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let awaiting_startup = self.context.state == SessionState::AwaitingStartup;
        FrontendMessage::decode(src, awaiting_startup)
    }
}

impl Encoder<BackendMessage> for SessionCodec {
    type Error = ProxyError;

    fn encode(
        &mut self,
        item: BackendMessage,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

/// Entry point for one accepted TCP connection.
pub async fn process_socket(
    mut tcp_socket: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    shared: Arc<ProxyShared>,
) -> ProxyResult<()> {
    let addr = tcp_socket.peer_addr()?;
    tcp_socket.set_nodelay(true)?;

    let startup_timeout = sleep(Duration::from_millis(STARTUP_TIMEOUT_MILLIS));
    tokio::pin!(startup_timeout);

    // negotiate the optional transport upgrade before framing
    let upgrade = tokio::select! {
        _ = &mut startup_timeout => return Ok(()),
        upgrade = negotiate_ssl(&mut tcp_socket, tls_acceptor.is_some()) => upgrade?,
    };

    if upgrade {
        // safe to unwrap: upgrade is only true when an acceptor exists
        let acceptor = tls_acceptor.unwrap();
        let tls_socket = tokio::select! {
            _ = &mut startup_timeout => return Ok(()),
            accepted = acceptor.accept(tcp_socket) => accepted?,
        };
        let mut socket = Framed::new(tls_socket, SessionCodec::new(SessionContext::new(addr, true)));
        do_process_socket(&mut socket, startup_timeout, &shared).await
    } else {
        let mut socket = Framed::new(tcp_socket, SessionCodec::new(SessionContext::new(addr, false)));
        do_process_socket(&mut socket, startup_timeout, &shared).await
    }
}

/// Peek for the encrypted-transport sentinel. When present it is consumed
/// and answered with a single `S` or `N`; `true` means the caller should
/// run the TLS handshake next.
async fn negotiate_ssl(socket: &mut TcpStream, ssl_supported: bool) -> ProxyResult<bool> {
    let mut buf = [0u8; SslRequest::BODY_SIZE];
    let n = socket.peek(&mut buf).await?;

    if n == buf.len() && SslRequest::is_ssl_request_packet(&buf) {
        socket.read_exact(&mut buf).await?;
        let reply = if ssl_supported {
            crate::messages::response::SslResponse::BYTE_ACCEPT
        } else {
            crate::messages::response::SslResponse::BYTE_REFUSE
        };
        socket.write_all(&[reply]).await?;
        Ok(ssl_supported)
    } else {
        // startup or cancel packet, handled by the framed codec
        Ok(false)
    }
}

pub(crate) async fn do_process_socket<S>(
    socket: &mut Framed<S, SessionCodec>,
    mut startup_timeout: Pin<&mut Sleep>,
    shared: &ProxyShared,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let in_startup = matches!(
            socket.codec().context.state,
            SessionState::AwaitingStartup | SessionState::AuthenticationInProgress
        );

        let msg = if in_startup {
            tokio::select! {
                _ = &mut startup_timeout => {
                    debug!("client did not finish startup in time");
                    return Ok(());
                },
                msg = socket.next() => msg,
            }
        } else {
            socket.next().await
        };

        match msg {
            Some(Ok(FrontendMessage::Terminate(_))) => {
                let _ = socket.close().await;
                return Ok(());
            }
            // cancellation is not supported; the side channel is closed
            Some(Ok(FrontendMessage::CancelRequest(_))) => {
                debug!("cancel request received, closing");
                let _ = socket.close().await;
                return Ok(());
            }
            Some(Ok(msg)) => {
                let wait_for_sync = match socket.codec().context.state {
                    SessionState::AwaitingSync => true,
                    _ => msg.is_extended_query(),
                };

                if let Err(e) = process_message(msg, socket, shared).await {
                    if process_error(socket, e, wait_for_sync).await? {
                        return Ok(());
                    }
                }
            }
            Some(Err(e)) => {
                // a decode failure is a protocol violation and always fatal
                process_error(socket, e, false).await?;
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

async fn process_message<S>(
    message: FrontendMessage,
    socket: &mut Framed<S, SessionCodec>,
    shared: &ProxyShared,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match socket.codec().context.state {
        SessionState::AwaitingStartup | SessionState::AuthenticationInProgress => {
            on_startup_message(socket, shared, message).await
        }
        // From the postgres docs: after an error in the extended protocol
        // the backend reads and discards messages until a Sync, then issues
        // ReadyForQuery and resumes normal processing.
        SessionState::AwaitingSync => {
            if let FrontendMessage::Sync(_) = message {
                query::on_sync(socket).await
            } else {
                Ok(())
            }
        }
        _ => match message {
            FrontendMessage::Query(q) => query::on_query(socket, shared, q).await,
            FrontendMessage::Parse(p) => query::on_parse(socket, p).await,
            FrontendMessage::Bind(b) => query::on_bind(socket, b).await,
            FrontendMessage::Describe(d) => query::on_describe(socket, d).await,
            FrontendMessage::Execute(e) => query::on_execute(socket, shared, e).await,
            FrontendMessage::Close(c) => query::on_close(socket, c).await,
            FrontendMessage::Flush(_) => socket.flush().await,
            FrontendMessage::Sync(_) => query::on_sync(socket).await,
            _ => Ok(()),
        },
    }
}

async fn on_startup_message<S>(
    socket: &mut Framed<S, SessionCodec>,
    shared: &ProxyShared,
    message: FrontendMessage,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match message {
        FrontendMessage::Startup(startup) => {
            auth::validate_startup(&startup)?;

            {
                let context = &mut socket.codec_mut().context;
                context
                    .metadata
                    .extend(startup.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
                context.user = startup.parameters.get(METADATA_USER).cloned();
            }

            if shared.credentials.is_empty() {
                // trust mode
                finish_authentication(socket).await
            } else {
                let context = &mut socket.codec_mut().context;
                context.state = SessionState::AuthenticationInProgress;
                context.auth = AuthPhase::SaslAdvertised;
                socket
                    .send(BackendMessage::Authentication(Authentication::SASL(vec![
                        "SCRAM-SHA-256".to_owned(),
                    ])))
                    .await
            }
        }
        FrontendMessage::PasswordMessageFamily(msg) => {
            let phase = std::mem::replace(
                &mut socket.codec_mut().context.auth,
                AuthPhase::NotStarted,
            );
            match phase {
                AuthPhase::SaslAdvertised => {
                    let initial = msg.into_sasl_initial_response()?;
                    if initial.auth_method != "SCRAM-SHA-256" {
                        return Err(ProxyError::UnsupportedSaslMechanism(initial.auth_method));
                    }
                    let data = initial.data.ok_or_else(|| {
                        ProxyError::InvalidScramMessage("empty client-first".to_owned())
                    })?;
                    let client_first = String::from_utf8_lossy(&data).into_owned();

                    let (user, secure) = {
                        let context = &socket.codec().context;
                        (
                            context.user.clone().ok_or(ProxyError::UserNameRequired)?,
                            context.is_secure,
                        )
                    };

                    let credential = shared.credentials.lookup(&user);
                    let mut exchange =
                        ScramExchange::new(&user, credential, secure, shared.cert_fingerprint);
                    let server_first = exchange.server_first(&client_first)?;

                    socket.codec_mut().context.auth = AuthPhase::SaslInProgress(exchange);
                    socket
                        .send(BackendMessage::Authentication(Authentication::SASLContinue(
                            Bytes::from(server_first),
                        )))
                        .await
                }
                AuthPhase::SaslInProgress(mut exchange) => {
                    let resp = msg.into_sasl_response()?;
                    let client_final = String::from_utf8_lossy(&resp.data).into_owned();
                    let server_final = exchange.server_final(&client_final)?;

                    socket.codec_mut().context.auth = AuthPhase::Complete;
                    socket
                        .feed(BackendMessage::Authentication(Authentication::SASLFinal(
                            Bytes::from(server_final),
                        )))
                        .await?;
                    finish_authentication(socket).await
                }
                _ => Err(ProxyError::OutOfOrderMessage("authentication")),
            }
        }
        _ => Err(ProxyError::OutOfOrderMessage("startup")),
    }
}

/// Emit `AuthenticationOk`, the parameter reports, a key-data pair and the
/// first `ReadyForQuery`, then move to the steady state.
async fn finish_authentication<S>(socket: &mut Framed<S, SessionCodec>) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (user, application_name) = {
        let context = &socket.codec().context;
        (
            context.user.clone().unwrap_or_default(),
            context.metadata.get(METADATA_APPLICATION_NAME).cloned(),
        )
    };

    socket
        .feed(BackendMessage::Authentication(Authentication::Ok))
        .await?;

    for (name, value) in auth::server_parameters(&user, application_name.as_deref()) {
        socket
            .feed(BackendMessage::ParameterStatus(
                crate::messages::startup::ParameterStatus::new(name, value),
            ))
            .await?;
    }

    socket
        .feed(BackendMessage::BackendKeyData(
            crate::messages::startup::BackendKeyData::new(
                std::process::id() as i32,
                rand::random(),
            ),
        ))
        .await?;

    socket
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
            TransactionStatus::Idle,
        )))
        .await?;

    socket.codec_mut().context.state = SessionState::ReadyForQuery;
    debug!(user = %user, "session authenticated");
    Ok(())
}

/// Report an error to the client. Returns `true` when the session must end.
async fn process_error<S>(
    socket: &mut Framed<S, SessionCodec>,
    error: ProxyError,
    wait_for_sync: bool,
) -> ProxyResult<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let error_info = ErrorInfo::from(&error);
    let is_fatal = error_info.is_fatal();

    socket
        .feed(BackendMessage::ErrorResponse(error_info.into()))
        .await?;

    if is_fatal {
        socket.flush().await?;
        socket.close().await?;
        return Ok(true);
    }

    if wait_for_sync {
        socket.codec_mut().context.state = SessionState::AwaitingSync;
    } else {
        socket.codec_mut().context.state = SessionState::ReadyForQuery;
        socket
            .feed(BackendMessage::ReadyForQuery(ReadyForQuery::new(
                TransactionStatus::Idle,
            )))
            .await?;
    }
    socket.flush().await?;

    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::auth::ScramClient;
    use crate::backend::endpoint::Endpoint;
    use crate::backend::{BackendCodec, BackendTls};
    use crate::credentials::CredentialStore;
    use crate::messages::extendedquery::{
        Bind, Close, Describe, Execute, Parse, Sync, TARGET_TYPE_BYTE_PORTAL,
        TARGET_TYPE_BYTE_STATEMENT,
    };
    use crate::messages::simplequery::Query;
    use crate::messages::startup::{
        PasswordMessageFamily, SASLInitialResponse, SASLResponse, Startup,
    };
    use crate::messages::terminate::Terminate;
    use tokio::io::DuplexStream;

    type TestClient = Framed<DuplexStream, BackendCodec>;

    fn shared_with(credentials: CredentialStore, writers: Vec<Endpoint>) -> Arc<ProxyShared> {
        Arc::new(ProxyShared {
            // nothing listens on discard, reads fail fast
            reader: Endpoint::parse("postgres://app@127.0.0.1:9").unwrap(),
            writers,
            backend_tls: BackendTls::plaintext(),
            credentials: Arc::new(credentials),
            cert_fingerprint: None,
            query_deadline: Duration::from_millis(500),
        })
    }

    fn spawn_session(
        shared: Arc<ProxyShared>,
    ) -> (TestClient, tokio::task::JoinHandle<ProxyResult<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();
            let mut socket =
                Framed::new(server, SessionCodec::new(SessionContext::new(addr, false)));
            let startup_timeout = sleep(Duration::from_secs(60));
            tokio::pin!(startup_timeout);
            do_process_socket(&mut socket, startup_timeout, &shared).await
        });
        (Framed::new(client, BackendCodec), handle)
    }

    async fn send_startup(client: &mut TestClient, user: &str) {
        let mut startup = Startup::default();
        startup
            .parameters
            .insert("user".to_owned(), user.to_owned());
        client
            .send(FrontendMessage::Startup(startup))
            .await
            .unwrap();
    }

    async fn read_until_ready(client: &mut TestClient) -> Vec<BackendMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = client.next().await {
            let msg = msg.unwrap();
            let done = matches!(msg, BackendMessage::ReadyForQuery(_));
            messages.push(msg);
            if done {
                break;
            }
        }
        messages
    }

    fn error_code(msg: &BackendMessage) -> &str {
        match msg {
            BackendMessage::ErrorResponse(e) => e
                .fields
                .iter()
                .find(|(code, _)| *code == b'C')
                .map(|(_, value)| value.as_str())
                .expect("error response without sqlstate"),
            other => panic!("expected error response, got {:?}", other),
        }
    }

    async fn trusted_session() -> (TestClient, tokio::task::JoinHandle<ProxyResult<()>>) {
        let (mut client, handle) = spawn_session(shared_with(CredentialStore::new(), vec![]));
        send_startup(&mut client, "alice").await;
        let _ = read_until_ready(&mut client).await;
        (client, handle)
    }

    #[tokio::test]
    async fn test_trust_mode_startup() {
        let (mut client, _handle) = spawn_session(shared_with(CredentialStore::new(), vec![]));
        send_startup(&mut client, "alice").await;

        let messages = read_until_ready(&mut client).await;
        assert!(matches!(
            messages[0],
            BackendMessage::Authentication(Authentication::Ok)
        ));
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, BackendMessage::BackendKeyData(_)))
        );
        assert!(messages.iter().any(|m| matches!(
            m,
            BackendMessage::ParameterStatus(p) if p.name == "session_authorization" && p.value == "alice"
        )));
        assert!(matches!(
            messages.last().unwrap(),
            BackendMessage::ReadyForQuery(r) if r.status == TransactionStatus::Idle
        ));
    }

    #[tokio::test]
    async fn test_startup_without_user_is_fatal() {
        let (mut client, _handle) = spawn_session(shared_with(CredentialStore::new(), vec![]));
        client
            .send(FrontendMessage::Startup(Startup::default()))
            .await
            .unwrap();

        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(error_code(&msg), "08P01");
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_scram_authentication_success() {
        let store =
            CredentialStore::from_plaintext(&[("alice".to_owned(), "wonderland".to_owned())]);
        let (mut client, _handle) = spawn_session(shared_with(store, vec![]));
        send_startup(&mut client, "alice").await;

        let msg = client.next().await.unwrap().unwrap();
        let BackendMessage::Authentication(Authentication::SASL(mechanisms)) = msg else {
            panic!("expected SASL advertisement, got {:?}", msg);
        };
        assert_eq!(mechanisms, vec!["SCRAM-SHA-256".to_owned()]);

        let mut scram = ScramClient::new("wonderland");
        client
            .send(FrontendMessage::PasswordMessageFamily(
                PasswordMessageFamily::SASLInitialResponse(SASLInitialResponse::new(
                    "SCRAM-SHA-256".to_owned(),
                    Some(scram.client_first_message().into_bytes().into()),
                )),
            ))
            .await
            .unwrap();

        let msg = client.next().await.unwrap().unwrap();
        let BackendMessage::Authentication(Authentication::SASLContinue(data)) = msg else {
            panic!("expected server-first, got {:?}", msg);
        };
        let client_final = scram
            .process_server_first(&String::from_utf8_lossy(&data))
            .unwrap();
        client
            .send(FrontendMessage::PasswordMessageFamily(
                PasswordMessageFamily::SASLResponse(SASLResponse::new(
                    client_final.into_bytes().into(),
                )),
            ))
            .await
            .unwrap();

        let messages = read_until_ready(&mut client).await;
        let BackendMessage::Authentication(Authentication::SASLFinal(data)) = &messages[0] else {
            panic!("expected server-final, got {:?}", messages[0]);
        };
        scram
            .verify_server_final(&String::from_utf8_lossy(data))
            .unwrap();
        assert!(matches!(
            messages[1],
            BackendMessage::Authentication(Authentication::Ok)
        ));
        assert!(matches!(
            messages.last().unwrap(),
            BackendMessage::ReadyForQuery(_)
        ));
    }

    #[tokio::test]
    async fn test_scram_wrong_password_is_fatal() {
        let store =
            CredentialStore::from_plaintext(&[("alice".to_owned(), "wonderland".to_owned())]);
        let (mut client, _handle) = spawn_session(shared_with(store, vec![]));
        send_startup(&mut client, "alice").await;

        let _ = client.next().await.unwrap().unwrap();
        let mut scram = ScramClient::new("rabbit");
        client
            .send(FrontendMessage::PasswordMessageFamily(
                PasswordMessageFamily::SASLInitialResponse(SASLInitialResponse::new(
                    "SCRAM-SHA-256".to_owned(),
                    Some(scram.client_first_message().into_bytes().into()),
                )),
            ))
            .await
            .unwrap();

        let msg = client.next().await.unwrap().unwrap();
        let BackendMessage::Authentication(Authentication::SASLContinue(data)) = msg else {
            panic!("expected server-first, got {:?}", msg);
        };
        let client_final = scram
            .process_server_first(&String::from_utf8_lossy(&data))
            .unwrap();
        client
            .send(FrontendMessage::PasswordMessageFamily(
                PasswordMessageFamily::SASLResponse(SASLResponse::new(
                    client_final.into_bytes().into(),
                )),
            ))
            .await
            .unwrap();

        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(error_code(&msg), "28P01");
        if let BackendMessage::ErrorResponse(e) = &msg {
            assert!(e.fields.contains(&(b'S', "FATAL".to_owned())));
        }
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_extended_query_describe_statement() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Parse(Parse::new(
                Some("q1".to_owned()),
                "SELECT id FROM t WHERE id = $1".to_owned(),
                vec![23],
            )))
            .await
            .unwrap();
        client
            .send(FrontendMessage::Describe(Describe::new(
                TARGET_TYPE_BYTE_STATEMENT,
                Some("q1".to_owned()),
            )))
            .await
            .unwrap();
        client
            .send(FrontendMessage::Sync(Sync))
            .await
            .unwrap();

        let messages = read_until_ready(&mut client).await;
        assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
        assert!(matches!(
            &messages[1],
            BackendMessage::ParameterDescription(pd) if pd.types == vec![23]
        ));
        assert!(matches!(messages[2], BackendMessage::NoData(_)));
        assert!(matches!(messages[3], BackendMessage::ReadyForQuery(_)));
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn test_bind_unknown_statement_discards_until_sync() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Bind(Bind::new(
                None,
                Some("missing".to_owned()),
                vec![],
                vec![],
                vec![],
            )))
            .await
            .unwrap();
        // discarded while the group is poisoned
        client
            .send(FrontendMessage::Describe(Describe::new(
                TARGET_TYPE_BYTE_PORTAL,
                None,
            )))
            .await
            .unwrap();
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();

        let messages = read_until_ready(&mut client).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(error_code(&messages[0]), "26000");
        assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn test_named_reparse_requires_close() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Parse(Parse::new(
                Some("q1".to_owned()),
                "SELECT 1".to_owned(),
                vec![],
            )))
            .await
            .unwrap();
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();
        let messages = read_until_ready(&mut client).await;
        assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));

        client
            .send(FrontendMessage::Parse(Parse::new(
                Some("q1".to_owned()),
                "SELECT 2".to_owned(),
                vec![],
            )))
            .await
            .unwrap();
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();
        let messages = read_until_ready(&mut client).await;
        assert_eq!(error_code(&messages[0]), "42P05");

        // close returns the name to the pool
        client
            .send(FrontendMessage::Close(Close::new(
                TARGET_TYPE_BYTE_STATEMENT,
                Some("q1".to_owned()),
            )))
            .await
            .unwrap();
        client
            .send(FrontendMessage::Parse(Parse::new(
                Some("q1".to_owned()),
                "SELECT 3".to_owned(),
                vec![],
            )))
            .await
            .unwrap();
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();
        let messages = read_until_ready(&mut client).await;
        assert!(matches!(messages[0], BackendMessage::CloseComplete(_)));
        assert!(matches!(messages[1], BackendMessage::ParseComplete(_)));
    }

    #[tokio::test]
    async fn test_unnamed_statement_is_rebindable() {
        let (mut client, _handle) = trusted_session().await;

        for sql in ["SELECT 1", "SELECT 2"] {
            client
                .send(FrontendMessage::Parse(Parse::new(
                    None,
                    sql.to_owned(),
                    vec![],
                )))
                .await
                .unwrap();
        }
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();

        let messages = read_until_ready(&mut client).await;
        assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
        assert!(matches!(messages[1], BackendMessage::ParseComplete(_)));
        assert!(matches!(messages[2], BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn test_empty_simple_query() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Query(Query::new("  ".to_owned())))
            .await
            .unwrap();
        let messages = read_until_ready(&mut client).await;
        assert!(matches!(
            messages[0],
            BackendMessage::EmptyQueryResponse(_)
        ));
        assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn test_unreachable_reader_is_recoverable() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Query(Query::new("SELECT 1".to_owned())))
            .await
            .unwrap();
        let messages = read_until_ready(&mut client).await;
        assert_eq!(error_code(&messages[0]), "08006");
        assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));

        // the session survives and answers the next request
        client
            .send(FrontendMessage::Query(Query::new(String::new())))
            .await
            .unwrap();
        let messages = read_until_ready(&mut client).await;
        assert!(matches!(
            messages[0],
            BackendMessage::EmptyQueryResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_write_without_writers_reports_08006() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Query(Query::new(
                "INSERT INTO t VALUES (1)".to_owned(),
            )))
            .await
            .unwrap();
        let messages = read_until_ready(&mut client).await;
        assert_eq!(error_code(&messages[0]), "08006");
        assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn test_execute_unknown_portal() {
        let (mut client, _handle) = trusted_session().await;

        client
            .send(FrontendMessage::Execute(Execute::new(
                Some("nope".to_owned()),
                0,
            )))
            .await
            .unwrap();
        client.send(FrontendMessage::Sync(Sync)).await.unwrap();

        let messages = read_until_ready(&mut client).await;
        assert_eq!(error_code(&messages[0]), "34000");
        assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn test_terminate_ends_session() {
        let (mut client, handle) = trusted_session().await;

        client
            .send(FrontendMessage::Terminate(Terminate))
            .await
            .unwrap();
        assert!(client.next().await.is_none());
        assert!(handle.await.unwrap().is_ok());
    }
}
