//! Result relay.
//!
//! Projects backend result traffic into frontend messages. Row values are
//! never re-encoded: the backend already produced the format each column
//! negotiated (text unless the portal asked for binary), so `DataRow`
//! payloads pass through verbatim and NULL stays the -1 length marker.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::{Portal, SessionCodec};
use crate::backend::{BackendConnection, with_deadline};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::data::FORMAT_CODE_TEXT;
use crate::messages::extendedquery::{Bind, Execute, Parse, Sync};
use crate::messages::simplequery::Query;
use crate::messages::{BackendMessage, FrontendMessage};

/// Relay one simple query from the reader. All columns are text in the
/// simple protocol, the field descriptions are normalized accordingly.
pub(crate) async fn relay_simple_query<S>(
    socket: &mut Framed<S, SessionCodec>,
    conn: &mut BackendConnection,
    sql: &str,
    deadline: tokio::time::Instant,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.send(FrontendMessage::Query(Query::new(sql.to_owned())))
        .await?;

    relay_results(socket, conn, deadline, true).await
}

/// Relay one portal execution from the reader over the extended protocol.
/// The portal's parameters and format codes are forwarded as bound, so the
/// backend produces exactly the representation the client negotiated.
pub(crate) async fn relay_portal<S>(
    socket: &mut Framed<S, SessionCodec>,
    conn: &mut BackendConnection,
    portal: &Portal,
    max_rows: i32,
    deadline: tokio::time::Instant,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.send(FrontendMessage::Parse(Parse::new(
        None,
        portal.statement.sql.clone(),
        portal.statement.param_types.clone(),
    )))
    .await?;
    conn.send(FrontendMessage::Bind(Bind::new(
        None,
        None,
        portal.parameter_format_codes.clone(),
        portal.parameters.clone(),
        portal.result_format_codes.clone(),
    )))
    .await?;
    conn.send(FrontendMessage::Execute(Execute::new(None, max_rows)))
        .await?;
    conn.send(FrontendMessage::Sync(Sync)).await?;

    relay_results(socket, conn, deadline, false).await
}

/// Pump backend messages to the client until the backend reports
/// ReadyForQuery. Field descriptions keep table oid, column number, type
/// oid, size and modifier from the backend; in the simple protocol the
/// format code is forced to text.
async fn relay_results<S>(
    socket: &mut Framed<S, SessionCodec>,
    conn: &mut BackendConnection,
    deadline: tokio::time::Instant,
    force_text: bool,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut error: Option<ProxyError> = None;

    loop {
        let message = with_deadline(deadline, conn.receive()).await?;
        match message {
            BackendMessage::RowDescription(mut rd) => {
                if force_text {
                    for field in rd.fields.iter_mut() {
                        field.format_code = FORMAT_CODE_TEXT;
                    }
                }
                socket.feed(BackendMessage::RowDescription(rd)).await?;
            }
            BackendMessage::DataRow(row) => {
                socket.feed(BackendMessage::DataRow(row)).await?;
            }
            BackendMessage::CommandComplete(cc) => {
                socket.feed(BackendMessage::CommandComplete(cc)).await?;
            }
            BackendMessage::PortalSuspended(suspended) => {
                // row cap reached; reported in lieu of CommandComplete
                socket.feed(BackendMessage::PortalSuspended(suspended)).await?;
            }
            BackendMessage::EmptyQueryResponse(empty) => {
                socket.feed(BackendMessage::EmptyQueryResponse(empty)).await?;
            }
            BackendMessage::NoticeResponse(notice) => {
                socket.feed(BackendMessage::NoticeResponse(notice)).await?;
            }
            // backend bookkeeping with no frontend counterpart here
            BackendMessage::ParseComplete(_)
            | BackendMessage::BindComplete(_)
            | BackendMessage::NoData(_)
            | BackendMessage::ParameterStatus(_)
            | BackendMessage::BackendKeyData(_) => {}
            BackendMessage::ErrorResponse(resp) => {
                error.get_or_insert((&resp).into());
            }
            BackendMessage::ReadyForQuery(_) => break,
            _ => return Err(ProxyError::BackendProtocol("result relay")),
        }
    }

    match error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
